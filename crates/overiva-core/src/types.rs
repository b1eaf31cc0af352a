//! Core types for multichannel source separation
//!
//! Time-domain signals are stored channel-major (`Vec<Vec<f64>>`, one
//! inner vector per microphone or source). Time-frequency data lives in a
//! [`Spectrogram`], a dense `frames × frequencies × channels` tensor that
//! mirrors the layout the separation algorithms iterate over.
//!
//! ```text
//!            channel
//!           /
//!   frame  +------> frequency bin
//!          |
//!          v
//! ```

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Type alias for complex numbers using f64 precision
pub type Complex = Complex64;

/// A real-valued multichannel signal, one `Vec` per channel
pub type MultiChannel = Vec<Vec<f64>>;

/// Result type for separation operations
pub type BssResult<T> = Result<T, BssError>;

/// Errors that can occur during analysis, separation or evaluation
#[derive(Debug, thiserror::Error)]
pub enum BssError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Singular matrix encountered at frequency bin {freq}")]
    SingularMatrix { freq: usize },

    #[error("Non-finite values produced during {stage}")]
    NonFinite { stage: String },

    #[error("Underdetermined problem: {n_src} sources but only {n_chan} channels")]
    Underdetermined { n_src: usize, n_chan: usize },

    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("WAV error: {0}")]
    Wav(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dense STFT tensor with shape `(n_frames, n_freq, n_chan)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrogram {
    n_frames: usize,
    n_freq: usize,
    n_chan: usize,
    data: Vec<Complex>,
}

impl Spectrogram {
    /// Create an all-zero tensor.
    pub fn zeros(n_frames: usize, n_freq: usize, n_chan: usize) -> Self {
        Self {
            n_frames,
            n_freq,
            n_chan,
            data: vec![Complex::new(0.0, 0.0); n_frames * n_freq * n_chan],
        }
    }

    /// Wrap an existing buffer laid out frame-major, then frequency, then channel.
    pub fn from_vec(
        n_frames: usize,
        n_freq: usize,
        n_chan: usize,
        data: Vec<Complex>,
    ) -> BssResult<Self> {
        let expected = n_frames * n_freq * n_chan;
        if data.len() != expected {
            return Err(BssError::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            n_frames,
            n_freq,
            n_chan,
            data,
        })
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_freq(&self) -> usize {
        self.n_freq
    }

    pub fn n_chan(&self) -> usize {
        self.n_chan
    }

    /// `(n_frames, n_freq, n_chan)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_frames, self.n_freq, self.n_chan)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn index(&self, frame: usize, freq: usize, chan: usize) -> usize {
        (frame * self.n_freq + freq) * self.n_chan + chan
    }

    #[inline]
    pub fn get(&self, frame: usize, freq: usize, chan: usize) -> Complex {
        self.data[self.index(frame, freq, chan)]
    }

    #[inline]
    pub fn set(&mut self, frame: usize, freq: usize, chan: usize, value: Complex) {
        let idx = self.index(frame, freq, chan);
        self.data[idx] = value;
    }

    /// All channels of one time-frequency point.
    pub fn bin(&self, frame: usize, freq: usize) -> &[Complex] {
        let start = self.index(frame, freq, 0);
        &self.data[start..start + self.n_chan]
    }

    pub fn bin_mut(&mut self, frame: usize, freq: usize) -> &mut [Complex] {
        let start = self.index(frame, freq, 0);
        &mut self.data[start..start + self.n_chan]
    }

    /// Copy out the `(n_chan, n_frames)` observation matrix of one frequency bin.
    pub fn freq_slice(&self, freq: usize) -> Vec<Vec<Complex>> {
        let mut out = vec![Vec::with_capacity(self.n_frames); self.n_chan];
        for t in 0..self.n_frames {
            for (c, v) in self.bin(t, freq).iter().enumerate() {
                out[c].push(*v);
            }
        }
        out
    }

    /// Copy out one channel as a `(n_frames, n_freq)` matrix.
    pub fn channel(&self, chan: usize) -> Vec<Vec<Complex>> {
        (0..self.n_frames)
            .map(|t| (0..self.n_freq).map(|f| self.get(t, f, chan)).collect())
            .collect()
    }

    /// Keep the listed channels, in the given order.
    pub fn select_channels(&self, channels: &[usize]) -> BssResult<Self> {
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.n_chan) {
            return Err(BssError::InvalidParameter(format!(
                "channel {} out of range (n_chan = {})",
                bad, self.n_chan
            )));
        }
        let mut out = Self::zeros(self.n_frames, self.n_freq, channels.len());
        for t in 0..self.n_frames {
            for f in 0..self.n_freq {
                for (k, &c) in channels.iter().enumerate() {
                    out.set(t, f, k, self.get(t, f, c));
                }
            }
        }
        Ok(out)
    }

    /// True when every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|c| c.re.is_finite() && c.im.is_finite())
    }

    pub fn as_slice(&self) -> &[Complex] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_layout() {
        let mut s = Spectrogram::zeros(2, 3, 4);
        s.set(1, 2, 3, Complex::new(5.0, -1.0));
        assert_eq!(s.get(1, 2, 3), Complex::new(5.0, -1.0));
        assert_eq!(s.bin(1, 2)[3], Complex::new(5.0, -1.0));
        assert_eq!(s.as_slice()[s.as_slice().len() - 1], Complex::new(5.0, -1.0));
    }

    #[test]
    fn test_from_vec_checks_length() {
        let err = Spectrogram::from_vec(2, 2, 2, vec![Complex::new(0.0, 0.0); 7]).unwrap_err();
        assert!(matches!(err, BssError::DimensionMismatch { expected: 8, actual: 7 }));
    }

    #[test]
    fn test_select_channels() {
        let mut s = Spectrogram::zeros(1, 1, 3);
        for c in 0..3 {
            s.set(0, 0, c, Complex::new(c as f64, 0.0));
        }
        let sel = s.select_channels(&[2, 0]).unwrap();
        assert_eq!(sel.n_chan(), 2);
        assert_eq!(sel.get(0, 0, 0).re, 2.0);
        assert_eq!(sel.get(0, 0, 1).re, 0.0);
        assert!(s.select_channels(&[3]).is_err());
    }

    #[test]
    fn test_freq_slice_shape() {
        let s = Spectrogram::zeros(5, 4, 2);
        let x = s.freq_slice(1);
        assert_eq!(x.len(), 2);
        assert_eq!(x[0].len(), 5);
    }

    #[test]
    fn test_error_display() {
        let err = BssError::Underdetermined { n_src: 3, n_chan: 2 };
        assert!(err.to_string().contains("3 sources"));
    }
}
