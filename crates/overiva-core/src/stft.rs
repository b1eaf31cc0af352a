//! Short-time Fourier transform analysis and overlap-add synthesis
//!
//! Multichannel time-frequency front end of the separation pipeline. The
//! analysis produces a [`Spectrogram`] with `frame_size / 2 + 1` one-sided
//! bins per frame; the synthesis inverts it by overlap-add with a
//! synthesis window derived from the analysis window so that analysis
//! followed by synthesis is the identity up to a fixed delay.
//!
//! ```text
//! x[n] ──┬── frame 0 ──[w_a]── FFT ──┐
//!        ├── frame 1 ──[w_a]── FFT ──┼── Spectrogram ── IFFT ──[w_s]── OLA ── y[n] = x[n - (N - hop)]
//!        └── ...                      ┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use overiva_core::stft::{StftConfig, Window};
//!
//! let config = StftConfig::new(256, 128, Window::Hann).unwrap();
//! let x: Vec<f64> = (0..4096).map(|i| (i as f64 * 0.05).sin()).collect();
//! let spec = config.analysis(&[x.clone()]).unwrap();
//! let y = config.synthesis(&spec);
//! let d = config.synthesis_delay();
//! assert!((y[0][2000 + d] - x[2000]).abs() < 1e-9);
//! ```

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::types::{BssError, BssResult, Complex, Spectrogram};

/// Analysis window shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    /// Periodic Hann window, `0.5 (1 - cos(2πn/N))`
    #[default]
    Hann,
    Hamming,
    Blackman,
    Rectangular,
}

impl Window {
    /// Periodic window of length `size`.
    pub fn generate(self, size: usize) -> Vec<f64> {
        let n = size as f64;
        (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / n;
                match self {
                    Window::Hann => 0.5 * (1.0 - x.cos()),
                    Window::Hamming => 0.54 - 0.46 * x.cos(),
                    Window::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                    Window::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

/// Synthesis window giving perfect reconstruction for overlap-add with `hop`.
///
/// `w_s[n] = w_a[n] / Σ_k w_a[(n + k·hop) mod N]²`
pub fn compute_synthesis_window(analysis: &[f64], hop: usize) -> Vec<f64> {
    let n = analysis.len();
    let mut norm = vec![0.0; n];
    for (i, slot) in norm.iter_mut().enumerate() {
        let mut k = i % hop;
        while k < n {
            *slot += analysis[k] * analysis[k];
            k += hop;
        }
    }
    analysis
        .iter()
        .zip(&norm)
        .map(|(w, s)| if *s > 1e-15 { w / s } else { 0.0 })
        .collect()
}

/// STFT configuration shared by analysis and synthesis.
#[derive(Clone)]
pub struct StftConfig {
    frame_size: usize,
    hop: usize,
    window: Window,
    analysis_window: Vec<f64>,
    synthesis_window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for StftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StftConfig")
            .field("frame_size", &self.frame_size)
            .field("hop", &self.hop)
            .field("window", &self.window)
            .finish()
    }
}

impl StftConfig {
    /// `frame_size` must be even and at least 4; `hop` must be in `1..=frame_size`.
    pub fn new(frame_size: usize, hop: usize, window: Window) -> BssResult<Self> {
        if frame_size < 4 || frame_size % 2 != 0 {
            return Err(BssError::InvalidParameter(format!(
                "frame size must be even and >= 4, got {}",
                frame_size
            )));
        }
        if hop == 0 || hop > frame_size {
            return Err(BssError::InvalidParameter(format!(
                "hop must be in 1..={}, got {}",
                frame_size, hop
            )));
        }
        let analysis_window = window.generate(frame_size);
        let synthesis_window = compute_synthesis_window(&analysis_window, hop);
        let mut planner = FftPlanner::new();
        Ok(Self {
            frame_size,
            hop,
            window,
            analysis_window,
            synthesis_window,
            forward: planner.plan_fft_forward(frame_size),
            inverse: planner.plan_fft_inverse(frame_size),
        })
    }

    /// Half-overlap Hann configuration used throughout the experiments.
    pub fn half_overlap(frame_size: usize) -> BssResult<Self> {
        Self::new(frame_size, frame_size / 2, Window::Hann)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn n_freq(&self) -> usize {
        self.frame_size / 2 + 1
    }

    pub fn analysis_window(&self) -> &[f64] {
        &self.analysis_window
    }

    pub fn synthesis_window(&self) -> &[f64] {
        &self.synthesis_window
    }

    /// Delay, in samples, between an input and its resynthesis.
    pub fn synthesis_delay(&self) -> usize {
        self.frame_size - self.hop
    }

    /// Number of full frames for a signal of `n_samples`.
    pub fn n_frames(&self, n_samples: usize) -> usize {
        if n_samples < self.frame_size {
            0
        } else {
            (n_samples - self.frame_size) / self.hop + 1
        }
    }

    /// Forward STFT of channel-major signals of equal length.
    pub fn analysis(&self, signals: &[Vec<f64>]) -> BssResult<Spectrogram> {
        let n_chan = signals.len();
        let n_samples = signals.first().map_or(0, |s| s.len());
        if let Some(bad) = signals.iter().find(|s| s.len() != n_samples) {
            return Err(BssError::DimensionMismatch {
                expected: n_samples,
                actual: bad.len(),
            });
        }
        let n_frames = self.n_frames(n_samples);
        let n_freq = self.n_freq();
        let mut out = Spectrogram::zeros(n_frames, n_freq, n_chan);

        let mut buffer = vec![Complex::new(0.0, 0.0); self.frame_size];
        let mut scratch =
            vec![Complex::new(0.0, 0.0); self.forward.get_inplace_scratch_len()];

        for (c, signal) in signals.iter().enumerate() {
            for t in 0..n_frames {
                let start = t * self.hop;
                for (i, slot) in buffer.iter_mut().enumerate() {
                    *slot = Complex::new(signal[start + i] * self.analysis_window[i], 0.0);
                }
                self.forward.process_with_scratch(&mut buffer, &mut scratch);
                for f in 0..n_freq {
                    out.set(t, f, c, buffer[f]);
                }
            }
        }
        Ok(out)
    }

    /// Inverse STFT by weighted overlap-add, returning `n_chan` signals of
    /// `n_frames · hop` samples delayed by [`synthesis_delay`](Self::synthesis_delay).
    pub fn synthesis(&self, spec: &Spectrogram) -> Vec<Vec<f64>> {
        let (n_frames, n_freq, n_chan) = spec.shape();
        let n = self.frame_size;
        let out_len = n_frames * self.hop;
        let delay = self.synthesis_delay();
        let mut output = vec![vec![0.0; out_len]; n_chan];

        let mut buffer = vec![Complex::new(0.0, 0.0); n];
        let mut scratch =
            vec![Complex::new(0.0, 0.0); self.inverse.get_inplace_scratch_len()];
        let scale = 1.0 / n as f64;

        for (c, out) in output.iter_mut().enumerate() {
            for t in 0..n_frames {
                // Rebuild the full Hermitian spectrum from the one-sided bins
                for f in 0..n_freq.min(n / 2 + 1) {
                    buffer[f] = spec.get(t, f, c);
                }
                for f in 1..n / 2 {
                    buffer[n - f] = buffer[f].conj();
                }
                buffer[0].im = 0.0;
                buffer[n / 2].im = 0.0;
                self.inverse.process_with_scratch(&mut buffer, &mut scratch);

                let start = t * self.hop + delay;
                for i in 0..n {
                    let pos = start + i;
                    if pos >= out_len {
                        break;
                    }
                    out[pos] += buffer[i].re * scale * self.synthesis_window[i];
                }
            }
        }
        output
    }
}
