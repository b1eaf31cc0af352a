//! Shoebox room acoustics by the image-source method
//!
//! A rectangular room with uniform wall absorption. Every source is
//! mirrored across the walls up to `max_order` reflections; each image
//! contributes a fractionally delayed impulse attenuated by spherical
//! spreading and by the wall reflection coefficient `√(1 − α)` per bounce.
//!
//! ```text
//!   image (n=-1,q=1)   │  room  │  image (n=1,q=1)
//!        ◦             │   •    │        ◦
//!   x' = -x_s - 2L     │  x_s   │   x' = 2L - x_s
//! ```
//!
//! Room impulse responses carry a constant lead of `FRAC_DELAY_LEN / 2`
//! samples from the interpolation kernel; all sources and microphones share
//! it.

use std::f64::consts::PI;

use num_complex::Complex64;
use rustfft::FftPlanner;

use overiva_core::layout::Point;
use overiva_core::mixing::Premix;

use crate::error::{SimError, SimResult};

/// Speed of sound in m/s.
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Length of the windowed-sinc fractional delay kernel.
pub const FRAC_DELAY_LEN: usize = 81;

/// A point source and the signal it emits.
#[derive(Debug, Clone)]
pub struct SoundSource {
    pub position: Point,
    pub signal: Vec<f64>,
}

/// Rectangular room with `[0, dim]` extent on each axis.
#[derive(Debug, Clone)]
pub struct ShoeBox {
    dim: Point,
    fs: f64,
    absorption: f64,
    max_order: usize,
    c: f64,
    sources: Vec<SoundSource>,
    mics: Vec<Point>,
    /// `rir[mic][source]`
    rir: Option<Vec<Vec<Vec<f64>>>>,
}

/// Mirror image of a source with the number of wall reflections it took.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageSource {
    pub position: Point,
    pub reflections: u32,
}

impl ShoeBox {
    /// `absorption` is the energy absorption coefficient of every wall.
    pub fn new(dim: Point, fs: u32, absorption: f64, max_order: usize) -> SimResult<Self> {
        if dim.iter().any(|d| !(*d > 0.0 && d.is_finite())) {
            return Err(SimError::InvalidRoom(format!("dimensions must be positive, got {dim:?}")));
        }
        if fs == 0 {
            return Err(SimError::InvalidRoom("sampling rate must be positive".into()));
        }
        if !(0.0..=1.0).contains(&absorption) {
            return Err(SimError::InvalidRoom(format!(
                "absorption must be in [0, 1], got {absorption}"
            )));
        }
        Ok(Self {
            dim,
            fs: fs as f64,
            absorption,
            max_order,
            c: SPEED_OF_SOUND,
            sources: Vec::new(),
            mics: Vec::new(),
            rir: None,
        })
    }

    pub fn dim(&self) -> Point {
        self.dim
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn sources(&self) -> &[SoundSource] {
        &self.sources
    }

    pub fn mics(&self) -> &[Point] {
        &self.mics
    }

    fn check_inside(&self, p: &Point) -> SimResult<()> {
        let inside = p
            .iter()
            .zip(&self.dim)
            .all(|(x, d)| x.is_finite() && *x >= 0.0 && x <= d);
        if inside {
            Ok(())
        } else {
            Err(SimError::OutsideRoom {
                position: *p,
                dim: self.dim,
            })
        }
    }

    pub fn add_source(&mut self, position: Point, signal: Vec<f64>) -> SimResult<()> {
        self.check_inside(&position)?;
        self.sources.push(SoundSource { position, signal });
        self.rir = None;
        Ok(())
    }

    pub fn add_microphone_array(&mut self, mics: &[Point]) -> SimResult<()> {
        for m in mics {
            self.check_inside(m)?;
        }
        self.mics.extend_from_slice(mics);
        self.rir = None;
        Ok(())
    }

    /// All images of `source` with at most `max_order` reflections.
    pub fn image_sources(&self, source: &Point) -> Vec<ImageSource> {
        let order = self.max_order as i64;
        let range = order / 2 + 1;

        // per-axis candidates: (coordinate, reflections)
        let axis = |k: usize| -> Vec<(f64, u32)> {
            let mut out = Vec::new();
            for n in -range..=range {
                for q in 0..2i64 {
                    let refl = (2 * n - q).unsigned_abs();
                    if refl as i64 > order {
                        continue;
                    }
                    let sign = if q == 0 { 1.0 } else { -1.0 };
                    out.push((sign * source[k] + 2.0 * n as f64 * self.dim[k], refl as u32));
                }
            }
            out
        };
        let (ax, ay, az) = (axis(0), axis(1), axis(2));

        let mut images = Vec::new();
        for &(x, rx) in &ax {
            for &(y, ry) in &ay {
                if (rx + ry) as i64 > order {
                    continue;
                }
                for &(z, rz) in &az {
                    let reflections = rx + ry + rz;
                    if reflections as i64 <= order {
                        images.push(ImageSource {
                            position: [x, y, z],
                            reflections,
                        });
                    }
                }
            }
        }
        images
    }

    /// Impulse response from `source` to `mic`.
    fn impulse_response(&self, source: &Point, mic: &Point, kernel_window: &[f64]) -> Vec<f64> {
        let images = self.image_sources(source);
        let reflection = (1.0 - self.absorption).sqrt();
        let half = (FRAC_DELAY_LEN / 2) as f64;

        let taps: Vec<(f64, f64)> = images
            .iter()
            .map(|img| {
                let d = distance(&img.position, mic).max(1e-3);
                let delay = d / self.c * self.fs;
                let gain = reflection.powi(img.reflections as i32) / (4.0 * PI * d);
                (delay, gain)
            })
            .collect();
        let max_delay = taps.iter().map(|(t, _)| *t).fold(0.0, f64::max);
        let mut rir = vec![0.0; max_delay.floor() as usize + FRAC_DELAY_LEN + 1];

        for (delay, gain) in taps {
            if gain == 0.0 {
                continue;
            }
            let start = delay.floor() as usize;
            let frac = delay - delay.floor();
            for (k, w) in kernel_window.iter().enumerate() {
                rir[start + k] += gain * w * sinc(k as f64 - half - frac);
            }
        }
        rir
    }

    /// Compute all impulse responses, `rir[mic][source]`.
    pub fn compute_rir(&mut self) {
        let window = hann_symmetric(FRAC_DELAY_LEN);
        let rir = self
            .mics
            .iter()
            .map(|m| {
                self.sources
                    .iter()
                    .map(|s| self.impulse_response(&s.position, m, &window))
                    .collect()
            })
            .collect();
        self.rir = Some(rir);
    }

    /// Impulse response from source `src` to microphone `mic`, once computed.
    pub fn rir(&self, mic: usize, src: usize) -> Option<&[f64]> {
        self.rir
            .as_ref()
            .and_then(|r| r.get(mic))
            .and_then(|row| row.get(src))
            .map(|h| h.as_slice())
    }

    /// Image of every source at every microphone, `[source][mic][sample]`.
    ///
    /// All outputs share the length of the longest convolution.
    pub fn simulate(&mut self) -> SimResult<Premix> {
        if self.sources.is_empty() || self.mics.is_empty() {
            return Err(SimError::InvalidRoom(
                "the room needs at least one source and one microphone".into(),
            ));
        }
        if self.rir.is_none() {
            self.compute_rir();
        }
        let rir = self
            .rir
            .as_ref()
            .ok_or_else(|| SimError::InvalidRoom("impulse responses unavailable".into()))?;

        let max_sig = self.sources.iter().map(|s| s.signal.len()).max().unwrap_or(0);
        let max_rir = rir.iter().flatten().map(|h| h.len()).max().unwrap_or(0);
        if max_sig == 0 {
            return Err(SimError::InvalidRoom("all source signals are empty".into()));
        }
        let out_len = max_sig + max_rir - 1;
        let n_fft = out_len.next_power_of_two();

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n_fft);
        let inverse = planner.plan_fft_inverse(n_fft);
        let spectrum = |x: &[f64]| -> Vec<Complex64> {
            let mut buf = vec![Complex64::new(0.0, 0.0); n_fft];
            for (b, v) in buf.iter_mut().zip(x) {
                b.re = *v;
            }
            forward.process(&mut buf);
            buf
        };

        let mut premix = Vec::with_capacity(self.sources.len());
        for (s, source) in self.sources.iter().enumerate() {
            let sig_spec = spectrum(&source.signal);
            let mut per_mic = Vec::with_capacity(self.mics.len());
            for mic_rirs in rir.iter() {
                let h = spectrum(&mic_rirs[s]);
                let mut buf: Vec<Complex64> =
                    sig_spec.iter().zip(&h).map(|(a, b)| a * b).collect();
                inverse.process(&mut buf);
                let scale = 1.0 / n_fft as f64;
                per_mic.push(buf[..out_len].iter().map(|c| c.re * scale).collect());
            }
            premix.push(per_mic);
        }
        tracing::debug!(
            n_sources = self.sources.len(),
            n_mics = self.mics.len(),
            n_samples = out_len,
            "room simulated"
        );
        Ok(premix)
    }
}

fn distance(a: &Point, b: &Point) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn hann_symmetric(n: usize) -> Vec<f64> {
    (0..n)
        .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f64 / (n - 1) as f64).cos())
        .collect()
}
