//! Scale restoration by projection back onto a reference microphone
//!
//! IVA leaves the scale of each output arbitrary per frequency. Projection
//! back picks, for every output and bin, the complex gain that best
//! explains the reference channel in the least-squares sense:
//!
//! ```text
//! a_f = Σ_t ref(t,f) conj(Y(t,f)) / Σ_t |Y(t,f)|²
//! ```

use crate::types::{BssError, BssResult, Complex, Spectrogram};

/// Per-output, per-frequency scales as `scales[chan][freq]`.
///
/// Bins where an output is identically zero get a scale of one.
pub fn projection_back_scales(
    y: &Spectrogram,
    reference: &Spectrogram,
    ref_chan: usize,
) -> BssResult<Vec<Vec<Complex>>> {
    if ref_chan >= reference.n_chan() {
        return Err(BssError::InvalidParameter(format!(
            "reference channel {} out of range (n_chan = {})",
            ref_chan,
            reference.n_chan()
        )));
    }
    if y.n_frames() != reference.n_frames() || y.n_freq() != reference.n_freq() {
        return Err(BssError::DimensionMismatch {
            expected: reference.n_frames() * reference.n_freq(),
            actual: y.n_frames() * y.n_freq(),
        });
    }

    let (n_frames, n_freq, n_chan) = y.shape();
    let mut scales = vec![vec![Complex::new(1.0, 0.0); n_freq]; n_chan];
    for f in 0..n_freq {
        let mut num = vec![Complex::new(0.0, 0.0); n_chan];
        let mut den = vec![0.0; n_chan];
        for t in 0..n_frames {
            let r = reference.get(t, f, ref_chan);
            for (c, v) in y.bin(t, f).iter().enumerate() {
                num[c] += r * v.conj();
                den[c] += v.norm_sqr();
            }
        }
        for c in 0..n_chan {
            if den[c] > 0.0 {
                scales[c][f] = num[c] / den[c];
            }
        }
    }
    Ok(scales)
}

/// Rescale every output of `y` onto channel `ref_chan` of `reference`.
pub fn projection_back(
    y: &Spectrogram,
    reference: &Spectrogram,
    ref_chan: usize,
) -> BssResult<Spectrogram> {
    let scales = projection_back_scales(y, reference, ref_chan)?;
    let mut out = y.clone();
    for t in 0..out.n_frames() {
        for f in 0..out.n_freq() {
            for (c, v) in out.bin_mut(t, f).iter_mut().enumerate() {
                *v *= scales[c][f];
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_recovers_complex_gain() {
        let (n_frames, n_freq) = (16, 3);
        let mut y = Spectrogram::zeros(n_frames, n_freq, 1);
        let mut x = Spectrogram::zeros(n_frames, n_freq, 2);
        let gain = Complex::new(0.5, -2.0);
        for t in 0..n_frames {
            for f in 0..n_freq {
                let v = Complex::new((t as f64).sin(), (t * f) as f64 * 0.1);
                y.set(t, f, 0, v);
                x.set(t, f, 1, v * gain);
            }
        }
        let z = projection_back(&y, &x, 1).unwrap();
        for t in 0..n_frames {
            for f in 0..n_freq {
                let d = z.get(t, f, 0) - x.get(t, f, 1);
                assert!(d.norm() < 1e-12);
            }
        }
    }

    #[test]
    fn test_zero_output_keeps_unit_scale() {
        let y = Spectrogram::zeros(4, 2, 2);
        let mut x = Spectrogram::zeros(4, 2, 1);
        x.set(0, 0, 0, Complex::new(1.0, 0.0));
        let scales = projection_back_scales(&y, &x, 0).unwrap();
        assert_relative_eq!(scales[1][0].re, 1.0);
        assert_relative_eq!(scales[1][0].im, 0.0);
    }

    #[test]
    fn test_rejects_bad_reference() {
        let y = Spectrogram::zeros(4, 2, 1);
        let x = Spectrogram::zeros(4, 2, 1);
        assert!(projection_back(&y, &x, 1).is_err());
        let short = Spectrogram::zeros(3, 2, 1);
        assert!(projection_back(&y, &short, 0).is_err());
    }
}
