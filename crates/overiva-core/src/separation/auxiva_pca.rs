//! AuxIVA on a PCA-reduced mixture
//!
//! Each frequency bin is projected onto the `n_src` principal eigenvectors
//! of its spatial covariance, the reduced determined problem is solved with
//! AuxIVA, and the outputs are projected back onto the first microphone of
//! the original mixture.

use crate::linalg::{covariance, hermitian_eigen};
use crate::types::{BssError, BssResult, Complex, Spectrogram};

use super::{check_problem, overiva, projection_back, Callback, OverIvaOptions};

/// Reduce `x` to its `n_src` principal components per frequency bin.
pub fn pca_reduce(x: &Spectrogram, n_src: usize) -> BssResult<Spectrogram> {
    check_problem(x, n_src)?;
    let (n_frames, n_freq, n_chan) = x.shape();
    let mut out = Spectrogram::zeros(n_frames, n_freq, n_src);
    for f in 0..n_freq {
        let xf = x.freq_slice(f);
        let (_, vectors) = hermitian_eigen(&covariance(&xf));
        for k in 0..n_src {
            // eigenvalues are ascending, so the strongest component is last
            let col = vectors.column(n_chan - 1 - k);
            for t in 0..n_frames {
                let v: Complex = col.iter().zip(&xf).map(|(e, xc)| e.conj() * xc[t]).sum();
                out.set(t, f, k, v);
            }
        }
    }
    Ok(out)
}

/// Hand reduced-domain outputs to `cb`, projected back onto `x` if requested.
fn relay_outputs(
    y: &Spectrogram,
    x: &Spectrogram,
    proj_back: bool,
    cb: &mut dyn FnMut(&Spectrogram),
) -> BssResult<()> {
    if proj_back {
        cb(&projection_back(y, x, 0)?);
    } else {
        cb(y);
    }
    Ok(())
}

/// Separate `n_src` sources by PCA reduction followed by AuxIVA.
pub fn auxiva_pca(
    x: &Spectrogram,
    n_src: usize,
    options: &OverIvaOptions,
    callback: Option<Callback<'_>>,
) -> BssResult<Spectrogram> {
    let reduced = pca_reduce(x, n_src)?;
    let inner = OverIvaOptions {
        proj_back: false,
        ..options.clone()
    };

    let y = match callback {
        Some(cb) => {
            let mut relay_error: Option<BssError> = None;
            let mut relay = |y: &Spectrogram| {
                if relay_error.is_none() {
                    relay_error = relay_outputs(y, x, options.proj_back, cb).err();
                }
            };
            let y = overiva(&reduced, n_src, &inner, Some(&mut relay))?;
            if let Some(e) = relay_error {
                return Err(e);
            }
            y
        }
        None => overiva(&reduced, n_src, &inner, None)?,
    };

    if options.proj_back {
        projection_back(&y, x, 0)
    } else {
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{analysis, best_error, images, mix, sources};
    use super::*;

    #[test]
    fn test_pca_reduce_keeps_energy_of_rank_deficient_mixture() {
        let s = sources(2, 8000, 21);
        let a = vec![vec![1.0, 0.4], vec![0.3, 1.0], vec![0.6, 0.6]];
        let (_, x) = analysis(&mix(&s, &a, 0.0, 0));
        let r = pca_reduce(&x, 2).unwrap();
        let e_x: f64 = x.as_slice().iter().map(|v| v.norm_sqr()).sum();
        let e_r: f64 = r.as_slice().iter().map(|v| v.norm_sqr()).sum();
        assert!((e_x - e_r).abs() < 1e-6 * e_x);
    }

    #[test]
    fn test_relay_reports_projection_errors() {
        let x = Spectrogram::zeros(10, 5, 3);
        let mut n_calls = 0;
        let mut cb = |_: &Spectrogram| n_calls += 1;

        relay_outputs(&Spectrogram::zeros(10, 5, 2), &x, true, &mut cb).unwrap();
        let err = relay_outputs(&Spectrogram::zeros(9, 5, 2), &x, true, &mut cb);
        assert!(matches!(err, Err(BssError::DimensionMismatch { .. })));
        // without projection back the outputs are passed as they are
        relay_outputs(&Spectrogram::zeros(9, 5, 2), &x, false, &mut cb).unwrap();
        assert_eq!(n_calls, 2);
    }

    #[test]
    fn test_auxiva_pca_separates() {
        let s = sources(2, 16_000, 3);
        let a = vec![vec![1.0, 0.6], vec![0.5, 1.0], vec![0.8, -0.4]];
        let (config, x) = analysis(&mix(&s, &a, 1e-3, 17));
        let refs = images(&config, &s, &a);
        let opts = OverIvaOptions {
            n_iter: 30,
            ..Default::default()
        };
        let mut n_calls = 0;
        let mut cb = |y: &Spectrogram| {
            assert_eq!(y.n_chan(), 2);
            n_calls += 1;
        };
        let y = auxiva_pca(&x, 2, &opts, Some(&mut cb)).unwrap();
        assert_eq!(n_calls, 3);
        for c in 0..2 {
            let err = best_error(&y, c, &refs);
            assert!(err < 0.1, "relative error {err}");
        }
    }
}
