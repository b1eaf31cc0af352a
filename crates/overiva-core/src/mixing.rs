//! Mixing of per-source microphone images to a target SNR / SIR / SINR
//!
//! The room simulation yields a premix `n_src × n_mics × n_samples`: the
//! image of every source at every microphone. These helpers rescale the
//! images so that the first `n_tgt` sources (the targets) and the rest (the
//! interferers) meet the requested power ratios at the reference
//! microphone, then add white sensor noise.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::types::{BssError, BssResult, MultiChannel};

/// Per-source microphone images, indexed `[source][mic][sample]`.
pub type Premix = Vec<MultiChannel>;

/// Mixture produced for a SINR sweep point.
#[derive(Debug, Clone)]
pub struct SinrMixture {
    /// Microphone signals `n_mics × n_samples`
    pub mix: MultiChannel,
    /// Interferers plus noise, `n_mics × n_samples`
    pub background: MultiChannel,
    /// Scaled target images followed by the background, `(n_tgt + 1) × n_mics × n_samples`
    pub reference: Premix,
}

/// Population standard deviation.
pub fn std_dev(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    (x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}

fn check_premix(premix: &[MultiChannel], ref_mic: usize) -> BssResult<(usize, usize)> {
    let first = premix
        .first()
        .ok_or_else(|| BssError::InvalidParameter("premix has no sources".into()))?;
    let n_mics = first.len();
    if ref_mic >= n_mics {
        return Err(BssError::InvalidParameter(format!(
            "reference mic {ref_mic} out of range (n_mics = {n_mics})"
        )));
    }
    let n_samples = first[0].len();
    for src in premix {
        if src.len() != n_mics {
            return Err(BssError::DimensionMismatch {
                expected: n_mics,
                actual: src.len(),
            });
        }
        if let Some(bad) = src.iter().find(|m| m.len() != n_samples) {
            return Err(BssError::DimensionMismatch {
                expected: n_samples,
                actual: bad.len(),
            });
        }
    }
    Ok((n_mics, n_samples))
}

fn scale(src: &mut MultiChannel, g: f64) {
    for v in src.iter_mut().flatten() {
        *v *= g;
    }
}

/// Scale every source to unit standard deviation at `ref_mic`.
///
/// Sources that are silent at the reference microphone are left untouched.
pub fn normalize_premix(premix: &mut [MultiChannel], ref_mic: usize) -> BssResult<()> {
    check_premix(premix, ref_mic)?;
    for src in premix.iter_mut() {
        let s = std_dev(&src[ref_mic]);
        if s > 0.0 {
            scale(src, 1.0 / s);
        } else {
            tracing::warn!(ref_mic, "source is silent at the reference microphone");
        }
    }
    Ok(())
}

fn noise<R: Rng + ?Sized>(rng: &mut R, n_mics: usize, n_samples: usize, sigma: f64) -> MultiChannel {
    (0..n_mics)
        .map(|_| {
            (0..n_samples)
                .map(|_| {
                    let z: f64 = StandardNormal.sample(rng);
                    sigma * z
                })
                .collect()
        })
        .collect()
}

fn accumulate(acc: &mut MultiChannel, src: &MultiChannel) {
    for (a, s) in acc.iter_mut().zip(src) {
        for (x, y) in a.iter_mut().zip(s) {
            *x += y;
        }
    }
}

/// Mix for the interactive demo: targets scaled by `src_std`, interferers
/// set to `sir` dB below the total target power, noise `snr` dB below the
/// mean target power. The premix is rescaled in place.
pub fn mix_snr_sir<R: Rng + ?Sized>(
    premix: &mut [MultiChannel],
    n_tgt: usize,
    src_std: &[f64],
    snr: f64,
    sir: f64,
    ref_mic: usize,
    rng: &mut R,
) -> BssResult<MultiChannel> {
    let (n_mics, n_samples) = check_premix(premix, ref_mic)?;
    let n_src = premix.len();
    if n_tgt == 0 || n_tgt > n_src || src_std.len() != n_tgt {
        return Err(BssError::InvalidParameter(format!(
            "{n_tgt} targets with {} powers among {n_src} sources",
            src_std.len()
        )));
    }
    normalize_premix(premix, ref_mic)?;
    for (src, g) in premix.iter_mut().zip(src_std) {
        scale(src, *g);
    }

    let power: f64 = src_std.iter().map(|s| s * s).sum();
    let sigma_n = (10f64.powf(-snr / 10.0) * power / n_tgt as f64).sqrt();
    if n_src > n_tgt {
        let sigma_i = (10f64.powf(-sir / 10.0) * power / (n_src - n_tgt) as f64).sqrt();
        for src in premix[n_tgt..].iter_mut() {
            scale(src, sigma_i);
        }
    }

    let mut mix = noise(rng, n_mics, n_samples, sigma_n);
    for src in premix.iter() {
        accumulate(&mut mix, src);
    }
    Ok(mix)
}

/// Mix for a SINR sweep point.
///
/// Targets get variance `sources_var` at the reference microphone, the noise
/// is `snr` dB below the total target power, and the interferers share
/// whatever power remains to reach `sinr` dB (none when the noise alone
/// already exceeds it, or when there are no interferers).
pub fn mix_sinr<R: Rng + ?Sized>(
    mut premix: Premix,
    n_tgt: usize,
    sources_var: &[f64],
    snr: f64,
    sinr: f64,
    ref_mic: usize,
    rng: &mut R,
) -> BssResult<SinrMixture> {
    let (n_mics, n_samples) = check_premix(&premix, ref_mic)?;
    let n_src = premix.len();
    if n_tgt == 0 || n_tgt > n_src || sources_var.len() != n_tgt {
        return Err(BssError::InvalidParameter(format!(
            "{n_tgt} targets with {} variances among {n_src} sources",
            sources_var.len()
        )));
    }
    if sources_var.iter().any(|v| !(*v >= 0.0)) {
        return Err(BssError::InvalidParameter("source variances must be non-negative".into()));
    }
    normalize_premix(&mut premix, ref_mic)?;
    for (src, var) in premix.iter_mut().zip(sources_var) {
        scale(src, var.sqrt());
    }

    let total: f64 = sources_var.iter().sum();
    let sigma_n = (10f64.powf(-snr / 10.0) * total).sqrt();
    let n_int = n_src - n_tgt;
    let sigma_i = if n_int > 0 {
        ((10f64.powf(-sinr / 10.0) * total - sigma_n * sigma_n).max(0.0) / n_int as f64).sqrt()
    } else {
        0.0
    };

    let mut background = noise(rng, n_mics, n_samples, sigma_n);
    for src in premix[n_tgt..].iter_mut() {
        scale(src, sigma_i);
        accumulate(&mut background, src);
    }

    let mut mix = background.clone();
    for src in premix[..n_tgt].iter() {
        accumulate(&mut mix, src);
    }

    premix.truncate(n_tgt);
    premix.push(background.clone());

    Ok(SinrMixture {
        mix,
        background,
        reference: premix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn premix(n_src: usize, n_mics: usize, n: usize, seed: u64) -> Premix {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n_src)
            .map(|s| noise(&mut rng, n_mics, n, 1.0 + s as f64))
            .collect()
    }

    fn power(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64
    }

    #[test]
    fn test_normalize_premix_unit_std() {
        let mut p = premix(3, 2, 5000, 1);
        normalize_premix(&mut p, 1).unwrap();
        for src in &p {
            assert_relative_eq!(std_dev(&src[1]), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mix_sinr_power_ratios() {
        let mut rng = StdRng::seed_from_u64(3);
        let p = premix(5, 3, 20_000, 2);
        let out = mix_sinr(p, 2, &[0.5, 1.0], 60.0, 5.0, 0, &mut rng).unwrap();

        assert_eq!(out.reference.len(), 3);
        let target_power: f64 = out.reference[..2].iter().map(|s| power(&s[0])).sum();
        assert_relative_eq!(target_power, 1.5, max_relative = 0.02);
        let bg = power(&out.background[0]);
        let sinr = 10.0 * (target_power / bg).log10();
        assert!((sinr - 5.0).abs() < 0.2, "sinr {sinr}");

        // mix = targets + background
        let n = out.mix[1].len();
        for i in (0..n).step_by(997) {
            let sum = out.reference.iter().map(|s| s[1][i]).sum::<f64>();
            assert_relative_eq!(out.mix[1][i], sum, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mix_sinr_without_interferers() {
        let mut rng = StdRng::seed_from_u64(4);
        let p = premix(2, 2, 1000, 5);
        let out = mix_sinr(p, 2, &[1.0, 1.0], 30.0, 10.0, 0, &mut rng).unwrap();
        let bg = power(&out.background[0]);
        // only the sensor noise remains, 30 dB below 2.0
        assert_relative_eq!(bg, 2e-3, max_relative = 0.15);
    }

    #[test]
    fn test_mix_snr_sir_levels() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut p = premix(6, 2, 20_000, 7);
        let std = [1.0 / 2f64.sqrt(), 1.0];
        let mix = mix_snr_sir(&mut p, 2, &std, 60.0, 10.0, 0, &mut rng).unwrap();
        assert_eq!(mix.len(), 2);
        let tgt: f64 = p[..2].iter().map(|s| power(&s[0])).sum();
        let int: f64 = p[2..].iter().map(|s| power(&s[0])).sum();
        assert_relative_eq!(tgt, 1.5, max_relative = 0.02);
        assert!((10.0 * (tgt / int).log10() - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(mix_sinr(premix(2, 2, 10, 0), 3, &[1.0; 3], 0.0, 0.0, 0, &mut rng).is_err());
        assert!(mix_sinr(premix(2, 2, 10, 0), 1, &[1.0], 0.0, 0.0, 2, &mut rng).is_err());
        assert!(mix_sinr(Vec::new(), 1, &[1.0], 0.0, 0.0, 0, &mut rng).is_err());
    }
}
