//! BSS Eval source-separation metrics (SDR, SIR, SAR)
//!
//! Each estimate `ŝ_j` is decomposed against the references `s_i` with
//! time-invariant FIR distortion filters of length `L`:
//!
//! ```text
//! ŝ_j = s_target + e_interf + e_artif
//!
//! s_target = P_j ŝ_j         projection onto delayed copies of s_j
//! e_interf = P_all ŝ_j − P_j ŝ_j
//! e_artif  = ŝ_j − P_all ŝ_j
//! ```
//!
//! The Gram matrices of the delayed references are built from FFT
//! correlations, factored once, and reused for every estimate. The final
//! score uses the estimate-to-reference assignment that maximizes the
//! mean SIR.

use std::sync::Arc;

use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::linalg::RealLu;
use crate::types::{BssError, BssResult, Complex};

/// Default distortion filter length in samples.
pub const DEFAULT_FILTER_LEN: usize = 512;

/// Scores per reference source, with the matching estimate index in `perm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BssEvalResult {
    pub sdr: Vec<f64>,
    pub sir: Vec<f64>,
    pub sar: Vec<f64>,
    /// `perm[i]` is the estimate assigned to reference `i`
    pub perm: Vec<usize>,
}

/// `10 log10(num / den)`, infinite when nothing is left in the denominator.
fn safe_db(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (num / den).log10()
    }
}

fn energy(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum()
}

/// Precomputed reference spectra and Gram factorizations.
struct Projector {
    filter_len: usize,
    n_samples: usize,
    n_fft: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    spectra: Vec<Vec<Complex>>,
    gram_all: RealLu,
    gram_single: Vec<RealLu>,
}

impl Projector {
    fn new(reference: &[Vec<f64>], filter_len: usize) -> BssResult<Self> {
        let n_src = reference.len();
        let n_samples = reference[0].len();
        let n_fft = (n_samples + filter_len - 1).next_power_of_two();
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(n_fft);
        let inverse = planner.plan_fft_inverse(n_fft);

        let spectra: Vec<Vec<Complex>> = reference
            .iter()
            .map(|s| fft_real(forward.as_ref(), s, n_fft))
            .collect();

        let corr = |i: usize, j: usize| -> Vec<f64> {
            let prod: Vec<Complex> = spectra[i]
                .iter()
                .zip(&spectra[j])
                .map(|(a, b)| a * b.conj())
                .collect();
            ifft_real(inverse.as_ref(), prod)
        };

        let l = filter_len;
        let dim = n_src * l;
        let mut gram = vec![0.0; dim * dim];
        let mut gram_single = Vec::with_capacity(n_src);
        for i in 0..n_src {
            for j in 0..n_src {
                let c = corr(i, j);
                for a in 0..l {
                    for b in 0..l {
                        gram[(i * l + a) * dim + j * l + b] = c[(b + n_fft - a) % n_fft];
                    }
                }
            }
        }
        for j in 0..n_src {
            let mut block = vec![0.0; l * l];
            for a in 0..l {
                block[a * l..(a + 1) * l]
                    .copy_from_slice(&gram[(j * l + a) * dim + j * l..(j * l + a) * dim + (j + 1) * l]);
            }
            gram_single.push(factor_regularized(l, block).ok_or_else(|| {
                BssError::InvalidParameter(format!("reference {j} has a singular Gram matrix"))
            })?);
        }
        let gram_all = factor_regularized(dim, gram).ok_or_else(|| {
            BssError::InvalidParameter("reference sources are linearly dependent".into())
        })?;

        Ok(Self {
            filter_len,
            n_samples,
            n_fft,
            forward,
            inverse,
            spectra,
            gram_all,
            gram_single,
        })
    }

    /// Correlations of the estimate with delayed copies of reference `i`.
    fn cross_terms(&self, est_spec: &[Complex], i: usize) -> Vec<f64> {
        let prod: Vec<Complex> = self.spectra[i]
            .iter()
            .zip(est_spec)
            .map(|(a, b)| a * b.conj())
            .collect();
        let c = ifft_real(self.inverse.as_ref(), prod);
        (0..self.filter_len)
            .map(|a| c[(self.n_fft - a) % self.n_fft])
            .collect()
    }

    /// Sum over `refs` of the filtered references, `n_samples + L − 1` long.
    fn filtered_sum(&self, refs: &[usize], coeffs: &[f64]) -> Vec<f64> {
        let mut acc = vec![Complex::new(0.0, 0.0); self.n_fft];
        for (k, &i) in refs.iter().enumerate() {
            let taps = &coeffs[k * self.filter_len..(k + 1) * self.filter_len];
            let h = fft_real(self.forward.as_ref(), taps, self.n_fft);
            for ((dst, hf), sf) in acc.iter_mut().zip(&h).zip(&self.spectra[i]) {
                *dst += hf * sf;
            }
        }
        let mut out = ifft_real(self.inverse.as_ref(), acc);
        out.truncate(self.n_samples + self.filter_len - 1);
        out
    }

    /// SDR, SIR and SAR of `estimate` against every reference.
    fn score(&self, estimate: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let n_src = self.spectra.len();
        let est_spec = fft_real(self.forward.as_ref(), estimate, self.n_fft);
        let d_all: Vec<f64> = (0..n_src)
            .flat_map(|i| self.cross_terms(&est_spec, i))
            .collect();

        let all: Vec<usize> = (0..n_src).collect();
        let coeffs = self.gram_all.solve(&d_all);
        let proj_all = self.filtered_sum(&all, &coeffs);

        let mut padded = estimate.to_vec();
        padded.resize(self.n_samples + self.filter_len - 1, 0.0);
        let artif: Vec<f64> = padded.iter().zip(&proj_all).map(|(e, p)| e - p).collect();
        let e_artif = energy(&artif);
        let e_proj_all = energy(&proj_all);

        let mut sdr = Vec::with_capacity(n_src);
        let mut sir = Vec::with_capacity(n_src);
        let mut sar = Vec::with_capacity(n_src);
        for j in 0..n_src {
            let d_j = &d_all[j * self.filter_len..(j + 1) * self.filter_len];
            let coeffs_j = self.gram_single[j].solve(d_j);
            let target = self.filtered_sum(&[j], &coeffs_j);

            let e_target = energy(&target);
            let distortion: f64 = padded
                .iter()
                .zip(&target)
                .map(|(e, t)| (e - t) * (e - t))
                .sum();
            let interf: f64 = proj_all
                .iter()
                .zip(&target)
                .map(|(p, t)| (p - t) * (p - t))
                .sum();

            sdr.push(safe_db(e_target, distortion));
            sir.push(safe_db(e_target, interf));
            sar.push(safe_db(e_proj_all, e_artif));
        }
        (sdr, sir, sar)
    }
}

fn fft_real(fft: &dyn Fft<f64>, x: &[f64], n_fft: usize) -> Vec<Complex> {
    let mut buf = vec![Complex::new(0.0, 0.0); n_fft];
    for (dst, v) in buf.iter_mut().zip(x) {
        dst.re = *v;
    }
    fft.process(&mut buf);
    buf
}

fn ifft_real(ifft: &dyn Fft<f64>, mut buf: Vec<Complex>) -> Vec<f64> {
    let n = buf.len() as f64;
    ifft.process(&mut buf);
    buf.into_iter().map(|c| c.re / n).collect()
}

/// Factor, retrying with a small diagonal load when the matrix is singular.
fn factor_regularized(n: usize, a: Vec<f64>) -> Option<RealLu> {
    if let Some(lu) = RealLu::factor(n, a.clone()) {
        return Some(lu);
    }
    let trace: f64 = (0..n).map(|i| a[i * n + i]).sum();
    if !(trace > 0.0) {
        return None;
    }
    let mut loaded = a;
    let load = 1e-10 * trace / n as f64;
    for i in 0..n {
        loaded[i * n + i] += load;
    }
    RealLu::factor(n, loaded)
}

/// Visit every permutation of `0..n` (Heap's algorithm).
fn for_each_permutation(n: usize, mut visit: impl FnMut(&[usize])) {
    let mut perm: Vec<usize> = (0..n).collect();
    let mut c = vec![0usize; n];
    visit(&perm);
    let mut i = 0;
    while i < n {
        if c[i] < i {
            if i % 2 == 0 {
                perm.swap(0, i);
            } else {
                perm.swap(c[i], i);
            }
            visit(&perm);
            c[i] += 1;
            i = 0;
        } else {
            c[i] = 0;
            i += 1;
        }
    }
}

/// Evaluate `estimated` against `reference` (both `n_src × n_samples`).
///
/// Every source must have the same length and contain at least one
/// non-zero sample.
pub fn bss_eval_sources(
    reference: &[Vec<f64>],
    estimated: &[Vec<f64>],
    filter_len: usize,
) -> BssResult<BssEvalResult> {
    let n_src = reference.len();
    if n_src == 0 {
        return Err(BssError::InvalidParameter("no reference sources".into()));
    }
    if estimated.len() != n_src {
        return Err(BssError::DimensionMismatch {
            expected: n_src,
            actual: estimated.len(),
        });
    }
    if filter_len == 0 {
        return Err(BssError::InvalidParameter("filter_len must be positive".into()));
    }
    let n_samples = reference[0].len();
    if let Some(bad) = reference
        .iter()
        .chain(estimated)
        .find(|s| s.len() != n_samples)
    {
        return Err(BssError::DimensionMismatch {
            expected: n_samples,
            actual: bad.len(),
        });
    }
    if n_samples == 0 {
        return Err(BssError::InvalidParameter("sources are empty".into()));
    }
    if let Some(i) = reference.iter().position(|s| s.iter().all(|&v| v == 0.0)) {
        return Err(BssError::InvalidParameter(format!("reference source {i} is silent")));
    }
    if let Some(j) = estimated.iter().position(|s| s.iter().all(|&v| v == 0.0)) {
        return Err(BssError::InvalidParameter(format!("estimated source {j} is silent")));
    }
    if reference.iter().chain(estimated).flatten().any(|v| !v.is_finite()) {
        return Err(BssError::NonFinite {
            stage: "bss_eval input".into(),
        });
    }

    let projector = Projector::new(reference, filter_len)?;

    // scores[j] = (sdr, sir, sar) of estimate j against each reference
    #[cfg(feature = "parallel")]
    let scores: Vec<(Vec<f64>, Vec<f64>, Vec<f64>)> = {
        use rayon::prelude::*;
        estimated.par_iter().map(|e| projector.score(e)).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let scores: Vec<(Vec<f64>, Vec<f64>, Vec<f64>)> =
        estimated.iter().map(|e| projector.score(e)).collect();

    let mut best: Option<(f64, Vec<usize>)> = None;
    for_each_permutation(n_src, |perm| {
        let mean_sir = (0..n_src).map(|i| scores[perm[i]].1[i]).sum::<f64>() / n_src as f64;
        let better = match &best {
            None => true,
            Some((b, _)) => mean_sir > *b,
        };
        if better {
            best = Some((mean_sir, perm.to_vec()));
        }
    });
    let perm = best.map(|(_, p)| p).unwrap_or_else(|| (0..n_src).collect());

    Ok(BssEvalResult {
        sdr: (0..n_src).map(|i| scores[perm[i]].0[i]).collect(),
        sir: (0..n_src).map(|i| scores[perm[i]].1[i]).collect(),
        sar: (0..n_src).map(|i| scores[perm[i]].2[i]).collect(),
        perm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn noise(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn test_permutations_visited() {
        let mut seen = Vec::new();
        for_each_permutation(3, |p| seen.push(p.to_vec()));
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_perfect_estimate_is_infinite_sir() {
        let s0 = noise(2000, 1);
        let s1 = noise(2000, 2);
        let reference = vec![s0.clone(), s1.clone()];
        let estimated = vec![s1, s0];
        let res = bss_eval_sources(&reference, &estimated, 32).unwrap();
        assert_eq!(res.perm, vec![1, 0]);
        for i in 0..2 {
            assert!(res.sdr[i] > 100.0, "sdr {}", res.sdr[i]);
            assert!(res.sir[i] > 100.0);
        }
    }

    #[test]
    fn test_known_interference_level() {
        let n = 8000;
        let s0 = noise(n, 3);
        let s1 = noise(n, 4);
        // 20 dB of leakage from the second source, no artifacts
        let g = 0.1;
        let est0: Vec<f64> = s0.iter().zip(&s1).map(|(a, b)| a + g * b).collect();
        let est1: Vec<f64> = s1.iter().zip(&s0).map(|(a, b)| a + g * b).collect();
        let reference = vec![s0, s1];
        let res = bss_eval_sources(&reference, &[est0, est1], 64).unwrap();
        assert_eq!(res.perm, vec![0, 1]);
        for i in 0..2 {
            assert!((res.sir[i] - 20.0).abs() < 0.5, "sir {}", res.sir[i]);
            assert!((res.sdr[i] - 20.0).abs() < 0.5, "sdr {}", res.sdr[i]);
            assert!(res.sar[i] > 60.0, "sar {}", res.sar[i]);
        }
    }

    #[test]
    fn test_filtered_target_is_not_penalized() {
        let n = 4000;
        let s0 = noise(n, 5);
        let s1 = noise(n, 6);
        // short FIR distortion is absorbed by the projection
        let est0: Vec<f64> = (0..n)
            .map(|i| 0.8 * s0[i] + if i >= 3 { 0.3 * s0[i - 3] } else { 0.0 })
            .collect();
        let artifacts = noise(n, 7);
        let est1: Vec<f64> = s1.iter().zip(&artifacts).map(|(a, b)| a + 0.1 * b).collect();
        let res = bss_eval_sources(&[s0, s1], &[est0, est1], 16).unwrap();
        assert!(res.sdr[0] > 60.0, "sdr {}", res.sdr[0]);
        assert!((res.sar[1] - 20.0).abs() < 1.0, "sar {}", res.sar[1]);
    }

    #[test]
    fn test_rejects_silent_and_mismatched() {
        let s = noise(100, 8);
        assert!(bss_eval_sources(&[s.clone()], &[vec![0.0; 100]], 8).is_err());
        assert!(bss_eval_sources(&[s.clone()], &[s[..50].to_vec()], 8).is_err());
        assert!(bss_eval_sources(&[s.clone()], &[s.clone(), s], 8).is_err());
    }

    #[test]
    fn test_safe_db() {
        assert_eq!(safe_db(1.0, 0.0), f64::INFINITY);
        assert!((safe_db(100.0, 1.0) - 20.0).abs() < 1e-12);
    }
}
