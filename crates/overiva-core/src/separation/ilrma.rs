//! Independent low-rank matrix analysis (ILRMA)
//!
//! Determined separation where each source's power spectrogram is modelled
//! by a rank-`K` non-negative factorization `R_s = T_s V_s`. NMF factors
//! are refined with multiplicative updates, then every demixing row gets an
//! iterative projection update using the weights `1 / R_s(f, t)`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::linalg::{weighted_covariance, CMatrix};
use crate::types::{BssError, BssResult, Complex, Spectrogram};

use super::overiva::ip_update;
use super::{check_problem, projection_back, try_for_each_freq, Callback, MODEL_EPS};

#[derive(Debug, Clone, PartialEq)]
pub struct IlrmaOptions {
    pub n_iter: usize,
    /// NMF bases per source
    pub n_components: usize,
    pub proj_back: bool,
    /// Seed for the NMF initialization
    pub seed: u64,
    pub callback_every: usize,
}

impl Default for IlrmaOptions {
    fn default() -> Self {
        Self {
            n_iter: 20,
            n_components: 2,
            proj_back: true,
            seed: 0,
            callback_every: 10,
        }
    }
}

/// Non-negative model of one source, `R = T V` with `T: F × K`, `V: K × N`.
struct LowRank {
    t: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    r: Vec<Vec<f64>>,
}

impl LowRank {
    fn random(n_freq: usize, n_frames: usize, k: usize, rng: &mut StdRng) -> Self {
        let t = (0..n_freq)
            .map(|_| (0..k).map(|_| 0.1 + 0.9 * rng.gen::<f64>()).collect())
            .collect();
        let v = (0..k)
            .map(|_| (0..n_frames).map(|_| 0.1 + 0.9 * rng.gen::<f64>()).collect())
            .collect();
        let mut model = Self {
            t,
            v,
            r: vec![vec![0.0; n_frames]; n_freq],
        };
        model.refresh();
        model
    }

    fn refresh(&mut self) {
        for (f, row) in self.r.iter_mut().enumerate() {
            for (n, r) in row.iter_mut().enumerate() {
                *r = self.t[f]
                    .iter()
                    .zip(&self.v)
                    .map(|(t, v)| t * v[n])
                    .sum::<f64>()
                    .max(MODEL_EPS);
            }
        }
    }

    /// Multiplicative updates of both factors against the power `p` (`F × N`).
    fn update(&mut self, p: &[Vec<f64>]) {
        let n_freq = self.t.len();
        let k = self.v.len();
        let n_frames = self.v.first().map_or(0, |v| v.len());

        for f in 0..n_freq {
            for c in 0..k {
                let mut num = 0.0;
                let mut den = 0.0;
                for n in 0..n_frames {
                    let ir = 1.0 / self.r[f][n];
                    num += p[f][n] * ir * ir * self.v[c][n];
                    den += ir * self.v[c][n];
                }
                self.t[f][c] = (self.t[f][c] * (num / den.max(MODEL_EPS)).sqrt()).max(MODEL_EPS);
            }
        }
        self.refresh();

        for c in 0..k {
            for n in 0..n_frames {
                let mut num = 0.0;
                let mut den = 0.0;
                for f in 0..n_freq {
                    let ir = 1.0 / self.r[f][n];
                    num += self.t[f][c] * p[f][n] * ir * ir;
                    den += self.t[f][c] * ir;
                }
                self.v[c][n] = (self.v[c][n] * (num / den.max(MODEL_EPS)).sqrt()).max(MODEL_EPS);
            }
        }
        self.refresh();
    }

    fn rescale(&mut self, factor: f64) {
        for row in self.t.iter_mut() {
            for t in row.iter_mut() {
                *t *= factor;
            }
        }
        self.refresh();
    }
}

struct Bin {
    x: Vec<Vec<Complex>>,
    w: CMatrix,
    y: Vec<Vec<Complex>>,
}

impl Bin {
    fn demix(&mut self) {
        for (r, yr) in self.y.iter_mut().enumerate() {
            let row = self.w.row(r);
            for (t, yt) in yr.iter_mut().enumerate() {
                *yt = row.iter().zip(&self.x).map(|(wi, xi)| wi * xi[t]).sum();
            }
        }
    }
}

fn collect(bins: &[Bin], n_out: usize, n_frames: usize) -> Spectrogram {
    let mut out = Spectrogram::zeros(n_frames, bins.len(), n_out);
    for (f, bin) in bins.iter().enumerate() {
        for (s, ys) in bin.y.iter().enumerate() {
            for (t, y) in ys.iter().enumerate() {
                out.set(t, f, s, *y);
            }
        }
    }
    out
}

/// `P_s(f, t) = |Y_s(f, t)|²` for every source.
fn powers(bins: &[Bin], n_src: usize, n_frames: usize) -> Vec<Vec<Vec<f64>>> {
    (0..n_src)
        .map(|s| {
            bins.iter()
                .map(|b| (0..n_frames).map(|t| b.y[s][t].norm_sqr()).collect())
                .collect()
        })
        .collect()
}

/// Separate as many sources as there are microphones.
pub fn ilrma(
    x: &Spectrogram,
    options: &IlrmaOptions,
    mut callback: Option<Callback<'_>>,
) -> BssResult<Spectrogram> {
    let (n_frames, n_freq, n_chan) = x.shape();
    check_problem(x, n_chan)?;
    if options.n_components == 0 {
        return Err(BssError::InvalidParameter(
            "n_components must be at least 1".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut models: Vec<LowRank> = (0..n_chan)
        .map(|_| LowRank::random(n_freq, n_frames, options.n_components, &mut rng))
        .collect();
    let mut bins: Vec<Bin> = (0..n_freq)
        .map(|f| Bin {
            x: x.freq_slice(f),
            w: CMatrix::identity(n_chan),
            y: vec![vec![Complex::new(0.0, 0.0); n_frames]; n_chan],
        })
        .collect();
    try_for_each_freq(&mut bins, |_, b| {
        b.demix();
        Ok(())
    })?;
    let mut p = powers(&bins, n_chan, n_frames);
    let every = options.callback_every.max(1);

    for epoch in 0..options.n_iter {
        if epoch % every == 0 {
            if let Some(cb) = callback.as_mut() {
                let y = collect(&bins, n_chan, n_frames);
                if options.proj_back {
                    cb(&projection_back(&y, x, 0)?);
                } else {
                    cb(&y);
                }
            }
        }

        for (s, model) in models.iter_mut().enumerate() {
            model.update(&p[s]);
            let r = &model.r;
            try_for_each_freq(&mut bins, |f, b| {
                let weights: Vec<f64> = r[f].iter().map(|v| 1.0 / v).collect();
                let cov = weighted_covariance(&b.x, Some(&weights));
                ip_update(&mut b.w, &cov, s, f)
            })?;
        }

        try_for_each_freq(&mut bins, |_, b| {
            b.demix();
            Ok(())
        })?;
        p = powers(&bins, n_chan, n_frames);

        // fix the scale ambiguity between the filters and the NMF model
        for (s, model) in models.iter_mut().enumerate() {
            let count = (n_freq * n_frames) as f64;
            let mean: f64 = p[s].iter().flatten().sum::<f64>() / count;
            let lambda = mean.sqrt();
            if !(lambda.is_finite() && lambda > 0.0) {
                return Err(BssError::NonFinite {
                    stage: format!("ilrma normalization of source {s}"),
                });
            }
            for b in bins.iter_mut() {
                for v in b.w.row_mut(s) {
                    *v /= lambda;
                }
                for v in b.y[s].iter_mut() {
                    *v /= lambda;
                }
            }
            for row in p[s].iter_mut() {
                for v in row.iter_mut() {
                    *v /= lambda * lambda;
                }
            }
            model.rescale(1.0 / (lambda * lambda));
        }
    }

    let mut y = collect(&bins, n_chan, n_frames);
    if options.proj_back {
        y = projection_back(&y, x, 0)?;
    }
    if !y.is_finite() {
        return Err(BssError::NonFinite {
            stage: "ilrma".into(),
        });
    }
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{analysis, best_error, images, mix, sources};
    use super::*;

    #[test]
    fn test_low_rank_update_reduces_divergence() {
        let mut rng = StdRng::seed_from_u64(2);
        let (n_freq, n_frames) = (8, 12);
        // rank one target
        let p: Vec<Vec<f64>> = (0..n_freq)
            .map(|f| (0..n_frames).map(|n| (1.0 + f as f64) * (0.5 + (n % 3) as f64)).collect())
            .collect();
        let mut model = LowRank::random(n_freq, n_frames, 2, &mut rng);
        let divergence = |m: &LowRank| -> f64 {
            let mut d = 0.0;
            for f in 0..n_freq {
                for n in 0..n_frames {
                    let q = p[f][n] / m.r[f][n];
                    d += q - q.ln() - 1.0;
                }
            }
            d
        };
        let before = divergence(&model);
        for _ in 0..20 {
            model.update(&p);
        }
        assert!(divergence(&model) < before);
    }

    #[test]
    fn test_ilrma_separates_determined_mixture() {
        let s = sources(2, 16_000, 3);
        let a = vec![vec![1.0, 0.6], vec![0.5, 1.0]];
        let (config, x) = analysis(&mix(&s, &a, 1e-3, 23));
        let refs = images(&config, &s, &a);
        let options = IlrmaOptions {
            n_iter: 40,
            ..Default::default()
        };
        let y = ilrma(&x, &options, None).unwrap();
        assert_eq!(y.n_chan(), 2);
        for c in 0..2 {
            let err = best_error(&y, c, &refs);
            assert!(err < 0.1, "relative error {err}");
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let s = sources(2, 4000, 8);
        let (_, x) = analysis(&mix(&s, &[vec![1.0, 0.3], vec![0.2, 1.0]], 1e-3, 1));
        let options = IlrmaOptions {
            n_iter: 3,
            seed: 42,
            ..Default::default()
        };
        let y1 = ilrma(&x, &options, None).unwrap();
        let y2 = ilrma(&x, &options, None).unwrap();
        assert_eq!(y1, y2);
    }
}
