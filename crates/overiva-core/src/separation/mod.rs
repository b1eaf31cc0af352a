//! Blind source separation in the STFT domain
//!
//! All algorithms take the mixture spectrogram `X` (`frames × freq × mics`)
//! and return separated sources with the same frame/frequency grid. They
//! share the auxiliary-function machinery: a spherical source model turns
//! the current outputs into per-frame weights, the weights define weighted
//! spatial covariances, and the demixing filters are updated in closed
//! form (iterative projection) or by a constrained gradient step.
//!
//! | Algorithm    | Outputs       | Update                                      |
//! |--------------|---------------|---------------------------------------------|
//! | `auxiva`     | `n_chan`      | IP on every row                              |
//! | `overiva`    | `n_src`       | IP on targets, background orthogonal to them |
//! | `oiva2`      | `n_src`       | as above, background refreshed once a sweep  |
//! | `oivag`      | `n_src`       | background refreshed once per group of sweeps |
//! | `auxiva_pca` | `n_src`       | PCA reduction, then AuxIVA                   |
//! | `ogive`      | 1             | orthogonally constrained gradient            |
//! | `ilrma`      | `n_chan`      | IP with NMF source variances                 |
//!
//! A convergence callback receives the current (optionally projected back)
//! outputs every few iterations, before the update of that iteration.

pub mod auxiva_pca;
pub mod ilrma;
pub mod ogive;
pub mod overiva;
pub mod projection_back;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{BssError, BssResult, Spectrogram};

pub use auxiva_pca::auxiva_pca;
pub use ilrma::{ilrma, IlrmaOptions};
pub use ogive::{ogive, OgiveOptions, OgiveUpdate};
pub use overiva::{overiva, BackgroundUpdate, OverIvaOptions, DEFAULT_GROUP_SWEEPS};
pub use projection_back::{projection_back, projection_back_scales};

/// Convergence monitor invoked with intermediate outputs.
pub type Callback<'a> = &'a mut dyn FnMut(&Spectrogram);

/// Floor applied to source-model scales before inversion.
pub(crate) const MODEL_EPS: f64 = 1e-15;

/// Spherical source prior used to derive the auxiliary weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceModel {
    /// Spherical Laplace prior, weight `1 / (2‖y‖)`
    #[default]
    Laplace,
    /// Time-varying Gaussian prior, weight `F / ‖y‖²`
    Gauss,
}

impl SourceModel {
    /// Scale `r` from the squared norm of one source frame over `n_freq` bins.
    #[inline]
    pub fn scale(self, norm_sqr: f64, n_freq: usize) -> f64 {
        match self {
            SourceModel::Laplace => 2.0 * norm_sqr.sqrt(),
            SourceModel::Gauss => norm_sqr / n_freq as f64,
        }
    }
}

/// Separation algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "auxiva")]
    AuxIva,
    #[serde(rename = "overiva", alias = "oiva")]
    OverIva,
    #[serde(rename = "oiva2")]
    OverIvaSweep,
    #[serde(rename = "oivag")]
    OverIvaGroup,
    #[serde(rename = "auxiva_pca")]
    AuxIvaPca,
    #[serde(rename = "ogive")]
    Ogive,
    #[serde(rename = "ilrma")]
    Ilrma,
}

impl Algorithm {
    pub const ALL: [Algorithm; 7] = [
        Algorithm::AuxIva,
        Algorithm::OverIva,
        Algorithm::OverIvaSweep,
        Algorithm::OverIvaGroup,
        Algorithm::AuxIvaPca,
        Algorithm::Ogive,
        Algorithm::Ilrma,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::AuxIva => "auxiva",
            Algorithm::OverIva => "overiva",
            Algorithm::OverIvaSweep => "oiva2",
            Algorithm::OverIvaGroup => "oivag",
            Algorithm::AuxIvaPca => "auxiva_pca",
            Algorithm::Ogive => "ogive",
            Algorithm::Ilrma => "ilrma",
        }
    }

    /// Number of output channels for a problem with `n_src` targets and `n_chan` mics.
    pub fn n_outputs(self, n_src: usize, n_chan: usize) -> usize {
        match self {
            Algorithm::AuxIva | Algorithm::Ilrma => n_chan,
            Algorithm::Ogive => 1,
            _ => n_src,
        }
    }

    /// Algorithms that return exactly the requested targets, in no particular
    /// power order, so evaluation must not reorder them by energy.
    pub fn is_overdetermined(self) -> bool {
        matches!(
            self,
            Algorithm::OverIva
                | Algorithm::OverIvaSweep
                | Algorithm::OverIvaGroup
                | Algorithm::AuxIvaPca
                | Algorithm::Ogive
        )
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = BssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auxiva" => Ok(Algorithm::AuxIva),
            "overiva" | "oiva" => Ok(Algorithm::OverIva),
            "oiva2" => Ok(Algorithm::OverIvaSweep),
            "oivag" | "oiva_group" => Ok(Algorithm::OverIvaGroup),
            "auxiva_pca" => Ok(Algorithm::AuxIvaPca),
            "ogive" => Ok(Algorithm::Ogive),
            "ilrma" => Ok(Algorithm::Ilrma),
            other => Err(BssError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Keyword arguments accepted by the algorithms, as found in parameter files.
///
/// Unset fields fall back to each algorithm's own default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlgorithmOptions {
    pub n_iter: Option<usize>,
    pub proj_back: Option<bool>,
    pub model: Option<SourceModel>,
    pub init_eig: Option<bool>,
    pub n_sup_iter: Option<usize>,
    pub step_size: Option<f64>,
    pub tol: Option<f64>,
    pub update: Option<OgiveUpdate>,
    pub n_components: Option<usize>,
    pub seed: Option<u64>,
    pub callback_every: Option<usize>,
}

impl AlgorithmOptions {
    fn overiva(&self, background_update: BackgroundUpdate) -> OverIvaOptions {
        let d = OverIvaOptions::default();
        let sweeps = match background_update {
            BackgroundUpdate::PerGroup => DEFAULT_GROUP_SWEEPS,
            _ => d.n_sup_iter,
        };
        OverIvaOptions {
            n_iter: self.n_iter.unwrap_or(d.n_iter),
            proj_back: self.proj_back.unwrap_or(d.proj_back),
            model: self.model.unwrap_or(d.model),
            init_eig: self.init_eig.unwrap_or(d.init_eig),
            background_update,
            n_sup_iter: self.n_sup_iter.unwrap_or(sweeps),
            callback_every: self.callback_every.unwrap_or(d.callback_every),
        }
    }

    fn ogive(&self) -> OgiveOptions {
        let d = OgiveOptions::default();
        OgiveOptions {
            n_iter: self.n_iter.unwrap_or(d.n_iter),
            step_size: self.step_size.unwrap_or(d.step_size),
            tol: self.tol.unwrap_or(d.tol),
            update: self.update.unwrap_or(d.update),
            proj_back: self.proj_back.unwrap_or(d.proj_back),
            model: self.model.unwrap_or(d.model),
            init_eig: self.init_eig.unwrap_or(d.init_eig),
            callback_every: self.callback_every.unwrap_or(d.callback_every),
        }
    }

    fn ilrma(&self) -> IlrmaOptions {
        let d = IlrmaOptions::default();
        IlrmaOptions {
            n_iter: self.n_iter.unwrap_or(d.n_iter),
            n_components: self.n_components.unwrap_or(d.n_components),
            proj_back: self.proj_back.unwrap_or(d.proj_back),
            seed: self.seed.unwrap_or(d.seed),
            callback_every: self.callback_every.unwrap_or(d.callback_every),
        }
    }
}

/// Run `algorithm` on the mixture `x`, extracting `n_src` targets where the
/// algorithm supports it.
pub fn separate(
    algorithm: Algorithm,
    x: &Spectrogram,
    n_src: usize,
    options: &AlgorithmOptions,
    callback: Option<Callback<'_>>,
) -> BssResult<Spectrogram> {
    tracing::debug!(%algorithm, n_src, shape = ?x.shape(), "running separation");
    match algorithm {
        Algorithm::AuxIva => overiva(
            x,
            x.n_chan(),
            &options.overiva(BackgroundUpdate::PerSource),
            callback,
        ),
        Algorithm::OverIva => overiva(
            x,
            n_src,
            &options.overiva(BackgroundUpdate::PerSource),
            callback,
        ),
        Algorithm::OverIvaSweep => overiva(
            x,
            n_src,
            &options.overiva(BackgroundUpdate::PerIteration),
            callback,
        ),
        Algorithm::OverIvaGroup => overiva(
            x,
            n_src,
            &options.overiva(BackgroundUpdate::PerGroup),
            callback,
        ),
        Algorithm::AuxIvaPca => auxiva_pca(
            x,
            n_src,
            &options.overiva(BackgroundUpdate::PerSource),
            callback,
        ),
        Algorithm::Ogive => ogive(x, &options.ogive(), callback),
        Algorithm::Ilrma => ilrma(x, &options.ilrma(), callback),
    }
}

pub(crate) fn check_problem(x: &Spectrogram, n_src: usize) -> BssResult<()> {
    let (n_frames, n_freq, n_chan) = x.shape();
    if n_frames == 0 || n_freq == 0 || n_chan == 0 {
        return Err(BssError::InvalidParameter(format!(
            "empty mixture spectrogram {:?}",
            x.shape()
        )));
    }
    if n_src == 0 {
        return Err(BssError::InvalidParameter("n_src must be at least 1".into()));
    }
    if n_src > n_chan {
        return Err(BssError::Underdetermined { n_src, n_chan });
    }
    Ok(())
}

/// Run a fallible per-frequency update, in parallel when the feature is on.
pub(crate) fn try_for_each_freq<T, F>(items: &mut [T], op: F) -> BssResult<()>
where
    T: Send,
    F: Fn(usize, &mut T) -> BssResult<()> + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        items
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(f, item)| op(f, item))
    }
    #[cfg(not(feature = "parallel"))]
    {
        items
            .iter_mut()
            .enumerate()
            .try_for_each(|(f, item)| op(f, item))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic instantaneous mixtures shared by the algorithm tests.

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    use crate::stft::StftConfig;
    use crate::types::{MultiChannel, Spectrogram};

    /// Bursty, super-Gaussian sources with different activity patterns.
    pub fn sources(n_src: usize, n_samples: usize, seed: u64) -> MultiChannel {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n_src)
            .map(|s| {
                let block = 400 + 130 * s;
                let mut gain = 1.0;
                let mut lp = 0.0;
                let coef = 0.3 + 0.25 * s as f64;
                (0..n_samples)
                    .map(|i| {
                        if i % block == 0 {
                            gain = if rng.gen_bool(0.35) { 0.05 } else { rng.gen_range(0.5..2.0) };
                        }
                        let e: f64 = normal.sample(&mut rng);
                        lp = coef * lp + (1.0 - coef) * e * e.abs();
                        gain * lp
                    })
                    .collect()
            })
            .collect()
    }

    /// Instantaneous mixture `x = A s` plus white sensor noise.
    pub fn mix(sources: &MultiChannel, a: &[Vec<f64>], noise_std: f64, seed: u64) -> MultiChannel {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = sources[0].len();
        a.iter()
            .map(|row| {
                (0..n)
                    .map(|i| {
                        let clean: f64 = row.iter().zip(sources).map(|(g, s)| g * s[i]).sum();
                        clean + noise_std * normal.sample(&mut rng)
                    })
                    .collect()
            })
            .collect()
    }

    /// STFT of each source as observed on the first microphone.
    pub fn images(config: &StftConfig, sources: &MultiChannel, a: &[Vec<f64>]) -> Vec<Spectrogram> {
        sources
            .iter()
            .zip(&a[0])
            .map(|(s, g)| {
                let scaled: Vec<f64> = s.iter().map(|v| v * g).collect();
                config.analysis(&[scaled]).unwrap()
            })
            .collect()
    }

    /// Smallest relative squared error between output `chan` of `z` and any image.
    pub fn best_error(z: &Spectrogram, chan: usize, images: &[Spectrogram]) -> f64 {
        images
            .iter()
            .map(|img| {
                let mut err = 0.0;
                let mut energy = 0.0;
                for t in 0..z.n_frames() {
                    for f in 0..z.n_freq() {
                        let r = img.get(t, f, 0);
                        err += (z.get(t, f, chan) - r).norm_sqr();
                        energy += r.norm_sqr();
                    }
                }
                err / energy
            })
            .fold(f64::INFINITY, f64::min)
    }

    pub fn analysis(signals: &MultiChannel) -> (StftConfig, Spectrogram) {
        let config = StftConfig::half_overlap(256).unwrap();
        let spec = config.analysis(signals).unwrap();
        (config, spec)
    }
}
