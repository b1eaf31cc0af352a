//! Scoring separated spectrograms against reference images
//!
//! Outputs are resynthesised, optionally reordered by decreasing power,
//! aligned with the references by removing the synthesis delay, and scored
//! with `bss_eval_sources`. Reference rows beyond the targets (the
//! background in a sweep) are matched with a fixed filler estimate so that
//! the permutation search can assign a target estimate to them.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use overiva_core::metrics::{bss_eval_sources, BssEvalResult};
use overiva_core::mixing::std_dev;
use overiva_core::stft::StftConfig;
use overiva_core::{MultiChannel, Spectrogram};

use crate::error::{SimError, SimResult};

/// Scores recorded at one callback invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePoint {
    pub iteration: usize,
    pub sdr: Vec<f64>,
    pub sir: Vec<f64>,
}

/// Reference signals and scoring settings for one mixture.
#[derive(Debug)]
pub struct Evaluation<'a> {
    stft: &'a StftConfig,
    /// Targets first, then any extra rows matched by `filler`
    reference: MultiChannel,
    n_targets: usize,
    filler: MultiChannel,
    filter_len: usize,
}

impl<'a> Evaluation<'a> {
    /// `reference` holds the `n_targets` target images followed by one row
    /// per `filler` estimate.
    pub fn new(
        stft: &'a StftConfig,
        reference: MultiChannel,
        n_targets: usize,
        filler: MultiChannel,
        filter_len: usize,
    ) -> SimResult<Self> {
        if n_targets == 0 || reference.len() != n_targets + filler.len() {
            return Err(SimError::InvalidParameters(format!(
                "{} reference rows for {n_targets} targets and {} filler rows",
                reference.len(),
                filler.len()
            )));
        }
        Ok(Self {
            stft,
            reference,
            n_targets,
            filler,
            filter_len,
        })
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Time-domain outputs, strongest first when `sort_by_power` is set.
    pub fn resynthesize(&self, y: &Spectrogram, sort_by_power: bool) -> MultiChannel {
        let signals = self.stft.synthesis(y);
        if sort_by_power {
            sort_by_power_desc(signals)
        } else {
            signals
        }
    }

    /// Score delayed time-domain outputs; the first `n_targets` are used.
    pub fn score(&self, y: &[Vec<f64>]) -> SimResult<BssEvalResult> {
        if y.len() < self.n_targets {
            return Err(SimError::InvalidParameters(format!(
                "{} outputs for {} targets",
                y.len(),
                self.n_targets
            )));
        }
        let delay = self.stft.synthesis_delay();
        let y_len = y.first().map_or(0, |c| c.len());
        let ref_len = self.reference.first().map_or(0, |c| c.len());
        let m = y_len.saturating_sub(delay).min(ref_len);
        if m == 0 {
            return Err(SimError::InvalidParameters(
                "separated signals are shorter than the synthesis delay".into(),
            ));
        }

        let reference: MultiChannel = self.reference.iter().map(|r| r[..m].to_vec()).collect();
        let estimated: MultiChannel = y[..self.n_targets]
            .iter()
            .map(|c| c[delay..delay + m].to_vec())
            .chain(self.filler.iter().map(|f| {
                let mut row = f[..m.min(f.len())].to_vec();
                row.resize(m, 0.0);
                row
            }))
            .collect();
        Ok(bss_eval_sources(&reference, &estimated, self.filter_len)?)
    }

    /// Resynthesise and score, keeping the scores of the targets only.
    pub fn evaluate(&self, y: &Spectrogram, sort_by_power: bool) -> SimResult<(Vec<f64>, Vec<f64>)> {
        let signals = self.resynthesize(y, sort_by_power);
        let result = self.score(&signals)?;
        Ok((
            result.sdr[..self.n_targets].to_vec(),
            result.sir[..self.n_targets].to_vec(),
        ))
    }
}

/// Reorder channels by decreasing standard deviation.
pub fn sort_by_power_desc(signals: MultiChannel) -> MultiChannel {
    let mut keyed: Vec<(f64, Vec<f64>)> = signals.into_iter().map(|s| (std_dev(&s), s)).collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, s)| s).collect()
}

/// Standard normal samples.
pub fn white_noise<R: Rng + ?Sized>(rng: &mut R, n: usize, scale: f64) -> Vec<f64> {
    (0..n)
        .map(|_| {
            let z: f64 = rng.sample(StandardNormal);
            scale * z
        })
        .collect()
}
