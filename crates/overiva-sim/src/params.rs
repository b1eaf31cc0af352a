//! Sweep parameter file
//!
//! A JSON document describing the room, the mixing conditions and the
//! algorithms to compare:
//!
//! ```json
//! {
//!   "name": "overiva_sim",
//!   "seed": 2758954,
//!   "n_repeat": 20,
//!   "fs": 16000,
//!   "snr": 60,
//!   "n_interferers": 10,
//!   "ref_mic": 0,
//!   "room_dim": [10, 7.5, 3],
//!   "weak_source_var": 1.0,
//!   "rt60_list": { "0.3": { "absorption": 0.45, "max_order": 12 } },
//!   "n_targets_list": [1, 2, 3],
//!   "n_mics_list": [2, 4, 6],
//!   "sinr_list": [5],
//!   "stft_params": { "framesize": 4096 },
//!   "algorithm_kwargs": {
//!     "overiva_laplace": { "algo": "overiva", "kwargs": { "n_iter": 100 } }
//!   },
//!   "monitor_convergence": false,
//!   "samples_list": "samples/metadata.json"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use overiva_core::metrics::DEFAULT_FILTER_LEN;
use overiva_core::separation::{Algorithm, AlgorithmOptions};

use crate::error::{SimError, SimResult};

/// Wall absorption and reflection order realising one reverberation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rt60Entry {
    /// Energy absorption coefficient of the walls
    pub absorption: f64,
    pub max_order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StftParams {
    pub framesize: usize,
}

/// One algorithm configuration of the comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmEntry {
    pub algo: Algorithm,
    #[serde(default)]
    pub kwargs: AlgorithmOptions,
}

fn default_overdet_algos() -> Vec<Algorithm> {
    Algorithm::ALL
        .into_iter()
        .filter(|a| a.is_overdetermined())
        .collect()
}

fn default_synthetic_duration() -> f64 {
    3.0
}

/// Complete description of a simulation sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParameters {
    pub name: String,
    /// Seed of the argument generator
    pub seed: u64,
    /// Number of source signal sets per configuration
    pub n_repeat: usize,
    pub fs: u32,
    /// Target power over sensor noise, dB
    pub snr: f64,
    pub n_interferers: usize,
    pub ref_mic: usize,
    pub room_dim: [f64; 3],
    /// Variance of the first target relative to the others
    pub weak_source_var: f64,
    pub rt60_list: BTreeMap<String, Rt60Entry>,
    pub n_targets_list: Vec<usize>,
    pub n_mics_list: Vec<usize>,
    /// Target power over interference plus noise, dB
    pub sinr_list: Vec<f64>,
    pub stft_params: StftParams,
    pub algorithm_kwargs: BTreeMap<String, AlgorithmEntry>,
    /// Algorithms whose outputs are not reordered by power before evaluation
    #[serde(default = "default_overdet_algos")]
    pub overdet_algos: Vec<Algorithm>,
    /// Evaluate through the algorithm callback instead of once before separation
    #[serde(default)]
    pub monitor_convergence: bool,
    /// Corpus metadata file; synthetic sources when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_list: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bss_eval_filter_len: Option<usize>,
    /// Length in seconds of synthetic sources
    #[serde(default = "default_synthetic_duration")]
    pub synthetic_duration: f64,
}

impl SweepParameters {
    /// Read and validate a parameter file.
    ///
    /// A relative `samples_list` is resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SimError::io(path, e))?;
        let mut params = Self::from_json(&text)?;
        if let (Some(samples), Some(dir)) = (params.samples_list.as_mut(), path.parent()) {
            if samples.is_relative() {
                *samples = dir.join(&*samples);
            }
        }
        Ok(params)
    }

    pub fn from_json(text: &str) -> SimResult<Self> {
        let params: Self = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn filter_len(&self) -> usize {
        self.bss_eval_filter_len.unwrap_or(DEFAULT_FILTER_LEN)
    }

    pub fn is_overdetermined(&self, algo: Algorithm) -> bool {
        self.overdet_algos.contains(&algo)
    }

    pub fn rt60(&self, key: &str) -> SimResult<&Rt60Entry> {
        self.rt60_list
            .get(key)
            .ok_or_else(|| SimError::UnknownRt60(key.to_string()))
    }

    /// Total number of sound sources for `n_targets` targets.
    pub fn n_sources(&self, n_targets: usize) -> usize {
        self.n_interferers + n_targets
    }

    pub fn validate(&self) -> SimResult<()> {
        let invalid = |msg: String| Err(SimError::InvalidParameters(msg));

        if self.n_repeat == 0 {
            return invalid("n_repeat must be at least 1".into());
        }
        if self.fs == 0 {
            return invalid("fs must be positive".into());
        }
        if self.room_dim.iter().any(|d| !(*d > 0.0)) {
            return invalid(format!("room_dim must be positive, got {:?}", self.room_dim));
        }
        if !(self.weak_source_var > 0.0) {
            return invalid("weak_source_var must be positive".into());
        }
        if self.rt60_list.is_empty() {
            return invalid("rt60_list is empty".into());
        }
        for (key, entry) in &self.rt60_list {
            if !(0.0..=1.0).contains(&entry.absorption) {
                return invalid(format!(
                    "rt60 '{key}': absorption {} not in [0, 1]",
                    entry.absorption
                ));
            }
        }
        if self.n_targets_list.is_empty() || self.n_targets_list.contains(&0) {
            return invalid("n_targets_list must be non-empty and positive".into());
        }
        if self.n_mics_list.is_empty() || self.n_mics_list.contains(&0) {
            return invalid("n_mics_list must be non-empty and positive".into());
        }
        if self.sinr_list.is_empty() {
            return invalid("sinr_list is empty".into());
        }
        if let Some(min_mics) = self.n_mics_list.iter().min() {
            if self.ref_mic >= *min_mics {
                return invalid(format!(
                    "ref_mic {} does not exist with {min_mics} microphones",
                    self.ref_mic
                ));
            }
        }
        let framesize = self.stft_params.framesize;
        if framesize < 4 || framesize % 2 != 0 {
            return invalid(format!("framesize must be even and at least 4, got {framesize}"));
        }
        if self.algorithm_kwargs.is_empty() {
            return invalid("algorithm_kwargs is empty".into());
        }
        if self.filter_len() == 0 {
            return invalid("bss_eval_filter_len must be positive".into());
        }
        if self.samples_list.is_none() && !(self.synthetic_duration > 0.0) {
            return invalid("synthetic_duration must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Small but complete parameter set used across the crate's tests.
    pub(crate) fn small_params() -> SweepParameters {
        let mut rt60_list = BTreeMap::new();
        rt60_list.insert(
            "0.1".to_string(),
            Rt60Entry {
                absorption: 0.7,
                max_order: 2,
            },
        );
        let mut algorithm_kwargs = BTreeMap::new();
        algorithm_kwargs.insert(
            "overiva".to_string(),
            AlgorithmEntry {
                algo: Algorithm::OverIva,
                kwargs: AlgorithmOptions {
                    n_iter: Some(10),
                    ..Default::default()
                },
            },
        );
        SweepParameters {
            name: "unit".into(),
            seed: 7,
            n_repeat: 1,
            fs: 8000,
            snr: 60.0,
            n_interferers: 1,
            ref_mic: 0,
            room_dim: [10.0, 7.5, 3.0],
            weak_source_var: 1.0,
            rt60_list,
            n_targets_list: vec![1],
            n_mics_list: vec![2],
            sinr_list: vec![10.0],
            stft_params: StftParams { framesize: 256 },
            algorithm_kwargs,
            overdet_algos: default_overdet_algos(),
            monitor_convergence: false,
            samples_list: None,
            bss_eval_filter_len: Some(64),
            synthetic_duration: 1.0,
        }
    }

    const SAMPLE: &str = r#"{
        "name": "overiva_sim",
        "seed": 2758954,
        "n_repeat": 2,
        "fs": 16000,
        "snr": 60,
        "n_interferers": 10,
        "ref_mic": 0,
        "room_dim": [10, 7.5, 3],
        "weak_source_var": 1.0,
        "rt60_list": { "0.3": { "absorption": 0.45, "max_order": 12 } },
        "n_targets_list": [1, 2],
        "n_mics_list": [2, 4],
        "sinr_list": [5, 10],
        "stft_params": { "framesize": 4096 },
        "algorithm_kwargs": {
            "overiva_gauss": { "algo": "overiva", "kwargs": { "n_iter": 50, "model": "gauss" } },
            "ogive_mix": { "algo": "ogive", "kwargs": { "update": "mix", "step_size": 0.1 } },
            "auxiva": { "algo": "auxiva" }
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let p = SweepParameters::from_json(SAMPLE).unwrap();
        assert_eq!(p.room_dim, [10.0, 7.5, 3.0]);
        assert_eq!(p.rt60("0.3").unwrap().max_order, 12);
        assert_eq!(p.algorithm_kwargs["ogive_mix"].algo, Algorithm::Ogive);
        assert_eq!(p.algorithm_kwargs["overiva_gauss"].kwargs.n_iter, Some(50));
        assert_eq!(p.algorithm_kwargs["auxiva"].kwargs, AlgorithmOptions::default());
        assert!(!p.monitor_convergence);
        assert_eq!(p.filter_len(), DEFAULT_FILTER_LEN);
        assert!(p.is_overdetermined(Algorithm::OverIva));
        assert!(!p.is_overdetermined(Algorithm::AuxIva));
        assert_eq!(p.n_sources(2), 12);
    }

    #[test]
    fn test_unknown_rt60() {
        let p = SweepParameters::from_json(SAMPLE).unwrap();
        assert!(matches!(p.rt60("0.9"), Err(SimError::UnknownRt60(_))));
    }

    #[test]
    fn test_rejects_unknown_algorithm_and_kwarg() {
        let bad = SAMPLE.replace("\"algo\": \"auxiva\"", "\"algo\": \"fastica\"");
        assert!(matches!(SweepParameters::from_json(&bad), Err(SimError::Json(_))));
        let bad = SAMPLE.replace("\"n_iter\": 50", "\"iterations\": 50");
        assert!(SweepParameters::from_json(&bad).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(small_params().validate().is_ok());

        let mut p = small_params();
        p.sinr_list.clear();
        assert!(matches!(p.validate(), Err(SimError::InvalidParameters(_))));

        let mut p = small_params();
        p.fs = 0;
        assert!(p.validate().is_err());

        let mut p = small_params();
        p.ref_mic = 2;
        assert!(p.validate().is_err());

        let mut p = small_params();
        p.stft_params.framesize = 255;
        assert!(p.validate().is_err());
        for framesize in [0, 2] {
            p.stft_params.framesize = framesize;
            assert!(p.validate().is_err(), "framesize {framesize}");
        }
        p.stft_params.framesize = 4;
        assert!(p.validate().is_ok());

        let mut p = small_params();
        p.algorithm_kwargs.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_from_file_resolves_samples() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        let mut p = small_params();
        p.samples_list = Some(PathBuf::from("corpus/metadata.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&p).unwrap()).unwrap();

        let loaded = SweepParameters::from_file(&path).unwrap();
        assert_eq!(
            loaded.samples_list.unwrap(),
            dir.path().join("corpus/metadata.json")
        );
    }
}
