//! One simulated configuration of the sweep
//!
//! A trial builds the room for a number of targets and microphones, mixes
//! the images to the requested SINR and runs every configured algorithm on
//! the same mixture. Each algorithm yields one [`TrialRecord`] holding the
//! SDR / SIR trajectory (initial or per-callback values, then the final
//! ones). An algorithm failure does not abort the trial: its record gets NaN
//! scores and is appended to `error_<pid>.json` in the results directory.

use std::f64::consts::PI;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use overiva_core::layout::{random_layout, semi_circle_layout};
use overiva_core::mixing::mix_sinr;
use overiva_core::separation::{separate, Algorithm};
use overiva_core::signals::{synthetic_sources, wav_read_center};
use overiva_core::stft::StftConfig;
use overiva_core::{AlgorithmOptions, MultiChannel, Spectrogram};

use crate::error::{SimError, SimResult};
use crate::evaluation::{white_noise, Evaluation};
use crate::params::SweepParameters;
use crate::room::ShoeBox;

/// Seed of the random offsets used when centring the source signals.
const CENTER_SEED: u64 = 123;
/// Seed of the interferer layout, shared by all trials.
const INTERFERER_SEED: u64 = 1;

/// Serialises appends to the per-process error file.
static ERROR_FILE_LOCK: Mutex<()> = Mutex::new(());

/// Arguments of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialArgs {
    pub n_targets: usize,
    pub n_mics: usize,
    /// Key into the `rt60_list` of the parameters
    pub rt60: String,
    pub sinr: f64,
    /// Source signals; synthetic sources when empty
    pub wav_files: Vec<PathBuf>,
    pub seed: u64,
}

/// Result of one algorithm on one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub algorithm: String,
    pub n_targets: usize,
    pub n_mics: usize,
    pub rt60: String,
    pub sinr: f64,
    pub seed: u64,
    /// One row of per-target values per evaluation
    #[serde(with = "nan_as_null")]
    pub sdr: Vec<Vec<f64>>,
    #[serde(with = "nan_as_null")]
    pub sir: Vec<Vec<f64>>,
    /// Separation time in seconds, absent when the algorithm failed
    pub runtime: Option<f64>,
    pub n_samples: usize,
}

impl TrialRecord {
    fn new(algorithm: &str, args: &TrialArgs, n_samples: usize) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            n_targets: args.n_targets,
            n_mics: args.n_mics,
            rt60: args.rt60.clone(),
            sinr: args.sinr,
            seed: args.seed,
            sdr: Vec::new(),
            sir: Vec::new(),
            runtime: None,
            n_samples,
        }
    }

    /// Whether the last evaluation failed.
    pub fn failed(&self) -> bool {
        self.sdr.last().map_or(true, |row| row.iter().any(|v| v.is_nan()))
    }

    /// Final SDR / SIR, one value per target.
    pub fn final_scores(&self) -> Option<(&[f64], &[f64])> {
        Some((self.sdr.last()?.as_slice(), self.sir.last()?.as_slice()))
    }
}

/// JSON has no NaN: non-finite values are written as `null`, and `null`
/// reads back as NaN.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(rows: &[Vec<f64>], s: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<Vec<Option<f64>>> = rows
            .iter()
            .map(|r| r.iter().map(|v| v.is_finite().then_some(*v)).collect())
            .collect();
        rows.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<f64>>, D::Error> {
        let rows = Vec::<Vec<Option<f64>>>::deserialize(d)?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            .collect())
    }
}

/// The simulated mixture of a trial with everything needed to score it.
struct Scene {
    mix: MultiChannel,
    /// Targets then background, at microphone 0
    reference: MultiChannel,
    filler: Vec<f64>,
    n_samples: usize,
}

fn source_signals(params: &SweepParameters, args: &TrialArgs, n_sources: usize) -> SimResult<MultiChannel> {
    let mut signals = if args.wav_files.is_empty() {
        let n = (params.synthetic_duration * params.fs as f64).round() as usize;
        synthetic_sources(n_sources, n, params.fs, args.seed)
    } else {
        let (fs, signals) = wav_read_center(&args.wav_files, CENTER_SEED)?;
        if fs != params.fs {
            tracing::warn!(file_fs = fs, fs = params.fs, "sample rate of the corpus differs from the simulation");
        }
        signals
    };
    if signals.len() < n_sources {
        return Err(SimError::InvalidParameters(format!(
            "{} source signals for {n_sources} sources",
            signals.len()
        )));
    }
    // the last signals are used, so interferers keep their files across target counts
    Ok(signals.split_off(signals.len() - n_sources))
}

fn simulate_scene(params: &SweepParameters, args: &TrialArgs, rng: &mut StdRng) -> SimResult<Scene> {
    let n_targets = args.n_targets;
    let n_sources = params.n_sources(n_targets);
    let rt60 = params.rt60(&args.rt60)?;

    let mut sources_var = vec![1.0; n_targets];
    sources_var[0] = params.weak_source_var;

    let interferer_locs = random_layout(
        [3.0, 5.5, 1.5],
        params.n_interferers,
        [6.5, 1.0, 0.5],
        INTERFERER_SEED,
    );
    let target_locs = semi_circle_layout([4.1, 3.755, 1.2], PI / 1.5, 2.0, n_targets, 0.743 * PI);
    let mic_locs = semi_circle_layout([4.1, 3.76, 1.2], PI, 0.04, args.n_mics, PI / 2.0 * 0.99);

    let signals = source_signals(params, args, n_sources)?;

    let mut room = ShoeBox::new(params.room_dim, params.fs, rt60.absorption, rt60.max_order)?;
    for (signal, loc) in signals.into_iter().zip(target_locs.iter().chain(&interferer_locs)) {
        room.add_source(*loc, signal)?;
    }
    room.add_microphone_array(&mic_locs)?;
    room.compute_rir();
    let premix = room.simulate()?;
    let n_samples = premix[0][0].len();

    let mixture = mix_sinr(
        premix,
        n_targets,
        &sources_var,
        params.snr,
        args.sinr,
        params.ref_mic,
        rng,
    )?;
    let reference = mixture.reference.iter().map(|src| src[0].clone()).collect();
    let filler = white_noise(rng, n_samples, 1.0);

    Ok(Scene {
        mix: mixture.mix,
        reference,
        filler,
        n_samples,
    })
}

/// Append a failed record to `error_<pid>.json` in `results_dir`.
fn report_failure(results_dir: &Path, record: &TrialRecord) {
    let path = results_dir.join(format!("error_{}.json", std::process::id()));
    let _guard = ERROR_FILE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let written = serde_json::to_string_pretty(record)
        .map_err(std::io::Error::from)
        .and_then(|text| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{text}")
        });
    if let Err(e) = written {
        tracing::error!(path = %path.display(), error = %e, "could not write error record");
    }
}

fn run_algorithm(
    algo: Algorithm,
    x: &Spectrogram,
    n_targets: usize,
    params: &SweepParameters,
    kwargs: &AlgorithmOptions,
    eval: &Evaluation<'_>,
    record: &mut TrialRecord,
) -> SimResult<f64> {
    let sort = !params.is_overdetermined(algo);
    let mut callback_error = None;

    let start = Instant::now();
    let y = if params.monitor_convergence {
        let (sdr, sir) = (&mut record.sdr, &mut record.sir);
        let mut monitor = |y: &Spectrogram| match eval.evaluate(y, sort) {
            Ok((d, i)) => {
                sdr.push(d);
                sir.push(i);
            }
            Err(e) => {
                if callback_error.is_none() {
                    callback_error = Some(e);
                }
            }
        };
        separate(algo, x, n_targets, kwargs, Some(&mut monitor))?
    } else {
        separate(algo, x, n_targets, kwargs, None)?
    };
    let runtime = start.elapsed().as_secs_f64();

    if let Some(e) = callback_error {
        return Err(e);
    }
    let (sdr, sir) = eval.evaluate(&y, sort)?;
    record.sdr.push(sdr);
    record.sir.push(sir);
    Ok(runtime)
}

/// Run every configured algorithm on one simulated configuration.
///
/// Underdetermined configurations produce no records. Errors are returned
/// only when the scene itself cannot be built.
pub fn run_trial(
    params: &SweepParameters,
    args: &TrialArgs,
    results_dir: &Path,
) -> SimResult<Vec<TrialRecord>> {
    if args.n_mics < args.n_targets {
        return Ok(Vec::new());
    }
    if args.n_targets == 0 {
        return Err(SimError::InvalidParameters("a trial needs at least one target".into()));
    }
    let n_targets = args.n_targets;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let stft = StftConfig::half_overlap(params.stft_params.framesize)?;
    let scene = simulate_scene(params, args, &mut rng)?;
    let x = stft.analysis(&scene.mix)?;
    let eval = Evaluation::new(
        &stft,
        scene.reference,
        n_targets,
        vec![scene.filler],
        params.filter_len(),
    )?;

    let initial = if params.monitor_convergence {
        None
    } else {
        Some(eval.evaluate(&x, true)?)
    };

    let mut records = Vec::new();
    for (full_name, entry) in &params.algorithm_kwargs {
        let algo = entry.algo;
        if algo == Algorithm::AuxIvaPca && n_targets == 1 {
            continue;
        }
        if algo == Algorithm::Ogive && n_targets != 1 {
            continue;
        }

        let mut record = TrialRecord::new(full_name, args, scene.n_samples);
        if let Some((sdr, sir)) = &initial {
            record.sdr.push(sdr.clone());
            record.sir.push(sir.clone());
        }

        match run_algorithm(algo, &x, n_targets, params, &entry.kwargs, &eval, &mut record) {
            Ok(runtime) => {
                record.runtime = Some(runtime);
                tracing::debug!(
                    algorithm = %full_name,
                    n_targets,
                    n_mics = args.n_mics,
                    rt60 = %args.rt60,
                    sinr = args.sinr,
                    runtime,
                    "algorithm finished"
                );
            }
            Err(e) => {
                tracing::warn!(
                    algorithm = %full_name,
                    seed = args.seed,
                    error = %e,
                    "algorithm failed, recording NaN"
                );
                record.sdr.push(vec![f64::NAN; n_targets]);
                record.sir.push(vec![f64::NAN; n_targets]);
                report_failure(results_dir, &record);
            }
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::small_params;
    use crate::params::AlgorithmEntry;
    use tempfile::TempDir;

    fn args(n_targets: usize, n_mics: usize) -> TrialArgs {
        TrialArgs {
            n_targets,
            n_mics,
            rt60: "0.1".into(),
            sinr: 10.0,
            wav_files: vec![],
            seed: 42,
        }
    }

    #[test]
    fn test_underdetermined_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let records = run_trial(&small_params(), &args(3, 2), dir.path()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_records_initial_and_final() {
        let dir = TempDir::new().unwrap();
        let records = run_trial(&small_params(), &args(1, 2), dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.algorithm, "overiva");
        assert_eq!(r.sdr.len(), 2);
        assert_eq!(r.sir.len(), 2);
        assert!(r.sdr.iter().all(|row| row.len() == 1));
        assert!(!r.failed());
        assert!(r.runtime.is_some());
        assert!(r.n_samples > 8000);
    }

    #[test]
    fn test_deterministic_for_a_seed() {
        let dir = TempDir::new().unwrap();
        let a = run_trial(&small_params(), &args(1, 2), dir.path()).unwrap();
        let b = run_trial(&small_params(), &args(1, 2), dir.path()).unwrap();
        assert_eq!(a[0].sdr, b[0].sdr);
        assert_eq!(a[0].sir, b[0].sir);
    }

    #[test]
    fn test_algorithm_skips() {
        let dir = TempDir::new().unwrap();
        let mut params = small_params();
        for (name, algo) in [("pca", Algorithm::AuxIvaPca), ("ogive", Algorithm::Ogive)] {
            params.algorithm_kwargs.insert(
                name.into(),
                AlgorithmEntry {
                    algo,
                    kwargs: AlgorithmOptions {
                        n_iter: Some(10),
                        ..Default::default()
                    },
                },
            );
        }
        let names = |records: Vec<TrialRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.algorithm).collect()
        };
        let one = names(run_trial(&params, &args(1, 2), dir.path()).unwrap());
        assert_eq!(one, vec!["ogive", "overiva"]);

        params.n_mics_list = vec![3];
        let two = names(run_trial(&params, &args(2, 3), dir.path()).unwrap());
        assert_eq!(two, vec!["overiva", "pca"]);
    }

    #[test]
    fn test_monitor_convergence_uses_callback() {
        let dir = TempDir::new().unwrap();
        let mut params = small_params();
        params.monitor_convergence = true;
        params
            .algorithm_kwargs
            .get_mut("overiva")
            .unwrap()
            .kwargs
            .n_iter = Some(20);
        let records = run_trial(&params, &args(1, 2), dir.path()).unwrap();
        // callbacks at iterations 0 and 10, then the final evaluation
        assert_eq!(records[0].sdr.len(), 3);
    }

    #[test]
    fn test_failure_is_isolated_and_logged() {
        let dir = TempDir::new().unwrap();
        let mut params = small_params();
        params.algorithm_kwargs.insert(
            "ogive_bad_step".into(),
            AlgorithmEntry {
                algo: Algorithm::Ogive,
                kwargs: AlgorithmOptions {
                    step_size: Some(-1.0),
                    ..Default::default()
                },
            },
        );
        let records = run_trial(&params, &args(1, 2), dir.path()).unwrap();
        assert_eq!(records.len(), 2);

        let bad = records.iter().find(|r| r.algorithm == "ogive_bad_step").unwrap();
        assert!(bad.failed());
        assert!(bad.runtime.is_none());
        assert_eq!(bad.sdr.len(), 2);

        let good = records.iter().find(|r| r.algorithm == "overiva").unwrap();
        assert!(!good.failed());

        let err_file = dir.path().join(format!("error_{}.json", std::process::id()));
        let text = std::fs::read_to_string(err_file).unwrap();
        assert!(text.contains("ogive_bad_step"));
        assert!(text.contains("null"));
    }

    #[test]
    fn test_record_json_nan_round_trip() {
        let mut record = TrialRecord::new("overiva", &args(2, 4), 100);
        record.sdr = vec![vec![1.5, f64::NAN]];
        record.sir = vec![vec![f64::INFINITY, 3.0]];
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("[1.5,null]"));
        assert!(text.contains("\"runtime\":null"));

        let back: TrialRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.sdr[0][0], 1.5);
        assert!(back.sdr[0][1].is_nan());
        assert!(back.sir[0][0].is_nan());
        assert_eq!(back.n_samples, 100);
    }

    #[test]
    fn test_unknown_rt60_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut a = args(1, 2);
        a.rt60 = "9.9".into();
        assert!(matches!(
            run_trial(&small_params(), &a, dir.path()),
            Err(SimError::UnknownRt60(_))
        ));
    }
}
