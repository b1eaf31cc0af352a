//! Batch simulation sweep
//!
//! Expands the parameter file into one [`TrialArgs`] per combination of
//! target count, microphone count, RT60, SINR and source set, runs the
//! trials (in parallel unless asked otherwise) and stores everything in a
//! fresh results folder:
//!
//! ```text
//! <results_dir>/<YYYYMMDD-HHMMSS>_<name>/
//!     parameters.json   the parameters as run
//!     arguments.json    every trial's arguments
//!     results.json      all trial records
//!     error_<pid>.json  records of failed algorithms, if any
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use overiva_core::signals::{sampling, SampleCorpus};

use crate::error::{SimError, SimResult};
use crate::params::SweepParameters;
use crate::trial::{run_trial, TrialArgs, TrialRecord};

/// Number of trials run in test mode.
pub const TEST_TRIALS: usize = 2;

/// How a sweep is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOptions {
    /// Run trials one after the other
    pub serial: bool,
    /// Only run the first [`TEST_TRIALS`] trials
    pub test: bool,
    /// Parent of the timestamped results folder
    pub results_dir: PathBuf,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            serial: false,
            test: false,
            results_dir: PathBuf::from("data"),
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    /// Folder holding the JSON outputs
    pub output_dir: PathBuf,
    pub n_trials: usize,
    /// Trials whose scene could not be built
    pub failed_trials: usize,
    pub records: Vec<TrialRecord>,
}

/// One trial's arguments per combination, each with its own 32-bit seed.
///
/// Configurations with more targets than microphones are skipped. Without a
/// corpus every repeat uses synthetic sources.
pub fn generate_arguments(
    params: &SweepParameters,
    corpus: Option<&SampleCorpus>,
) -> SimResult<Vec<TrialArgs>> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let files_seed: u32 = rng.gen();

    let max_targets = params.n_targets_list.iter().copied().max().unwrap_or(0);
    let all_wav_files = match corpus {
        Some(corpus) => sampling(
            params.n_repeat,
            params.n_sources(max_targets),
            corpus,
            true,
            u64::from(files_seed),
        )?,
        None => vec![Vec::new(); params.n_repeat],
    };

    let mut args = Vec::new();
    for &n_targets in &params.n_targets_list {
        for &n_mics in &params.n_mics_list {
            if n_targets > n_mics {
                continue;
            }
            for rt60 in params.rt60_list.keys() {
                for &sinr in &params.sinr_list {
                    for wav_files in &all_wav_files {
                        let seed: u32 = rng.gen();
                        args.push(TrialArgs {
                            n_targets,
                            n_mics,
                            rt60: rt60.clone(),
                            sinr,
                            wav_files: wav_files.clone(),
                            seed: u64::from(seed),
                        });
                    }
                }
            }
        }
    }
    Ok(args)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> SimResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|e| SimError::io(path, e))
}

/// Create `<results_dir>/<timestamp>_<name>`.
fn create_output_dir(results_dir: &Path, name: &str) -> SimResult<PathBuf> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dir = results_dir.join(format!("{stamp}_{name}"));
    std::fs::create_dir_all(&dir).map_err(|e| SimError::io(&dir, e))?;
    Ok(dir)
}

/// Run the whole sweep described by `params`.
pub fn run_sweep(params: &SweepParameters, options: &SweepOptions) -> SimResult<SweepSummary> {
    params.validate()?;
    let corpus = params
        .samples_list
        .as_ref()
        .map(SampleCorpus::load)
        .transpose()?;

    let mut args = generate_arguments(params, corpus.as_ref())?;
    if options.test {
        args.truncate(TEST_TRIALS);
    }
    let output_dir = create_output_dir(&options.results_dir, &params.name)?;
    write_json(&output_dir.join("parameters.json"), params)?;
    write_json(&output_dir.join("arguments.json"), &args)?;

    let total = args.len();
    tracing::info!(
        name = %params.name,
        trials = total,
        serial = options.serial,
        dir = %output_dir.display(),
        "starting sweep"
    );

    let done = AtomicUsize::new(0);
    let run_one = |a: &TrialArgs| {
        let outcome = run_trial(params, a, &output_dir);
        let n = done.fetch_add(1, Ordering::Relaxed) + 1;
        match &outcome {
            Ok(records) => tracing::info!(
                done = n,
                total,
                n_targets = a.n_targets,
                n_mics = a.n_mics,
                rt60 = %a.rt60,
                sinr = a.sinr,
                records = records.len(),
                "trial complete"
            ),
            Err(e) => tracing::error!(
                done = n,
                total,
                seed = a.seed,
                error = %e,
                "trial failed"
            ),
        }
        outcome
    };
    let outcomes: Vec<SimResult<Vec<TrialRecord>>> = if options.serial {
        args.iter().map(run_one).collect()
    } else {
        args.par_iter().map(run_one).collect()
    };

    let mut records = Vec::new();
    let mut failed_trials = 0;
    for outcome in outcomes {
        match outcome {
            Ok(r) => records.extend(r),
            Err(_) => failed_trials += 1,
        }
    }
    write_json(&output_dir.join("results.json"), &records)?;

    let failed_algorithms = records.iter().filter(|r| r.failed()).count();
    tracing::info!(
        records = records.len(),
        failed_trials,
        failed_algorithms,
        "sweep finished"
    );

    Ok(SweepSummary {
        output_dir,
        n_trials: total,
        failed_trials,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::small_params;
    use crate::params::Rt60Entry;
    use overiva_core::signals::SampleFile;

    #[test]
    fn test_argument_grid() {
        let mut params = small_params();
        params.n_repeat = 2;
        params.n_targets_list = vec![1, 3];
        params.n_mics_list = vec![2, 4];
        params.sinr_list = vec![0.0, 5.0, 10.0];
        params.rt60_list.insert(
            "0.3".into(),
            Rt60Entry {
                absorption: 0.35,
                max_order: 17,
            },
        );

        let args = generate_arguments(&params, None).unwrap();
        // (1,2), (1,4), (3,4) × 2 rt60 × 3 sinr × 2 repeats
        assert_eq!(args.len(), 3 * 2 * 3 * 2);
        assert!(args.iter().all(|a| a.n_targets <= a.n_mics));
        assert!(args.iter().all(|a| a.seed <= u64::from(u32::MAX)));

        let again = generate_arguments(&params, None).unwrap();
        assert_eq!(args, again);

        params.seed += 1;
        let other = generate_arguments(&params, None).unwrap();
        assert_ne!(args[0].seed, other[0].seed);
    }

    #[test]
    fn test_arguments_with_corpus() {
        let files = (0..6)
            .map(|i| SampleFile {
                path: PathBuf::from(format!("s{i}.wav")),
                speaker: format!("spk{i}"),
                sex: if i % 2 == 0 { "F".into() } else { "M".into() },
            })
            .collect();
        let corpus = SampleCorpus::from_files(files).unwrap();

        let mut params = small_params();
        params.n_repeat = 3;
        params.n_targets_list = vec![1, 2];
        params.n_mics_list = vec![2];
        let args = generate_arguments(&params, Some(&corpus)).unwrap();
        assert_eq!(args.len(), 2 * 3);
        // interferers plus the largest target count
        assert!(args.iter().all(|a| a.wav_files.len() == 3));
    }
}
