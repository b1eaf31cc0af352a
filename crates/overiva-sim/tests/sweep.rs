//! Small end-to-end sweeps written to a temporary results directory.

use std::path::Path;

use tempfile::TempDir;

use overiva_sim::{run_sweep, SweepOptions, SweepParameters, TrialArgs, TrialRecord};

const PARAMS: &str = r#"{
    "name": "tiny",
    "seed": 12345,
    "n_repeat": 1,
    "fs": 8000,
    "snr": 60,
    "n_interferers": 2,
    "ref_mic": 0,
    "room_dim": [10, 7.5, 3],
    "weak_source_var": 0.5,
    "rt60_list": { "0.1": { "absorption": 0.8, "max_order": 2 } },
    "n_targets_list": [1, 2],
    "n_mics_list": [2, 3],
    "sinr_list": [10],
    "stft_params": { "framesize": 256 },
    "algorithm_kwargs": {
        "overiva": { "algo": "overiva", "kwargs": { "n_iter": 10 } },
        "ogive_broken": { "algo": "ogive", "kwargs": { "step_size": 0.0 } }
    },
    "bss_eval_filter_len": 64,
    "synthetic_duration": 1.0
}"#;

fn single_output_dir(results: &Path) -> std::path::PathBuf {
    let dirs: Vec<_> = std::fs::read_dir(results)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(dirs.len(), 1);
    dirs.into_iter().next().unwrap()
}

#[test]
fn serial_sweep_writes_all_outputs() {
    let tmp = TempDir::new().unwrap();
    let params = SweepParameters::from_json(PARAMS).unwrap();
    let options = SweepOptions {
        serial: true,
        test: false,
        results_dir: tmp.path().to_path_buf(),
    };
    let summary = run_sweep(&params, &options).unwrap();

    // (1,2), (1,3), (2,2), (2,3)
    assert_eq!(summary.n_trials, 4);
    assert_eq!(summary.failed_trials, 0);
    assert_eq!(summary.output_dir, single_output_dir(tmp.path()));
    assert!(summary
        .output_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("_tiny"));

    let args: Vec<TrialArgs> = serde_json::from_str(
        &std::fs::read_to_string(summary.output_dir.join("arguments.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(args.len(), 4);

    let stored: SweepParameters = serde_json::from_str(
        &std::fs::read_to_string(summary.output_dir.join("parameters.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(stored, params);

    let records: Vec<TrialRecord> = serde_json::from_str(
        &std::fs::read_to_string(summary.output_dir.join("results.json")).unwrap(),
    )
    .unwrap();
    // overiva everywhere, ogive only for the two single-target trials
    assert_eq!(records.len(), 4 + 2);
    assert_eq!(records.len(), summary.records.len());

    for r in &records {
        assert_eq!(r.sdr.len(), 2, "initial and final evaluation");
        assert!(r.sdr.iter().all(|row| row.len() == r.n_targets));
        if r.algorithm == "overiva" {
            assert!(!r.failed());
            assert!(r.runtime.unwrap() >= 0.0);
        } else {
            assert_eq!(r.algorithm, "ogive_broken");
            assert_eq!(r.n_targets, 1);
            assert!(r.failed());
            assert!(r.runtime.is_none());
        }
    }

    let errors = std::fs::read_dir(&summary.output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("error_"))
        .count();
    assert_eq!(errors, 1);
}

#[test]
fn test_mode_limits_trials_and_runs_in_parallel() {
    let tmp = TempDir::new().unwrap();
    let params = SweepParameters::from_json(PARAMS).unwrap();
    let options = SweepOptions {
        serial: false,
        test: true,
        results_dir: tmp.path().to_path_buf(),
    };
    let summary = run_sweep(&params, &options).unwrap();
    assert_eq!(summary.n_trials, overiva_sim::sweep::TEST_TRIALS);
    assert!(summary.records.iter().any(|r| r.algorithm == "overiva" && !r.failed()));
}
