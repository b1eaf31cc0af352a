//! Source signals for experiments
//!
//! Speech samples come from a corpus described by a small metadata file:
//!
//! ```json
//! { "files": [ { "path": "f1/a.wav", "speaker": "f1", "sex": "F" }, ... ] }
//! ```
//!
//! Paths are relative to the directory holding the metadata file. When no
//! corpus is available, [`synthetic_sources`] produces bursty, coloured,
//! super-Gaussian signals with a similar temporal structure.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::types::{BssError, BssResult, MultiChannel};
use crate::wav::read_wav_mono;

/// One corpus entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFile {
    pub path: PathBuf,
    pub speaker: String,
    pub sex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    files: Vec<SampleFile>,
}

/// Speech corpus with absolute file paths.
#[derive(Debug, Clone)]
pub struct SampleCorpus {
    files: Vec<SampleFile>,
}

impl SampleCorpus {
    /// Load a metadata file, resolving paths against its directory.
    pub fn load(metadata: impl AsRef<Path>) -> BssResult<Self> {
        let metadata = metadata.as_ref();
        let text = std::fs::read_to_string(metadata)?;
        let meta: Metadata = serde_json::from_str(&text)?;
        let root = metadata.parent().unwrap_or_else(|| Path::new("."));
        let files = meta
            .files
            .into_iter()
            .map(|f| SampleFile {
                path: if f.path.is_absolute() { f.path } else { root.join(&f.path) },
                ..f
            })
            .collect();
        Self::from_files(files)
    }

    pub fn from_files(files: Vec<SampleFile>) -> BssResult<Self> {
        if files.is_empty() {
            return Err(BssError::InvalidParameter("sample corpus is empty".into()));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[SampleFile] {
        &self.files
    }

    /// Files grouped by speaker, speakers grouped by sex.
    fn by_sex(&self) -> BTreeMap<&str, BTreeMap<&str, Vec<&SampleFile>>> {
        let mut out: BTreeMap<&str, BTreeMap<&str, Vec<&SampleFile>>> = BTreeMap::new();
        for f in &self.files {
            out.entry(f.sex.as_str())
                .or_default()
                .entry(f.speaker.as_str())
                .or_default()
                .push(f);
        }
        out
    }

    pub fn n_speakers(&self) -> usize {
        self.by_sex().values().map(|s| s.len()).sum()
    }
}

/// Draw `n_repeat` lists of `n_sources` files, each list from distinct speakers.
///
/// With `gender_balanced` the lists alternate between sexes (starting with
/// a random one) for as long as both have unused speakers left.
pub fn sampling(
    n_repeat: usize,
    n_sources: usize,
    corpus: &SampleCorpus,
    gender_balanced: bool,
    seed: u64,
) -> BssResult<Vec<Vec<PathBuf>>> {
    let groups = corpus.by_sex();
    let n_speakers: usize = groups.values().map(|s| s.len()).sum();
    if n_sources > n_speakers {
        return Err(BssError::InvalidParameter(format!(
            "{n_sources} sources requested but the corpus has {n_speakers} speakers"
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);

    let mut out = Vec::with_capacity(n_repeat);
    for _ in 0..n_repeat {
        let mut pools: Vec<Vec<&Vec<&SampleFile>>> = if gender_balanced {
            groups.values().map(|s| s.values().collect()).collect()
        } else {
            vec![groups.values().flat_map(|s| s.values()).collect()]
        };
        for pool in pools.iter_mut() {
            pool.shuffle(&mut rng);
        }
        let mut turn = rng.gen_range(0..pools.len());

        let mut chosen = Vec::with_capacity(n_sources);
        while chosen.len() < n_sources {
            if pools[turn].is_empty() {
                turn = (turn + 1) % pools.len();
                continue;
            }
            if let Some(speaker_files) = pools[turn].pop() {
                if let Some(file) = speaker_files.choose(&mut rng) {
                    chosen.push(file.path.clone());
                }
            }
            turn = (turn + 1) % pools.len();
        }
        out.push(chosen);
    }
    Ok(out)
}

/// Read mono files and centre them at random offsets in equal-length buffers.
///
/// Every buffer has the length of the longest file; shorter signals start
/// at a uniformly drawn offset. All files must share one sample rate.
pub fn wav_read_center(files: &[PathBuf], seed: u64) -> BssResult<(u32, MultiChannel)> {
    let mut fs = None;
    let mut signals = Vec::with_capacity(files.len());
    for path in files {
        let (rate, signal) = read_wav_mono(path)?;
        match fs {
            None => fs = Some(rate),
            Some(f) if f != rate => {
                return Err(BssError::Wav(format!(
                    "{} has sample rate {rate}, expected {f}",
                    path.display()
                )))
            }
            _ => {}
        }
        signals.push(signal);
    }
    let fs = fs.ok_or_else(|| BssError::InvalidParameter("no files to read".into()))?;
    Ok((fs, center_signals(signals, seed)))
}

/// Place each signal at a random offset in a buffer of the longest length.
pub fn center_signals(signals: Vec<Vec<f64>>, seed: u64) -> MultiChannel {
    let mut rng = StdRng::seed_from_u64(seed);
    let max_len = signals.iter().map(|s| s.len()).max().unwrap_or(0);
    signals
        .into_iter()
        .map(|s| {
            let offset = rng.gen_range(0..=max_len - s.len());
            let mut buf = vec![0.0; max_len];
            buf[offset..offset + s.len()].copy_from_slice(&s);
            buf
        })
        .collect()
}

/// Laplacian sample by inverse CDF.
fn laplace<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
}

/// Speech-like test signals at unit standard deviation.
///
/// Each source is Laplacian noise through a resonator at its own centre
/// frequency, gated by syllable-length bursts with smooth ramps.
pub fn synthetic_sources(n: usize, n_samples: usize, fs: u32, seed: u64) -> MultiChannel {
    let mut rng = StdRng::seed_from_u64(seed);
    let fs = fs.max(1) as f64;
    (0..n)
        .map(|_| {
            let f0 = rng.gen_range(200.0..1500.0);
            let radius: f64 = rng.gen_range(0.90..0.98);
            let a1 = 2.0 * radius * (2.0 * PI * f0 / fs).cos();
            let a2 = -radius * radius;

            let mut envelope = vec![0.0; n_samples];
            let mut pos = 0;
            while pos < n_samples {
                let len = ((rng.gen_range(0.1..0.3) * fs) as usize).max(8);
                let active = rng.gen_bool(0.7);
                let gain = if active { rng.gen_range(0.3..1.0) } else { 0.0 };
                let end = (pos + len).min(n_samples);
                for (i, e) in envelope[pos..end].iter_mut().enumerate() {
                    let ramp = (PI * i as f64 / len as f64).sin();
                    *e = gain * ramp;
                }
                pos = end;
            }

            let (mut y1, mut y2) = (0.0, 0.0);
            let mut signal: Vec<f64> = envelope
                .iter()
                .map(|g| {
                    let y = laplace(&mut rng) + a1 * y1 + a2 * y2;
                    y2 = y1;
                    y1 = y;
                    g * y
                })
                .collect();

            let n = signal.len().max(1) as f64;
            let mean = signal.iter().sum::<f64>() / n;
            let std = (signal.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            if std > 0.0 {
                for v in signal.iter_mut() {
                    *v /= std;
                }
            }
            signal
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::WavWriter;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn corpus() -> SampleCorpus {
        let mut files = Vec::new();
        for (sex, prefix) in [("F", "f"), ("M", "m")] {
            for s in 0..4 {
                for k in 0..3 {
                    files.push(SampleFile {
                        path: PathBuf::from(format!("{prefix}{s}/{k}.wav")),
                        speaker: format!("{prefix}{s}"),
                        sex: sex.to_string(),
                    });
                }
            }
        }
        SampleCorpus::from_files(files).unwrap()
    }

    fn speaker_of(p: &Path) -> String {
        p.parent().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn test_sampling_distinct_and_balanced() {
        let c = corpus();
        assert_eq!(c.n_speakers(), 8);
        let lists = sampling(5, 6, &c, true, 16).unwrap();
        assert_eq!(lists.len(), 5);
        for list in &lists {
            let speakers: HashSet<String> = list.iter().map(|p| speaker_of(p)).collect();
            assert_eq!(speakers.len(), 6);
            let female = speakers.iter().filter(|s| s.starts_with('f')).count();
            assert_eq!(female, 3);
        }
        assert_eq!(lists, sampling(5, 6, &c, true, 16).unwrap());
    }

    #[test]
    fn test_sampling_unbalanced_and_too_many() {
        let c = corpus();
        let lists = sampling(2, 8, &c, false, 1).unwrap();
        let speakers: HashSet<String> = lists[0].iter().map(|p| speaker_of(p)).collect();
        assert_eq!(speakers.len(), 8);
        assert!(sampling(1, 9, &c, true, 1).is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let meta = dir.path().join("metadata.json");
        std::fs::write(
            &meta,
            r#"{"files": [{"path": "a/x.wav", "speaker": "a", "sex": "F"}]}"#,
        )
        .unwrap();
        let c = SampleCorpus::load(&meta).unwrap();
        assert_eq!(c.files()[0].path, dir.path().join("a/x.wav"));
    }

    #[test]
    fn test_wav_read_center_pads_to_longest() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for (i, len) in [100usize, 250, 40].iter().enumerate() {
            let p = dir.path().join(format!("{i}.wav"));
            let mut w = WavWriter::create(&p, 16000, 1).unwrap();
            w.write_frames(&[vec![0.5; *len]]).unwrap();
            w.close().unwrap();
            paths.push(p);
        }
        let (fs, signals) = wav_read_center(&paths, 123).unwrap();
        assert_eq!(fs, 16000);
        assert!(signals.iter().all(|s| s.len() == 250));
        let nonzero: Vec<usize> = signals
            .iter()
            .map(|s| s.iter().filter(|v| v.abs() > 0.0).count())
            .collect();
        assert_eq!(nonzero, vec![100, 250, 40]);
    }

    #[test]
    fn test_synthetic_sources_are_bursty() {
        let s = synthetic_sources(3, 32_000, 16000, 4);
        assert_eq!(s.len(), 3);
        for x in &s {
            let n = x.len() as f64;
            let m2 = x.iter().map(|v| v * v).sum::<f64>() / n;
            let m4 = x.iter().map(|v| v.powi(4)).sum::<f64>() / n;
            assert!((m2 - 1.0).abs() < 0.01);
            // super-Gaussian: kurtosis above that of a Gaussian
            assert!(m4 / (m2 * m2) > 3.0);
        }
        assert_eq!(s, synthetic_sources(3, 32_000, 16000, 4));
    }
}
