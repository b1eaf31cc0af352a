//! # overiva-core
//!
//! Multichannel blind source separation in the STFT domain, centred on
//! independent vector analysis with more microphones than sources
//! (OverIVA), together with the pieces needed to evaluate it.
//!
//! ## Overview
//!
//! - **Front end**: multichannel STFT analysis / overlap-add synthesis
//! - **Separation**: AuxIVA, OverIVA and its variants, AuxIVA on a PCA
//!   reduced mixture, OGIVE single-source extraction, ILRMA
//! - **Scale**: projection back onto a reference microphone
//! - **Evaluation**: BSS Eval SDR / SIR / SAR with optimal assignment
//! - **Scenarios**: layouts, source signals, SNR / SINR mixing, WAV I/O
//!
//! ## Signal Flow
//!
//! ```text
//! mics ── STFT ── X ── separate(algo) ── Y ── projection back ── iSTFT ── bss_eval ── SDR/SIR
//!                         ▲      │
//!                         └──────┘ callback every few iterations
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use overiva_core::separation::{separate, Algorithm, AlgorithmOptions};
//! use overiva_core::signals::synthetic_sources;
//! use overiva_core::stft::StftConfig;
//!
//! let sources = synthetic_sources(2, 32_000, 16_000, 1);
//! let mics: Vec<Vec<f64>> = [0.3, 1.2]
//!     .iter()
//!     .map(|g| sources[0].iter().zip(&sources[1]).map(|(a, b)| a + g * b).collect())
//!     .collect();
//!
//! let stft = StftConfig::half_overlap(1024).unwrap();
//! let x = stft.analysis(&mics).unwrap();
//! let y = separate(Algorithm::AuxIva, &x, 2, &AlgorithmOptions::default(), None).unwrap();
//! let separated = stft.synthesis(&y);
//! assert_eq!(separated.len(), 2);
//! ```

pub mod config;
pub mod layout;
pub mod linalg;
pub mod metrics;
pub mod mixing;
pub mod observe;
pub mod separation;
pub mod signals;
pub mod stft;
pub mod types;
pub mod wav;

pub use config::{ConfigError, EvalConfig, ToolConfig};
pub use metrics::{bss_eval_sources, BssEvalResult};
pub use separation::{separate, Algorithm, AlgorithmOptions, SourceModel};
pub use stft::{StftConfig, Window};
pub use types::{BssError, BssResult, Complex, MultiChannel, Spectrogram};
