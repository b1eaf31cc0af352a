//! # overiva-sim
//!
//! Simulated room recordings and the experiment drivers built on them.
//!
//! ```text
//! parameters.json ─► generate_arguments ─► run_trial (rayon) ─► results.json
//!                                             │
//!        ShoeBox ─► premix ─► mix_sinr ─► STFT ─► separate ─► bss_eval
//! ```
//!
//! - [`room`]: shoebox image-source simulation
//! - [`params`]: sweep parameter file
//! - [`trial`] / [`sweep`]: one configuration, and the batch over all of them
//! - [`demo`]: the single-configuration interactive example
//! - [`evaluation`]: resynthesis and scoring shared by trials and demo

pub mod demo;
pub mod error;
pub mod evaluation;
pub mod params;
pub mod room;
pub mod sweep;
pub mod trial;

pub use demo::{run_demo, save_outputs, DemoConfig, DemoOutcome};
pub use error::{SimError, SimResult};
pub use evaluation::ConvergencePoint;
pub use params::{AlgorithmEntry, Rt60Entry, StftParams, SweepParameters};
pub use room::ShoeBox;
pub use sweep::{generate_arguments, run_sweep, SweepOptions, SweepSummary};
pub use trial::{run_trial, TrialArgs, TrialRecord};
