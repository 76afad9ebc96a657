//! Generational search over CPG individuals with externally evaluated fitness.
//!
//! # Overview
//!
//! - **Factory** (`factory`): random individuals, recombination and mutation
//! - **Population store** (`population`): in-memory population and the trial directory protocol
//! - **Dispatcher** (`dispatch`): fans evaluation out to worker processes and merges their fitness files
//! - **Controller** (`controller`): bootstrap/run/checkpoint/recover state machine and selection
//!
//! # Example
//!
//! ```rust,no_run
//! use cpg_evolver::schema::EvolverConfig;
//! use cpg_evolver::evolution::Controller;
//!
//! let config = EvolverConfig {
//!     trial: 1,
//!     ..Default::default()
//! };
//!
//! let mut controller = Controller::new(config).expect("valid configuration");
//! match controller.start() {
//!     Ok(summary) => println!("Finished {} generations", summary.generations),
//!     Err(e) => eprintln!("{e}"),
//! }
//! ```

use std::io;
use std::path::PathBuf;

use crate::schema::ConfigError;

mod controller;
mod dispatch;
mod factory;
mod population;
mod rng;

pub use controller::{Controller, RunState, RunSummary, select_top_k};
pub use dispatch::{
    DispatchReport, Dispatcher, WorkerJob, WorkerOutcome, merge_fitness, merge_tables, partition,
};
pub use factory::CpgFactory;
pub use population::{Population, TrialStore, ident_cmp};
pub use rng::{GenomeRng, INIT_STREAM};

/// Errors raised while evolving a trial.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Missing data: {0}")]
    MissingData(String),
    #[error("Generation {generation}: no fitness for {} individual(s)", .missing.len())]
    PartialFailure {
        generation: usize,
        missing: Vec<String>,
    },
    #[error("Evaluation cancelled")]
    Cancelled,
    #[error(
        "Trial {trial} failed at generation {generation} (checkpoint: {})",
        .dump.as_ref().map_or_else(|| "not written".to_string(), |p| p.display().to_string())
    )]
    Fatal {
        trial: u32,
        generation: usize,
        dump: Option<PathBuf>,
        #[source]
        source: Box<EvolutionError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
