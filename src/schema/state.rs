//! Run-state types shared by the controller and its checkpoint dump.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{EvolverConfig, IndividualRecord};

/// Fitness per identity for one generation.
pub type FitnessTable = BTreeMap<String, f64>;

/// Phase of the generational state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RunPhase {
    /// No trial directory inspected yet.
    #[default]
    Bootstrap,
    /// Fresh population generated at generation 0.
    Initialized,
    /// Generational loop in progress.
    Running,
    /// Target generation reached.
    Done,
    /// Writing the failure dump.
    Checkpointing,
    /// Run terminated after a failure.
    Failed,
}

/// Full controller snapshot written to `trial<T>/dump.json` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Configuration the run was started with.
    pub config: EvolverConfig,
    /// Generation in flight when the snapshot was taken.
    pub generation: usize,
    /// Phase at the time of the snapshot.
    pub phase: RunPhase,
    /// Current population, ordered by identity.
    pub population: Vec<IndividualRecord>,
    /// Last merged fitness table, if one was computed.
    pub fitness: Option<FitnessTable>,
    /// Description of the failure that triggered the snapshot.
    pub error: Option<String>,
}

impl Checkpoint {
    /// Write the snapshot as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Read a snapshot back.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
