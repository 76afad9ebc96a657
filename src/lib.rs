//! CPG Evolver - Generational search over central pattern generator controllers.
//!
//! Populations of oscillator-network parameter sets are evolved with a
//! genetic algorithm whose fitness comes from external evaluator processes.
//! All communication with the evaluators goes through the trial directory.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration, individual and run-state types
//! - `evolution`: Factory, population store, worker dispatch and the generational controller
//!
//! # Example
//!
//! ```rust,no_run
//! use cpg_evolver::{
//!     evolution::{CpgFactory, GenomeRng},
//!     schema::RecombinationMethod,
//! };
//!
//! let factory = CpgFactory::new(20, 16);
//! let mut rng = GenomeRng::new(42);
//!
//! let worse = factory.make(&mut rng, "0");
//! let better = factory.make(&mut rng, "1");
//!
//! let child = factory
//!     .mix(
//!         &mut rng,
//!         &[&worse, &better],
//!         "2",
//!         RecombinationMethod::Crossover,
//!         0.05,
//!         &[0.3, 0.7],
//!     )
//!     .unwrap();
//!
//! println!("Offspring gsl = {}", child.genes.gsl);
//! ```

pub mod evolution;
pub mod schema;

// Re-export commonly used types
pub use evolution::{Controller, CpgFactory, EvolutionError, Population};
pub use schema::{EvolverConfig, Individual, RecombinationMethod};
