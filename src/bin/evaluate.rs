//! Reference evaluator - stand-in for the locomotion simulator.
//!
//! Follows the worker contract: reads every individual of
//! `trial<T>/gen<G>` whose identity is in `[start, end)` and writes
//! `total<partition>.fit`. Fitness is the sum of every number in the
//! individual's record.

use std::fs;
use std::path::PathBuf;

use cpg_evolver::{
    evolution::TrialStore,
    schema::{FitnessTable, GEN_HOME_VAR},
};
use log::{debug, info};
use serde_json::Value;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() != 6 {
        eprintln!(
            "Usage: {} <trial> <generation> <start> <end> <partition>",
            args[0]
        );
        eprintln!();
        eprintln!("Reads individuals from $GEN_HOME/trial<T>/gen<G> (default: .)");
        std::process::exit(2);
    }

    let parse = |i: usize, name: &str| -> usize {
        args[i].parse().unwrap_or_else(|e| {
            eprintln!("Invalid {} {:?}: {}", name, args[i], e);
            std::process::exit(2);
        })
    };
    let trial = parse(1, "trial");
    let generation = parse(2, "generation");
    let start = parse(3, "start");
    let end = parse(4, "end");
    let partition = parse(5, "partition");

    let trial = u32::try_from(trial).unwrap_or_else(|_| {
        eprintln!("Trial id {} out of range", trial);
        std::process::exit(2);
    });
    let root = std::env::var_os(GEN_HOME_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let store = TrialStore::new(root, trial);

    let mut fitness = FitnessTable::new();
    for id in start..end {
        let ident = id.to_string();
        let path = store.individual_path(generation, &ident);
        let content = fs::read_to_string(&path).unwrap_or_else(|e| {
            eprintln!("Error reading {}: {}", path.display(), e);
            std::process::exit(1);
        });
        let record: Value = serde_json::from_str(&content).unwrap_or_else(|e| {
            eprintln!("Error parsing {}: {}", path.display(), e);
            std::process::exit(1);
        });
        let total = parameter_sum(&record);
        debug!("Individual {}: {}", ident, total);
        fitness.insert(ident, total);
    }

    let out = store.fitness_path(generation, partition);
    let json = serde_json::to_string(&fitness).unwrap_or_else(|e| {
        eprintln!("Error serializing fitness: {}", e);
        std::process::exit(1);
    });
    let mut tmp = out.clone().into_os_string();
    tmp.push(".tmp");
    if let Err(e) = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, &out)) {
        eprintln!("Error writing {}: {}", out.display(), e);
        std::process::exit(1);
    }
    info!(
        "Partition {} of generation {}: {} individuals written to {}",
        partition,
        generation,
        fitness.len(),
        out.display()
    );
}

/// Sum of every number anywhere in a JSON value.
fn parameter_sum(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Array(items) => items.iter().map(parameter_sum).sum(),
        Value::Object(map) => map.values().map(parameter_sum).sum(),
        _ => 0.0,
    }
}
