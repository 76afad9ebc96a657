//! CPG Evolver CLI - Run (or resume) an evolution trial from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use cpg_evolver::{
    evolution::{Controller, EvolutionError},
    schema::EvolverConfig,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!();
        eprintln!("Run a CPG evolution trial from JSON configuration.");
        eprintln!("An existing trial directory is resumed from its newest generation.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to trial configuration file");
        eprintln!();
        eprintln!("Environment:");
        eprintln!("  GEN_HOME     Overrides root_dir from the configuration");
        eprintln!("  RUST_LOG     Log level (e.g. info, debug)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: EvolverConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });
    let config = config.with_env_overrides();

    println!("CPG Evolver");
    println!("===========");
    println!("Trial: {}", config.trial);
    println!("Root: {}", config.root_dir.display());
    println!(
        "Population: {} (top {}, {:?})",
        config.population_size, config.top_k, config.method
    );
    println!("Oscillators: {}", config.oscillators);
    println!("Workers: {}", config.effective_workers());
    println!("Generations: {}", config.generations);
    println!();

    let mut controller = Controller::new(config).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    let start = Instant::now();
    match controller.start() {
        Ok(summary) => {
            println!();
            if let Some(generation) = summary.recovered_from {
                println!("Resumed from generation {}", generation);
            }
            println!("Reached generation {}", summary.generations);
            if let Some((ident, fitness)) = summary.best {
                println!("Best of last evaluated generation: {} ({:.6})", ident, fitness);
            }
            println!("Time: {:.2}s", start.elapsed().as_secs_f32());
        }
        Err(EvolutionError::Fatal {
            trial,
            generation,
            dump,
            source,
        }) => {
            eprintln!("Trial {} failed at generation {}: {}", trial, generation, source);
            match dump {
                Some(path) => eprintln!("Checkpoint written to {}", path.display()),
                None => eprintln!("Checkpoint could not be written"),
            }
            eprintln!("Re-run the same command to resume.");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_example_config() {
    let config = EvolverConfig {
        trial: 1,
        ..Default::default()
    };

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
