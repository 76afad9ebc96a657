//! Generational controller: bootstrap, run, checkpoint and recovery.

use std::cmp::Ordering;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use log::{error, info, warn};
use rayon::prelude::*;

use crate::schema::{
    Checkpoint, EvolverConfig, FitnessTable, Individual, MissingFitnessPolicy, RecombinationMethod,
    RunPhase,
};

use super::EvolutionError;
use super::dispatch::{Dispatcher, merge_fitness};
use super::factory::CpgFactory;
use super::population::{Population, TrialStore, ident_cmp};
use super::rng::{GenomeRng, INIT_STREAM};

/// Explicit state threaded through the generational loop.
#[derive(Debug, Clone)]
pub struct RunState {
    pub config: EvolverConfig,
    pub generation: usize,
    pub phase: RunPhase,
    pub population: Population,
    pub fitness: Option<FitnessTable>,
}

impl RunState {
    /// Empty state awaiting bootstrap.
    pub fn new(config: EvolverConfig) -> Self {
        Self {
            config,
            generation: 0,
            phase: RunPhase::Bootstrap,
            population: Population::new(),
            fitness: None,
        }
    }

    /// Serializable snapshot of the state.
    pub fn to_checkpoint(&self, error: Option<String>) -> Checkpoint {
        Checkpoint {
            config: self.config.clone(),
            generation: self.generation,
            phase: self.phase,
            population: self.population.to_records(),
            fitness: self.fitness.clone(),
            error,
        }
    }

    /// Rebuild a state from a snapshot.
    pub fn from_checkpoint(
        factory: &CpgFactory,
        checkpoint: Checkpoint,
    ) -> Result<Self, EvolutionError> {
        Ok(Self {
            population: Population::from_records(factory, checkpoint.population)?,
            config: checkpoint.config,
            generation: checkpoint.generation,
            phase: checkpoint.phase,
            fitness: checkpoint.fitness,
        })
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub trial: u32,
    /// Generation counter at the end of the run.
    pub generations: usize,
    /// Generation directory the run resumed from, if it was recovered.
    pub recovered_from: Option<usize>,
    /// Best identity and fitness of the last evaluated generation.
    pub best: Option<(String, f64)>,
}

/// Rank by fitness descending, NaN last.
fn descending(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Pick the `k` fittest individuals, returned worst first.
///
/// Ties are broken by ascending identity. Individuals without a fitness are
/// handled according to `policy`.
pub fn select_top_k<'p>(
    population: &'p Population,
    fitness: &FitnessTable,
    k: usize,
    policy: MissingFitnessPolicy,
    generation: usize,
) -> Result<Vec<(&'p Individual, f64)>, EvolutionError> {
    let mut ranked = Vec::with_capacity(population.len());
    let mut unranked = Vec::new();
    for individual in population.ordered() {
        match fitness.get(individual.ident()) {
            Some(&f) => ranked.push((individual, f)),
            None => unranked.push(individual),
        }
    }

    if !unranked.is_empty() {
        match policy {
            MissingFitnessPolicy::Exclude => warn!(
                "Generation {generation}: excluding {} individuals without fitness",
                unranked.len()
            ),
            MissingFitnessPolicy::Worst => {
                warn!(
                    "Generation {generation}: ranking {} individuals without fitness last",
                    unranked.len()
                );
                ranked.extend(unranked.into_iter().map(|i| (i, f64::NEG_INFINITY)));
            }
            MissingFitnessPolicy::Fail => {
                return Err(EvolutionError::PartialFailure {
                    generation,
                    missing: unranked
                        .into_iter()
                        .map(|i| i.ident().to_string())
                        .collect(),
                });
            }
        }
    }

    if ranked.is_empty() {
        return Err(EvolutionError::MissingData(format!(
            "generation {generation}: no individual has a fitness value"
        )));
    }

    ranked.sort_by(|a, b| descending(a.1, b.1).then_with(|| ident_cmp(a.0.ident(), b.0.ident())));
    ranked.truncate(k);
    ranked.reverse();
    Ok(ranked)
}

/// Top-k selection plus the parent count the configured crossover needs.
fn select_parents<'p>(
    config: &EvolverConfig,
    population: &'p Population,
    fitness: &FitnessTable,
    generation: usize,
) -> Result<Vec<(&'p Individual, f64)>, EvolutionError> {
    let parents = select_top_k(
        population,
        fitness,
        config.top_k,
        config.missing_fitness,
        generation,
    )?;
    if config.method == RecombinationMethod::Crossover
        && parents.len() < config.crossover_prob.len()
    {
        return Err(EvolutionError::MissingData(format!(
            "generation {generation}: {} ranked individuals, crossover needs {}",
            parents.len(),
            config.crossover_prob.len()
        )));
    }
    Ok(parents)
}

/// Drives one trial through its generations.
pub struct Controller {
    factory: CpgFactory,
    store: TrialStore,
    dispatcher: Dispatcher,
    seed: u64,
    state: RunState,
    recovered_from: Option<usize>,
    best: Option<(String, f64)>,
    cancelled: Arc<AtomicBool>,
}

impl Controller {
    /// Create a controller for a validated configuration.
    pub fn new(config: EvolverConfig) -> Result<Self, EvolutionError> {
        config.validate()?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        let cancelled = Arc::new(AtomicBool::new(false));

        Ok(Self {
            factory: CpgFactory::from_config(&config),
            store: TrialStore::new(&config.root_dir, config.trial),
            dispatcher: Dispatcher::new(&config).with_cancel_handle(Arc::clone(&cancelled)),
            seed,
            state: RunState::new(config),
            recovered_from: None,
            best: None,
            cancelled,
        })
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn population(&self) -> &Population {
        &self.state.population
    }

    pub fn store(&self) -> &TrialStore {
        &self.store
    }

    pub fn factory(&self) -> &CpgFactory {
        &self.factory
    }

    /// Bootstrap (recovering if the trial exists) and run to the target generation.
    pub fn start(&mut self) -> Result<RunSummary, EvolutionError> {
        self.bootstrap()?;
        self.run()
    }

    /// Prepare the first population to evaluate.
    ///
    /// Returns the generation recovered from, or `None` for a fresh population.
    pub fn bootstrap(&mut self) -> Result<Option<usize>, EvolutionError> {
        info!(
            "Trial {}: bootstrapping in {} (seed {})",
            self.store.trial(),
            self.store.trial_dir().display(),
            self.seed
        );

        let recovered = if self.store.exists() {
            self.recover()?
        } else {
            None
        };

        if recovered.is_none() {
            self.initialize();
        }
        self.recovered_from = recovered;
        Ok(recovered)
    }

    fn initialize(&mut self) {
        let mut rng = GenomeRng::for_stream(self.seed, INIT_STREAM);
        let size = self.state.config.population_size;

        self.state.population = Population::generate(&self.factory, &mut rng, size);
        self.state.generation = 0;
        self.state.fitness = None;
        self.state.phase = RunPhase::Initialized;
        info!("Generated {size} random individuals");
    }

    /// Resume from the newest generation whose population was fully written.
    fn recover(&mut self) -> Result<Option<usize>, EvolutionError> {
        let Some(latest) = self.store.latest_generation()? else {
            return Ok(None);
        };
        let size = self.state.config.population_size;

        let mut generation = latest;
        let source = loop {
            let written = self.store.individual_files(generation)?.len();
            if written >= size {
                break Some(generation);
            }
            warn!("Generation {generation} holds {written}/{size} individuals, skipping");
            if generation == 0 {
                break None;
            }
            generation -= 1;
        };
        let Some(source) = source else {
            warn!("No complete generation on disk, starting a fresh population");
            return Ok(None);
        };

        info!("Recovering from generation {source}");
        let population = self.store.load_generation(&self.factory, source)?;

        let mut fitness = merge_fitness(&self.store, source)?;
        if population.idents().iter().any(|id| !fitness.contains_key(*id)) {
            info!(
                "Generation {source} has {}/{} fitness values, re-evaluating",
                fitness.len(),
                population.len()
            );
            fitness = self.dispatcher.dispatch(&self.store, source, size)?.fitness;
        }

        let parents = select_parents(&self.state.config, &population, &fitness, source)?;
        let next = self.breed(source, &parents)?;

        self.state.population = next;
        self.state.fitness = Some(fitness);
        self.state.generation = source;
        self.state.phase = RunPhase::Running;
        Ok(Some(source))
    }

    /// Run the generational loop until the target generation is reached.
    ///
    /// Any failure inside the loop is checkpointed to `dump.json` and returned
    /// as [`EvolutionError::Fatal`].
    pub fn run(&mut self) -> Result<RunSummary, EvolutionError> {
        if self.state.phase == RunPhase::Bootstrap {
            self.bootstrap()?;
        }

        self.state.phase = RunPhase::Running;
        while self.state.generation < self.state.config.generations {
            if let Err(e) = self.run_generation() {
                return Err(self.fail(e));
            }
        }
        self.state.phase = RunPhase::Done;

        let summary = RunSummary {
            trial: self.store.trial(),
            generations: self.state.generation,
            recovered_from: self.recovered_from,
            best: self.best.clone(),
        };
        info!("Trial {} done: {summary:?}", summary.trial);
        Ok(summary)
    }

    /// Write, evaluate, select, recombine, advance.
    fn run_generation(&mut self) -> Result<(), EvolutionError> {
        if self.cancelled.load(AtomicOrdering::Relaxed) {
            return Err(EvolutionError::Cancelled);
        }

        let generation = self.state.generation;
        let size = self.state.config.population_size;
        info!("Generation {generation}: writing {size} individuals");

        self.store
            .write_population(generation, &self.state.population)?;

        let report = self.dispatcher.dispatch(&self.store, generation, size)?;
        let fitness = self.state.fitness.insert(report.fitness);

        let parents = select_parents(
            &self.state.config,
            &self.state.population,
            fitness,
            generation,
        )?;
        let best = parents
            .last()
            .map(|(i, f)| (i.ident().to_string(), *f));
        let next = self.breed(generation, &parents)?;

        if let Some((ident, f)) = &best {
            info!("Generation {generation}: best individual {ident} with fitness {f:.6}");
        }
        self.best = best;
        self.state.population = next;
        self.state.generation += 1;
        Ok(())
    }

    /// Recombine ranked parents into a full population.
    ///
    /// Draws are keyed by the parents' generation so the result is reproducible.
    fn breed(
        &self,
        source_generation: usize,
        parents: &[(&Individual, f64)],
    ) -> Result<Population, EvolutionError> {
        let config = &self.state.config;
        let factory = &self.factory;
        let parents: Vec<&Individual> = parents.iter().map(|(i, _)| *i).collect();

        let mut rng = GenomeRng::for_stream(self.seed, source_generation as u64);
        let seeds: Vec<u64> = (0..config.population_size)
            .map(|_| rng.next_seed())
            .collect();

        let children = seeds
            .into_par_iter()
            .enumerate()
            .map(|(i, seed)| {
                factory.mix(
                    &mut GenomeRng::new(seed),
                    &parents,
                    i.to_string(),
                    config.method,
                    config.mutation_prob,
                    &config.crossover_prob,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(children.into_iter().collect())
    }

    /// Checkpoint the run state and wrap `error` as fatal.
    fn fail(&mut self, error: EvolutionError) -> EvolutionError {
        let trial = self.store.trial();
        let generation = self.state.generation;
        error!("Trial {trial} failed at generation {generation}: {error}");

        self.state.phase = RunPhase::Checkpointing;
        let checkpoint = self.state.to_checkpoint(Some(error.to_string()));
        let path = self.store.dump_path();
        let dump = match fs::create_dir_all(self.store.trial_dir()).and_then(|_| checkpoint.save(&path))
        {
            Ok(()) => {
                info!("Run state dumped to {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Could not write checkpoint {}: {e}", path.display());
                None
            }
        };
        self.state.phase = RunPhase::Failed;

        EvolutionError::Fatal {
            trial,
            generation,
            dump,
            source: Box::new(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EvaluatorConfig;
    use tempfile::{TempDir, tempdir};

    fn test_config(dir: &TempDir) -> EvolverConfig {
        EvolverConfig {
            trial: 1,
            population_size: 6,
            top_k: 2,
            mutation_prob: 0.0,
            crossover_prob: vec![0.5, 0.5],
            method: RecombinationMethod::Crossover,
            oscillators: 3,
            body_oscillators: 2,
            workers: 2,
            generations: 2,
            root_dir: dir.path().to_path_buf(),
            evaluator: EvaluatorConfig {
                program: dir.path().join("missing-evaluator"),
                ..Default::default()
            },
            missing_fitness: MissingFitnessPolicy::Exclude,
            random_seed: Some(11),
        }
    }

    fn population_with_fitness(values: &[f64]) -> (Population, FitnessTable) {
        let factory = CpgFactory::new(2, 1);
        let population = Population::generate(&factory, &mut GenomeRng::new(0), values.len());
        let fitness = values
            .iter()
            .enumerate()
            .map(|(i, f)| (i.to_string(), *f))
            .collect();
        (population, fitness)
    }

    /// Write a complete generation with fitness equal to each identity.
    fn seed_generation(controller: &Controller, generation: usize) {
        let store = controller.store();
        let size = controller.state().config.population_size;
        let population =
            Population::generate(controller.factory(), &mut GenomeRng::new(99), size);
        store.write_population(generation, &population).unwrap();
        let fitness: FitnessTable = (0..size).map(|i| (i.to_string(), i as f64)).collect();
        fs::write(
            store.fitness_path(generation, 0),
            serde_json::to_string(&fitness).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_select_top_k_order() {
        let (population, fitness) = population_with_fitness(&[0.3, 0.9, 0.1, 0.7]);
        let top = select_top_k(&population, &fitness, 2, MissingFitnessPolicy::Exclude, 0).unwrap();

        let idents: Vec<&str> = top.iter().map(|(i, _)| i.ident()).collect();
        assert_eq!(idents, vec!["3", "1"]);
        assert_eq!(top[1].1, 0.9);
    }

    #[test]
    fn test_select_top_k_ties_and_nan() {
        let (population, fitness) = population_with_fitness(&[0.5, f64::NAN, 0.5, 0.5, 0.2]);
        let top = select_top_k(&population, &fitness, 3, MissingFitnessPolicy::Exclude, 0).unwrap();

        let idents: Vec<&str> = top.iter().map(|(i, _)| i.ident()).collect();
        // Best last; among equal fitness the lowest identity ranks highest.
        assert_eq!(idents, vec!["3", "2", "0"]);

        let all = select_top_k(&population, &fitness, 5, MissingFitnessPolicy::Exclude, 0).unwrap();
        assert_eq!(all[0].0.ident(), "1");
    }

    #[test]
    fn test_select_missing_policies() {
        let (population, mut fitness) = population_with_fitness(&[0.4, 0.8, 0.6]);
        fitness.remove("1");

        let excluded =
            select_top_k(&population, &fitness, 3, MissingFitnessPolicy::Exclude, 4).unwrap();
        assert_eq!(excluded.len(), 2);
        assert!(excluded.iter().all(|(i, _)| i.ident() != "1"));

        let worst = select_top_k(&population, &fitness, 3, MissingFitnessPolicy::Worst, 4).unwrap();
        assert_eq!(worst.len(), 3);
        assert_eq!(worst[0].0.ident(), "1");
        assert_eq!(worst[0].1, f64::NEG_INFINITY);

        match select_top_k(&population, &fitness, 3, MissingFitnessPolicy::Fail, 4) {
            Err(EvolutionError::PartialFailure {
                generation,
                missing,
            }) => {
                assert_eq!(generation, 4);
                assert_eq!(missing, vec!["1".to_string()]);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }

        let empty = FitnessTable::new();
        assert!(matches!(
            select_top_k(&population, &empty, 2, MissingFitnessPolicy::Exclude, 0),
            Err(EvolutionError::MissingData(_))
        ));
    }

    #[test]
    fn test_avg_breeds_from_fewer_parents_than_crossover_probs() {
        let dir = tempdir().unwrap();
        let config = EvolverConfig {
            method: RecombinationMethod::Avg,
            ..test_config(&dir)
        };
        let mut controller = Controller::new(config).unwrap();
        controller.bootstrap().unwrap();

        let mut fitness = FitnessTable::new();
        fitness.insert("0".to_string(), 1.0);

        let config = &controller.state().config;
        let population = controller.population();
        let parents = select_parents(config, population, &fitness, 0).unwrap();
        assert_eq!(parents.len(), 1);

        let next = controller.breed(0, &parents).unwrap();
        assert_eq!(next.len(), 6);
        let only = population.get("0").unwrap();
        for child in next.ordered() {
            assert_eq!(child.genes, only.genes);
        }

        // Crossover still needs one ranked parent per probability.
        let crossover = EvolverConfig {
            method: RecombinationMethod::Crossover,
            ..config.clone()
        };
        assert!(matches!(
            select_parents(&crossover, population, &fitness, 0),
            Err(EvolutionError::MissingData(_))
        ));
    }

    #[test]
    fn test_fresh_bootstrap() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();

        assert_eq!(controller.bootstrap().unwrap(), None);
        assert_eq!(controller.state().phase, RunPhase::Initialized);
        assert_eq!(controller.state().generation, 0);
        assert_eq!(controller.population().len(), 6);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = EvolverConfig {
            crossover_prob: vec![0.7, 0.7],
            ..test_config(&dir)
        };
        assert!(matches!(
            Controller::new(config),
            Err(EvolutionError::Config(_))
        ));
    }

    #[test]
    fn test_recover_from_complete_generation() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();
        seed_generation(&controller, 0);

        assert_eq!(controller.bootstrap().unwrap(), Some(0));
        assert_eq!(controller.state().generation, 0);
        assert_eq!(controller.state().phase, RunPhase::Running);
        assert_eq!(controller.state().fitness.as_ref().unwrap().len(), 6);

        // Parents are identities 4 and 5; crossover without mutation only copies their genes.
        let parents = controller
            .store()
            .load_generation(controller.factory(), 0)
            .unwrap();
        let gsl = [parents.get("4").unwrap().genes.gsl, parents.get("5").unwrap().genes.gsl];
        assert_eq!(controller.population().len(), 6);
        for child in controller.population().ordered() {
            assert!(gsl.contains(&child.genes.gsl));
        }

        // Same directory and seed give the same next population.
        let mut again = Controller::new(test_config(&dir)).unwrap();
        again.bootstrap().unwrap();
        assert_eq!(again.population(), controller.population());
    }

    #[test]
    fn test_recover_skips_incomplete_generation() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();
        seed_generation(&controller, 0);

        let partial = Population::generate(controller.factory(), &mut GenomeRng::new(5), 2);
        controller.store().write_population(1, &partial).unwrap();

        assert_eq!(controller.bootstrap().unwrap(), Some(0));
        assert_eq!(controller.state().generation, 0);
    }

    #[test]
    fn test_recover_without_complete_generation_starts_fresh() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();

        let partial = Population::generate(controller.factory(), &mut GenomeRng::new(5), 3);
        controller.store().write_population(0, &partial).unwrap();

        assert_eq!(controller.bootstrap().unwrap(), None);
        assert_eq!(controller.state().phase, RunPhase::Initialized);
        assert_eq!(controller.population().len(), 6);
    }

    #[test]
    fn test_failed_generation_is_checkpointed() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();

        let err = controller.start().unwrap_err();
        let EvolutionError::Fatal {
            trial,
            generation,
            dump,
            source,
        } = err
        else {
            panic!("expected fatal error");
        };
        assert_eq!(trial, 1);
        assert_eq!(generation, 0);
        assert!(matches!(*source, EvolutionError::MissingData(_)));
        assert_eq!(controller.state().phase, RunPhase::Failed);

        let dump = dump.expect("checkpoint written");
        assert_eq!(dump, controller.store().dump_path());
        let checkpoint = Checkpoint::load(&dump).unwrap();
        assert_eq!(checkpoint.phase, RunPhase::Checkpointing);
        assert_eq!(checkpoint.generation, 0);
        assert_eq!(checkpoint.population.len(), 6);
        assert!(checkpoint.fitness.unwrap().is_empty());

        let restored = RunState::from_checkpoint(controller.factory(), Checkpoint::load(&dump).unwrap())
            .unwrap();
        assert_eq!(&restored.population, controller.population());
    }

    #[test]
    fn test_cancelled_run_is_checkpointed() {
        let dir = tempdir().unwrap();
        let mut controller = Controller::new(test_config(&dir)).unwrap();
        controller
            .cancel_handle()
            .store(true, AtomicOrdering::Relaxed);

        match controller.start() {
            Err(EvolutionError::Fatal { source, dump, .. }) => {
                assert!(matches!(*source, EvolutionError::Cancelled));
                assert!(dump.is_some());
            }
            other => panic!("expected fatal cancellation, got {other:?}"),
        }
    }
}
