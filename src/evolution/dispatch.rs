//! Fitness evaluation fan-out to external worker processes.
//!
//! Each generation the population id-space is split into one contiguous
//! partition per worker. Every worker reads its individuals from the
//! generation directory and writes `total<partition>.fit`; the dispatcher
//! waits for all of them before merging whatever files were produced.

use std::fs;
use std::ops::Range;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::schema::{EvaluatorConfig, EvolverConfig, FitnessTable, GEN_HOME_VAR};

use super::EvolutionError;
use super::population::TrialStore;

/// Interval between worker status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Split `[0, population)` into `workers` contiguous ranges.
///
/// Every range holds `population / workers` ids; the remainder goes to the last
/// one. `workers` is clamped to `1..=population`.
pub fn partition(population: usize, workers: usize) -> Vec<Range<usize>> {
    if population == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, population);
    let chunk = population / workers;
    (0..workers)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == workers {
                population
            } else {
                start + chunk
            };
            start..end
        })
        .collect()
}

/// Merge partition tables. Partitions cover disjoint identities, so order does not matter.
pub fn merge_tables<I>(tables: I) -> FitnessTable
where
    I: IntoIterator<Item = FitnessTable>,
{
    let mut merged = FitnessTable::new();
    for table in tables {
        merged.extend(table);
    }
    merged
}

/// Merge every partition fitness file present for a generation.
///
/// Absent partitions are simply not represented. Files that cannot be read or
/// parsed are logged and skipped; only listing the directory can fail.
pub fn merge_fitness(store: &TrialStore, generation: usize) -> Result<FitnessTable, EvolutionError> {
    let mut tables = Vec::new();
    for (partition, path) in store.fitness_files(generation)? {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Ignoring unreadable fitness file {}: {e}", path.display());
                continue;
            }
        };
        match serde_json::from_str::<FitnessTable>(&content) {
            Ok(table) => {
                debug!(
                    "Partition {partition}: {} fitness values from {}",
                    table.len(),
                    path.display()
                );
                tables.push(table);
            }
            Err(e) => warn!("Ignoring malformed fitness file {}: {e}", path.display()),
        }
    }
    Ok(merge_tables(tables))
}

/// One evaluator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub trial: u32,
    pub generation: usize,
    pub range: Range<usize>,
    pub partition: usize,
}

impl WorkerJob {
    /// Positional arguments: `<trial> <generation> <start> <end> <partition>`.
    pub fn args(&self) -> [String; 5] {
        [
            self.trial.to_string(),
            self.generation.to_string(),
            self.range.start.to_string(),
            self.range.end.to_string(),
            self.partition.to_string(),
        ]
    }
}

/// How one worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exited with status 0.
    Succeeded,
    /// Exited with a non-zero status (`None` when killed by a signal).
    Exited(Option<i32>),
    /// Killed after exceeding the configured timeout.
    TimedOut,
    /// Could not be started or waited on.
    SpawnFailed(String),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Succeeded)
    }
}

/// Result of one dispatch round.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Merged fitness of every partition that produced a file.
    pub fitness: FitnessTable,
    /// Every job with its outcome, in partition order.
    pub jobs: Vec<(WorkerJob, WorkerOutcome)>,
    /// Partitions whose fitness file is absent after the barrier.
    pub missing_partitions: Vec<usize>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.missing_partitions.is_empty()
    }
}

/// Runs the external evaluator for every partition of a generation.
pub struct Dispatcher {
    evaluator: EvaluatorConfig,
    workers: usize,
    cancelled: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Create a dispatcher for a run.
    pub fn new(config: &EvolverConfig) -> Self {
        Self {
            evaluator: config.evaluator.clone(),
            workers: config.effective_workers(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing cancellation flag.
    pub fn with_cancel_handle(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Jobs for one generation.
    pub fn jobs(&self, trial: u32, generation: usize, population: usize) -> Vec<WorkerJob> {
        partition(population, self.workers)
            .into_iter()
            .enumerate()
            .map(|(partition, range)| WorkerJob {
                trial,
                generation,
                range,
                partition,
            })
            .collect()
    }

    fn command(&self, store: &TrialStore, job: &WorkerJob) -> Command {
        let mut cmd = Command::new(&self.evaluator.program);
        cmd.args(&self.evaluator.args)
            .args(job.args())
            .env(GEN_HOME_VAR, store.root())
            .stdin(Stdio::null());
        cmd
    }

    /// Evaluate a written generation and block until every worker has finished.
    ///
    /// Worker failures leave gaps in the merged table rather than failing the
    /// call; only cancellation and I/O errors on the generation directory abort.
    pub fn dispatch(
        &self,
        store: &TrialStore,
        generation: usize,
        population: usize,
    ) -> Result<DispatchReport, EvolutionError> {
        let jobs = self.jobs(store.trial(), generation, population);
        info!(
            "Dispatching generation {generation}: {population} individuals over {} workers",
            jobs.len()
        );

        let mut outcomes: Vec<Option<WorkerOutcome>> = vec![None; jobs.len()];
        let mut running: Vec<(usize, Child)> = Vec::with_capacity(jobs.len());

        for (i, job) in jobs.iter().enumerate() {
            match self.command(store, job).spawn() {
                Ok(child) => {
                    debug!(
                        "Worker {} (pid {}) evaluating ids {:?}",
                        job.partition,
                        child.id(),
                        job.range
                    );
                    running.push((i, child));
                }
                Err(e) => {
                    outcomes[i] = Some(WorkerOutcome::SpawnFailed(e.to_string()));
                }
            }
        }

        let deadline = self
            .evaluator
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        while !running.is_empty() {
            if self.cancelled.load(Ordering::Relaxed) {
                for (_, child) in &mut running {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                warn!("Generation {generation} cancelled with {} workers in flight", running.len());
                return Err(EvolutionError::Cancelled);
            }

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            running.retain_mut(|(i, child)| match child.try_wait() {
                Ok(Some(status)) => {
                    outcomes[*i] = Some(if status.success() {
                        WorkerOutcome::Succeeded
                    } else {
                        WorkerOutcome::Exited(status.code())
                    });
                    false
                }
                Ok(None) if expired => {
                    let _ = child.kill();
                    let _ = child.wait();
                    outcomes[*i] = Some(WorkerOutcome::TimedOut);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    outcomes[*i] = Some(WorkerOutcome::SpawnFailed(e.to_string()));
                    false
                }
            });

            if !running.is_empty() {
                thread::sleep(POLL_INTERVAL);
            }
        }

        let jobs: Vec<(WorkerJob, WorkerOutcome)> = jobs
            .into_iter()
            .zip(outcomes)
            .map(|(job, outcome)| {
                let outcome = outcome.unwrap_or(WorkerOutcome::SpawnFailed("never ran".into()));
                if !outcome.is_success() {
                    warn!(
                        "Worker {} (ids {:?}) of generation {generation} failed: {outcome:?}",
                        job.partition, job.range
                    );
                }
                (job, outcome)
            })
            .collect();

        let fitness = merge_fitness(store, generation)?;
        let missing_partitions: Vec<usize> = jobs
            .iter()
            .map(|(job, _)| job.partition)
            .filter(|&p| !store.fitness_path(generation, p).is_file())
            .collect();
        if !missing_partitions.is_empty() {
            warn!(
                "Generation {generation}: no fitness file for partitions {missing_partitions:?}"
            );
        }

        Ok(DispatchReport {
            fitness,
            jobs,
            missing_partitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn table(entries: &[(&str, f64)]) -> FitnessTable {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_partition_remainder_to_last() {
        assert_eq!(partition(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(partition(4, 4), vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(partition(5, 1), vec![0..5]);
        assert_eq!(partition(3, 8), vec![0..1, 1..2, 2..3]);
        assert!(partition(0, 2).is_empty());
    }

    #[test]
    fn test_job_args() {
        let job = WorkerJob {
            trial: 2,
            generation: 5,
            range: 4..8,
            partition: 1,
        };
        assert_eq!(job.args(), ["2", "5", "4", "8", "1"].map(String::from));
    }

    #[test]
    fn test_merge_order_independent() {
        let a = table(&[("0", 1.0), ("1", 2.0)]);
        let b = table(&[("2", 3.0)]);
        let c = table(&[("3", -1.0), ("4", 0.5)]);

        let forward = merge_tables([a.clone(), b.clone(), c.clone()]);
        let backward = merge_tables([c.clone(), b.clone(), a.clone()]);
        let nested = merge_tables([merge_tables([b, c]), a]);

        assert_eq!(forward.len(), 5);
        assert_eq!(forward, backward);
        assert_eq!(forward, nested);
    }

    #[test]
    fn test_merge_fitness_skips_absent_partition() {
        let dir = tempdir().unwrap();
        let store = TrialStore::new(dir.path(), 0);
        fs::create_dir_all(store.generation_dir(1)).unwrap();

        fs::write(store.fitness_path(1, 0), r#"{"0": 1.0, "1": 2.0}"#).unwrap();
        // Partition 1 (ids 2, 3) never reported.
        fs::write(store.fitness_path(1, 2), r#"{"4": 5.0, "5": 6.0}"#).unwrap();
        fs::write(store.fitness_path(1, 3), "not json").unwrap();
        // Listed like a partition file but cannot be read.
        fs::create_dir_all(store.fitness_path(1, 4)).unwrap();

        let merged = merge_fitness(&store, 1).unwrap();
        assert_eq!(
            merged,
            table(&[("0", 1.0), ("1", 2.0), ("4", 5.0), ("5", 6.0)])
        );
        assert!(merge_fitness(&store, 7).unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_with_missing_program() {
        let dir = tempdir().unwrap();
        let store = TrialStore::new(dir.path(), 0);
        let config = EvolverConfig {
            population_size: 4,
            workers: 2,
            evaluator: EvaluatorConfig {
                program: dir.path().join("no-such-evaluator"),
                ..Default::default()
            },
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(&config);

        let report = dispatcher.dispatch(&store, 0, 4).unwrap();
        assert!(report.fitness.is_empty());
        assert_eq!(report.missing_partitions, vec![0, 1]);
        assert!(
            report
                .jobs
                .iter()
                .all(|(_, o)| matches!(o, WorkerOutcome::SpawnFailed(_)))
        );
    }

    /// Dispatcher whose workers run `sleep 30` (plus the job arguments).
    #[cfg(unix)]
    fn sleeping_dispatcher(timeout_secs: Option<u64>) -> Dispatcher {
        let config = EvolverConfig {
            population_size: 2,
            workers: 2,
            evaluator: EvaluatorConfig {
                program: "sleep".into(),
                args: vec!["30".to_string()],
                timeout_secs,
            },
            ..Default::default()
        };
        Dispatcher::new(&config)
    }

    #[cfg(unix)]
    #[test]
    fn test_dispatch_kills_workers_past_timeout() {
        let dir = tempdir().unwrap();
        let store = TrialStore::new(dir.path(), 0);
        let dispatcher = sleeping_dispatcher(Some(1));

        let start = Instant::now();
        let report = dispatcher.dispatch(&store, 0, 2).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));

        assert!(!report.is_complete());
        assert_eq!(report.missing_partitions, vec![0, 1]);
        assert!(report.fitness.is_empty());
        assert!(
            report
                .jobs
                .iter()
                .all(|(_, o)| *o == WorkerOutcome::TimedOut)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dispatch_cancelled_while_workers_run() {
        let dir = tempdir().unwrap();
        let store = TrialStore::new(dir.path(), 0);
        let dispatcher = sleeping_dispatcher(None);

        let cancel = dispatcher.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.store(true, Ordering::Relaxed);
        });

        let start = Instant::now();
        let result = dispatcher.dispatch(&store, 0, 2);
        canceller.join().unwrap();

        assert!(matches!(result, Err(EvolutionError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    proptest! {
        #[test]
        fn prop_partition_exact_cover(population in 1usize..500, workers in 1usize..64) {
            let workers = workers.min(population);
            let ranges = partition(population, workers);

            prop_assert_eq!(ranges.len(), workers);
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges[ranges.len() - 1].end, population);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            let base = population / workers;
            for r in &ranges[..ranges.len() - 1] {
                prop_assert_eq!(r.len(), base);
            }
            prop_assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), population);
        }
    }
}
