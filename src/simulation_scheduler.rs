//! Repetitions of one match spread over a bounded pool of worker threads.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, dispatcher, info, warn};

use crate::{constraints::Constraints, error::is_timeout, logger::current_dispatch};

/// What happened to one simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationOutcome<T> {
    /// The task returned a result.
    Completed(T),
    /// The task hit its deadline.
    TimedOut,
    /// The task returned an error or panicked.
    Failed(String),
}

/// One finished simulation attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRecord<T> {
    /// Index given to the task, unique within one run.
    pub index: usize,
    /// How it ended.
    pub outcome: SimulationOutcome<T>,
    /// Wall time spent.
    pub duration: Duration,
}

impl<T> SimulationRecord<T> {
    /// The result, when the simulation completed.
    pub fn completed(&self) -> Option<&T> {
        match &self.outcome {
            SimulationOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs independent repetitions of a match on a fixed number of worker threads.
///
/// Every repetition is attempted exactly once. Failures and timeouts are recorded, never
/// propagated, and results are returned sorted by index whatever the completion order was.
#[derive(Debug, Clone, Copy)]
pub struct SimulationScheduler {
    workers: usize,
    timeout: Duration,
}

impl SimulationScheduler {
    /// At most `workers` simulations at a time, each one given `timeout`.
    pub fn new(workers: usize, timeout: Duration) -> Self {
        Self {
            workers: workers.max(1),
            timeout,
        }
    }

    /// Worker count and simulation timeout taken from `constraints`.
    pub fn from_constraints(constraints: &Constraints) -> Self {
        Self::new(constraints.simulation_workers(), constraints.simulation_timeout())
    }

    /// Deadline tasks should apply to their sandbox command.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Worker thread count.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Call `task(i)` for every `i` in `0..count`.
    ///
    /// `task` must write its artifacts under names derived from `i` so that concurrent
    /// repetitions never collide.
    pub fn run<T, F>(&self, count: usize, task: F) -> Vec<SimulationRecord<T>>
    where
        T: Send,
        F: Fn(usize) -> anyhow::Result<T> + Sync,
    {
        if count == 0 {
            return Vec::new();
        }
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        let dispatch = current_dispatch();
        let start = Instant::now();

        let mut records = thread::scope(|s| {
            for _ in 0..self.workers.min(count) {
                let tx = tx.clone();
                let (next, task, dispatch) = (&next, &task, &dispatch);
                s.spawn(move || {
                    dispatcher::with_default(dispatch, || loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        if index >= count {
                            break;
                        }
                        let record = attempt(index, task);
                        if tx.send(record).is_err() {
                            break;
                        }
                    })
                });
            }
            drop(tx);

            let mut records = Vec::with_capacity(count);
            for record in rx {
                records.push(record);
                debug!("Completed {} of {count} simulations", records.len());
            }
            records
        });

        records.sort_by_key(|r| r.index);
        let completed = records.iter().filter(|r| r.completed().is_some()).count();
        info!(
            "{completed} of {count} simulations completed in {:.1?}",
            start.elapsed()
        );
        records
    }
}

fn attempt<T>(index: usize, task: &(impl Fn(usize) -> anyhow::Result<T> + Sync)) -> SimulationRecord<T> {
    let start = Instant::now();
    let outcome = match catch_unwind(AssertUnwindSafe(|| task(index))) {
        Ok(Ok(value)) => SimulationOutcome::Completed(value),
        Ok(Err(e)) if is_timeout(&e) => {
            warn!("Simulation {index} timed out");
            SimulationOutcome::TimedOut
        }
        Ok(Err(e)) => {
            warn!("Simulation {index} failed: {e:#}");
            SimulationOutcome::Failed(format!("{e:#}"))
        }
        Err(_) => {
            warn!("Simulation {index} panicked");
            SimulationOutcome::Failed("simulation panicked".to_string())
        }
    };
    SimulationRecord {
        index,
        outcome,
        duration: start.elapsed(),
    }
}
