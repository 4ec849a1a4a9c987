//! Slot-bound worker threads over a shared task queue.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Mutex},
    thread,
};

use tracing::{dispatcher, warn};

use crate::logger::current_dispatch;

/// A fixed set of resources, each one owned by exactly one worker thread while tasks run.
///
/// Tasks are handed to slots, never to resources directly, so two tasks never use the same
/// resource at the same time.
#[derive(Debug)]
pub struct ResourcePool<R> {
    slots: Vec<R>,
}

impl<R: Send> ResourcePool<R> {
    /// Pool over `slots`.
    pub fn new(slots: Vec<R>) -> Self {
        Self { slots }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Give the resources back.
    pub fn into_slots(self) -> Vec<R> {
        self.slots
    }

    /// Run `work` on every task, one worker thread per slot, and return the results in task
    /// order. Errors and panics fail only their task.
    pub fn run<T, O, F>(&mut self, tasks: Vec<T>, work: F) -> Vec<Result<O, String>>
    where
        T: Send,
        O: Send,
        F: Fn(&mut R, T) -> anyhow::Result<O> + Sync,
    {
        let count = tasks.len();
        if count == 0 {
            return Vec::new();
        }
        if self.slots.is_empty() {
            return (0..count).map(|_| Err("resource pool has no slot".to_string())).collect();
        }
        let queue = Mutex::new(tasks.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();
        let dispatch = current_dispatch();

        let mut results = thread::scope(|s| {
            for slot in self.slots.iter_mut() {
                let tx = tx.clone();
                let (queue, work, dispatch) = (&queue, &work, &dispatch);
                s.spawn(move || {
                    dispatcher::with_default(dispatch, || loop {
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some((index, task)) = next else { break };
                        let result = match catch_unwind(AssertUnwindSafe(|| work(slot, task))) {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(e)) => {
                                warn!("Task {index} failed: {e:#}");
                                Err(format!("{e:#}"))
                            }
                            Err(_) => {
                                warn!("Task {index} panicked");
                                Err("task panicked".to_string())
                            }
                        };
                        if tx.send((index, result)).is_err() {
                            break;
                        }
                    })
                });
            }
            drop(tx);
            rx.into_iter().collect::<Vec<_>>()
        });

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}
