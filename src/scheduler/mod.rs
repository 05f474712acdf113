//! Scheduler - drives one job through split, replicate, execute and merge.
//!
//! Each iteration draws up to `threads` splits, hands every thread its own
//! replica of each per-thread mergeable argument, runs the operation on the
//! pool, and merges the replicas back before drawing again. With several
//! ranks, splits are dealt round-robin: rank `r` skips `r` splits up front and
//! `num_workers - 1` after every split it takes.

pub mod args;
pub mod registry;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{error, info, warn};

use crate::MergeContext;
use crate::config::Config;
use crate::distributed::{Distributor, Exchange, RunReport, WorkRequest};
use crate::error::{Error, Result};
use crate::memory::MemoryStats;

pub use args::{AnyMergeable, AnySplittable, Arg, Split, ThreadArgs};
pub use registry::{JobBinding, JobRegistry};

use args::Slot;

type Replicas = Vec<Option<Box<dyn AnyMergeable>>>;

/// Counters of one finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub iterations: usize,
    pub splits: usize,
    pub failures: usize,
    pub elapsed_ms: u128,
}

pub struct Scheduler {
    config: Arc<Config>,
    registry: Arc<JobRegistry>,
    pool: ThreadPool,
    rank: usize,
    num_workers: usize,
    exchange: Option<Arc<dyn Exchange>>,
    distributor: Option<Arc<Distributor>>,
}

impl Scheduler {
    /// Single-process scheduler with `config.threads` threads
    pub fn new(config: Arc<Config>, registry: Arc<JobRegistry>) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|i| format!("srm-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            config,
            registry,
            pool,
            rank: 0,
            num_workers: 1,
            exchange: None,
            distributor: None,
        })
    }

    /// Master scheduler; connects to the configured workers, if any
    pub fn connect(config: Arc<Config>, registry: Arc<JobRegistry>) -> Result<Self> {
        let scheduler = Self::new(Arc::clone(&config), registry)?;
        if config.workers.is_empty() {
            return Ok(scheduler);
        }
        let distributor = Distributor::connect(&config)?;
        Ok(scheduler.with_distributor(distributor))
    }

    pub fn with_distributor(mut self, distributor: Distributor) -> Self {
        let distributor = Arc::new(distributor);
        self.rank = 0;
        self.num_workers = distributor.num_workers();
        self.exchange = Some(distributor.clone());
        self.distributor = Some(distributor);
        self
    }

    /// Take rank and worker count from `exchange` and merge through it
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.rank = exchange.rank();
        self.num_workers = exchange.num_workers();
        self.exchange = Some(exchange);
        self
    }

    /// Scheduler of a worker process, linked to rank 0 through `exchange`
    pub fn for_worker(config: Arc<Config>, registry: Arc<JobRegistry>, exchange: Arc<dyn Exchange>) -> Result<Self> {
        Ok(Self::new(config, registry)?.with_exchange(exchange))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn merge_context(&self) -> MergeContext<'_> {
        MergeContext {
            pool: &self.pool,
            rank: self.rank,
            num_workers: self.num_workers,
            exchange: self.exchange.as_deref(),
        }
    }

    /// Run `operation` here and, when connected, on every worker.
    ///
    /// Workers receive the arguments' wire forms, so every argument needs one
    /// in a distributed run.
    pub fn run(&self, operation: &str, args: &mut [Arg]) -> Result<RunStats> {
        self.registry.resolve(operation, args.len())?;

        let Some(distributor) = &self.distributor else {
            return self.execute(operation, args);
        };

        let wire = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.wire().cloned().ok_or_else(|| {
                    Error::InvalidArgument(format!("argument {} cannot be sent to workers", i))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        distributor.assign_work(&WorkRequest {
            operation: operation.to_string(),
            args: wire,
        })?;

        let outcome = self.execute(operation, args);

        for (i, report) in distributor.collect_reports()?.into_iter().enumerate() {
            match report {
                Some(RunReport { error: None, .. }) => {}
                Some(RunReport {
                    rank,
                    error: Some(message),
                }) => error!("rank {} failed: {}", rank, message),
                None => warn!("rank {} did not report back", i + 1),
            }
        }
        outcome
    }

    /// Run `operation` over this rank's share of the splits
    pub fn execute(&self, operation: &str, args: &mut [Arg]) -> Result<RunStats> {
        let binding = self.registry.resolve(operation, args.len())?;
        for (i, arg) in args.iter().enumerate().skip(1) {
            if !binding.is_shared(i) && !arg.is_mergeable() {
                return Err(Error::ArgumentType {
                    index: i,
                    expected: "mergeable",
                });
            }
        }

        let (input, rest) = args.split_at_mut(1);
        let input = input[0].as_splittable().ok_or(Error::ArgumentType {
            index: 0,
            expected: "splittable input",
        })?;

        let start = Instant::now();
        let threads = self.config.threads.max(1);
        let ctx = self.merge_context();
        let mut stats = RunStats::default();

        let mut splits = input.splits_any()?.fuse();
        for _ in 0..self.rank {
            splits.next();
        }

        loop {
            let iteration_start = Instant::now();
            let mut batch = Vec::with_capacity(threads);
            while batch.len() < threads {
                let Some(split) = splits.next() else {
                    break;
                };
                batch.push(split);
                for _ in 1..self.num_workers {
                    splits.next();
                }
            }
            if batch.is_empty() {
                break;
            }
            stats.iterations += 1;
            stats.splits += batch.len();
            let split_ms = iteration_start.elapsed().as_millis();

            let exec_start = Instant::now();
            let outcomes = self.invoke_all(binding, batch, rest);
            let exec_ms = exec_start.elapsed().as_millis();

            let merge_start = Instant::now();
            let mut replicas: Vec<Vec<Box<dyn AnyMergeable>>> = (0..=rest.len()).map(|_| Vec::new()).collect();
            for (thread, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    Ok(slots) => {
                        for (i, slot) in slots.into_iter().enumerate() {
                            if let Some(replica) = slot {
                                replicas[i].push(replica);
                            }
                        }
                    }
                    Err(e) => {
                        stats.failures += 1;
                        error!(
                            "{} iteration {} thread {} failed: {}",
                            operation, stats.iterations, thread, e
                        );
                    }
                }
            }
            for (i, partials) in replicas.into_iter().enumerate().skip(1) {
                if partials.is_empty() {
                    continue;
                }
                if let Some(target) = rest[i - 1].as_mergeable_mut() {
                    target.merge_any(Some(partials), &ctx)?;
                }
            }
            let merge_ms = merge_start.elapsed().as_millis();

            info!(
                "Iteration {}: splits={} split={}ms exec={}ms merge={}ms total={}ms",
                stats.iterations,
                stats.splits,
                split_ms,
                exec_ms,
                merge_ms,
                iteration_start.elapsed().as_millis()
            );
            info!("{}", MemoryStats::probe());
        }

        let final_start = Instant::now();
        for (i, arg) in rest.iter_mut().enumerate() {
            if binding.is_shared(i + 1) {
                continue;
            }
            if let Some(target) = arg.as_mergeable_mut() {
                target.merge_any(None, &ctx)?;
            }
        }

        stats.elapsed_ms = start.elapsed().as_millis();
        info!(
            "Finished {} on rank {}: iterations={} splits={} failures={} final merge={}ms total={}ms",
            operation,
            self.rank,
            stats.iterations,
            stats.splits,
            stats.failures,
            final_start.elapsed().as_millis(),
            stats.elapsed_ms
        );
        Ok(stats)
    }

    // One invocation per split on the pool; each result holds that thread's replicas
    fn invoke_all(&self, binding: &JobBinding, batch: Vec<Split>, rest: &[Arg]) -> Vec<Result<Replicas>> {
        let rank = self.rank;
        self.pool.install(|| {
            batch
                .into_par_iter()
                .map(|split| {
                    let mut slots = Vec::with_capacity(rest.len() + 1);
                    slots.push(Slot::Input);
                    for (i, arg) in rest.iter().enumerate() {
                        let slot = match arg.as_mergeable() {
                            Some(target) if !binding.is_shared(i + 1) => Slot::Owned(target.replicate_any()),
                            _ => Slot::Shared(arg.shared_ref()),
                        };
                        slots.push(slot);
                    }

                    let mut thread_args = ThreadArgs::new(slots);
                    match panic::catch_unwind(AssertUnwindSafe(|| binding.invoke(split, &mut thread_args))) {
                        Ok(Ok(())) => Ok(thread_args.into_replicas()),
                        Ok(Err(e)) => Err(e),
                        Err(payload) => Err(Error::Worker {
                            rank,
                            message: panic_message(payload.as_ref()),
                        }),
                    }
                })
                .collect()
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
