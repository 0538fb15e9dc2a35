//! # Scheduler
//!
//! Drives every combination of a run through its sample channel, one sample
//! at a time.
//!
//! ## Lifecycle
//!
//! 1. **Start**: all channels are started concurrently. Loading a task is not
//!    measured. A stop request interrupts the wait for children still
//!    loading.
//! 2. **Sample loop**: each tick picks the combination with the least measured
//!    time among those with remaining budget, requests one sample and folds it
//!    into that combination's state. Ties go to a rank drawn once at start from
//!    a seedable shuffle, so a run with a fixed seed is reproducible.
//! 3. **End**: every live child is told to exit (concurrently), every channel
//!    is closed, and the remaining measures are aggregated.
//!
//! A stop request ends the loop at the next tick without interrupting the
//! sample in flight. So does the first failed combination, unless
//! `keep_going` is set: the others stop with the stats they already have. Aborts are not handled here: the caller drops the
//! scheduler future, and dropping the channels kills the children.

use crate::calibration::CalibrationSettings;
use crate::combination::{CombinationState, Limits, Phase};
use crate::error::CombinationError;
use crate::ipc::SampleChannel;
use crate::stop::StopToken;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the scheduler runs a set of combinations.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub limits: Limits,
    pub calibration: CalibrationSettings,
    /// Keep measuring the other combinations after a failure. By default
    /// the first failure drains every combination.
    pub keep_going: bool,
    /// Seed of the tie-breaking shuffle. Random when unset.
    pub seed: Option<u64>,
}

/// Final states, in the order the combinations were added.
#[derive(Debug)]
pub struct ScheduleOutcome {
    /// Whether the run ended because a stop was requested.
    pub stopped: bool,
    pub states: Vec<CombinationState>,
}

struct Slot {
    position: usize,
    rank: usize,
    state: CombinationState,
    channel: Option<Box<dyn SampleChannel>>,
    /// The child sent its first request and is waiting for an instruction.
    started: bool,
}

impl Slot {
    fn fail(mut self, error: CombinationError) -> Self {
        error!("{}", self.state.combination.failure(error.clone()));
        self.state = self.state.fail(error);
        self
    }

    fn stop(mut self) -> Self {
        self.state = self.state.stop();
        self
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    stop: StopToken,
    slots: Vec<Slot>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, stop: StopToken) -> Self {
        Self {
            config,
            stop,
            slots: Vec::new(),
        }
    }

    /// Add a combination measured through `channel`.
    pub fn add(&mut self, state: CombinationState, channel: Box<dyn SampleChannel>) {
        self.push(state, Some(channel));
    }

    /// Add a combination that already failed, such as one whose runner could
    /// not be spawned. It is reported but never sampled.
    pub fn add_failed(&mut self, state: CombinationState) {
        self.push(state, None);
    }

    fn push(&mut self, state: CombinationState, channel: Option<Box<dyn SampleChannel>>) {
        let position = self.slots.len();
        self.slots.push(Slot {
            position,
            rank: position,
            state,
            channel,
            started: false,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Measure every combination until its budget is spent or the run stops.
    pub async fn run(mut self) -> ScheduleOutcome {
        info!("Measuring {} combination(s)", self.slots.len());
        self.shuffle();
        self.start().await;
        self.sample_loop().await;
        self.end().await;

        let stopped = self.stop.is_stopped();
        let mut slots = self.slots;
        slots.sort_by_key(|slot| slot.position);
        ScheduleOutcome {
            stopped,
            states: slots
                .into_iter()
                .map(|slot| slot.state.finalize())
                .collect(),
        }
    }

    fn shuffle(&mut self) {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut ranks: Vec<usize> = (0..self.slots.len()).collect();
        ranks.shuffle(&mut rng);
        for (slot, rank) in self.slots.iter_mut().zip(ranks) {
            slot.rank = rank;
        }
    }

    /// Wait for every child to load its task. A stop request interrupts
    /// the wait: children still loading are then never sampled.
    async fn start(&mut self) {
        let stop = &self.stop;
        let results = join_all(self.slots.iter_mut().map(|slot| async move {
            match slot.channel.as_mut() {
                Some(channel) if slot.state.is_active() => tokio::select! {
                    result = channel.start() => result.map(|()| true),
                    () = stop.stopped() => Ok(false),
                },
                _ => Ok(false),
            }
        }))
        .await;

        self.slots = std::mem::take(&mut self.slots)
            .into_iter()
            .zip(results)
            .map(|(mut slot, result)| match result {
                Ok(started) => {
                    slot.started = started;
                    slot
                }
                Err(error) => slot.fail(error),
            })
            .collect();
    }

    async fn sample_loop(&mut self) {
        loop {
            if self.stop.is_stopped() {
                info!("Stop requested, finishing up");
                self.stop_all();
                return;
            }
            if !self.config.keep_going && self.has_failure() {
                warn!("Stopping all combinations after the first error");
                self.stop_all();
                return;
            }
            let Some(index) = self.pick() else {
                return;
            };

            let slot = self.slots.swap_remove(index);
            let slot = sample(slot, &self.config).await;
            self.slots.push(slot);
        }
    }

    fn pick(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.has_remaining(&self.config.limits))
            .min_by_key(|(_, slot)| (slot.state.total_duration, slot.rank))
            .map(|(index, _)| index)
    }

    fn has_failure(&self) -> bool {
        self.slots.iter().any(|slot| slot.state.phase == Phase::Failed)
    }

    fn stop_all(&mut self) {
        self.slots = std::mem::take(&mut self.slots)
            .into_iter()
            .map(Slot::stop)
            .collect();
    }

    async fn end(&mut self) {
        let results = join_all(self.slots.iter_mut().map(|slot| async move {
            let live = slot.started && slot.state.is_live();
            match slot.channel.as_mut() {
                Some(channel) => {
                    let result = if live { Some(channel.end().await) } else { None };
                    channel.close().await;
                    result
                }
                None => None,
            }
        }))
        .await;

        self.slots = std::mem::take(&mut self.slots)
            .into_iter()
            .zip(results)
            .map(|(mut slot, result)| {
                if let Some(Err(error)) = result {
                    warn!(
                        "Could not tell task '{}' to exit: {}",
                        slot.state.combination.task_id, error
                    );
                }
                slot.state = slot.state.exit();
                slot
            })
            .collect();
    }
}

async fn sample(mut slot: Slot, config: &SchedulerConfig) -> Slot {
    let params = slot.state.next_params(&config.limits, &config.calibration);
    let timeout = slot.state.sample_timeout(&config.limits, &config.calibration);
    let task_id = slot.state.combination.task_id.clone();
    let Some(channel) = slot.channel.as_mut() else {
        return slot.fail(CombinationError::protocol("no runner process"));
    };

    let started = Instant::now();
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, channel.sample(params))
            .await
            .unwrap_or(Err(CombinationError::Timeout { task_id })),
        None => channel.sample(params).await,
    };
    let elapsed = started.elapsed();

    match result {
        Ok(batch) => {
            debug!(
                "Task '{}': sample {} with {} loop(s) of repeat {} in {:?}",
                slot.state.combination.task_id,
                slot.state.samples + 1,
                batch.main_measures.len(),
                params.repeat,
                elapsed
            );
            slot.state = slot
                .state
                .record_sample(&params, batch, elapsed, &config.calibration);
            slot
        }
        Err(error) => slot.fail(error),
    }
}
