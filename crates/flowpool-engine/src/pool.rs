//! Worker pool: one supervised slot per replica.
//!
//! Each slot launches a worker and bridges it to the resource's queues: a
//! worker pull is answered with the next inbound message, and every result
//! the worker sends goes to the outbound queue. A worker that exits without
//! having been sent STOP is relaunched with exponential backoff unless the
//! pool is shutting down.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowpool_core::Status;

use crate::launcher::{WorkerLauncher, WorkerLink};
use crate::protocol::{HostFrame, WorkerFrame};
use crate::queue::ResultMessage;
use crate::resource::{QueuePair, ResourceSettings};

/// Exponential backoff between relaunches of a crashed worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespawnPolicy {
    /// Delay before the first relaunch.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Maximum consecutive relaunches (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RespawnPolicy {
    /// Delay for a given attempt number (0-indexed); doubles each attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Time of the last PROCESS dispatch, shared by a resource's slots and its
/// inactivity watcher.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    base: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn touch(&self) {
        self.last_millis.store(self.now_millis(), Ordering::Relaxed);
    }

    /// Time since the last [`touch`](Self::touch).
    pub fn idle(&self) -> Duration {
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }
}

/// How a slot's worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOutcome {
    /// The worker was sent STOP.
    Stopped,
    /// The worker went away on its own.
    Crashed { served: bool },
}

/// Running worker slots of one resource.
pub struct WorkerPool {
    slots: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Launch `settings.replicas` supervised workers bridged to `queues`.
    pub fn spawn(
        settings: &Arc<ResourceSettings>,
        launcher: &Arc<dyn WorkerLauncher>,
        queues: &QueuePair,
        clock: &ActivityClock,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let slots = (0..settings.replicas)
            .map(|index| {
                let slot = Slot {
                    index,
                    settings: Arc::clone(settings),
                    launcher: Arc::clone(launcher),
                    queues: queues.clone(),
                    clock: clock.clone(),
                    shutdown: shutdown.subscribe(),
                };
                tokio::spawn(slot.supervise())
            })
            .collect();
        info!(resource = %settings.name, replicas = settings.replicas, "Worker pool started");
        Self { slots, shutdown }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Stop relaunching workers that exit on their own.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every slot to finish. Returns how many slots were joined.
    pub async fn join(mut self) -> usize {
        self.begin_shutdown();
        let mut joined = 0;
        for slot in std::mem::take(&mut self.slots) {
            match slot.await {
                Ok(()) => joined += 1,
                Err(e) => warn!(error = %e, "Worker slot task failed"),
            }
        }
        joined
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping a slot's link closes its worker's input; the worker exits.
        for slot in &self.slots {
            slot.abort();
        }
    }
}

struct Slot {
    index: usize,
    settings: Arc<ResourceSettings>,
    launcher: Arc<dyn WorkerLauncher>,
    queues: QueuePair,
    clock: ActivityClock,
    shutdown: watch::Receiver<bool>,
}

impl Slot {
    async fn supervise(mut self) {
        let name = self.settings.name.clone();
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.launcher.launch(self.settings.worker_context(self.index)) {
                Ok(link) => self.bridge(link).await,
                Err(e) => {
                    error!(resource = %name, worker = self.index, error = %e, "Failed to launch worker");
                    SlotOutcome::Crashed { served: false }
                }
            };

            let SlotOutcome::Crashed { served } = outcome else {
                debug!(resource = %name, worker = self.index, "Worker slot finished");
                return;
            };
            if *self.shutdown.borrow() {
                debug!(resource = %name, worker = self.index, "Not relaunching during shutdown");
                return;
            }
            if served {
                attempt = 0;
            }
            if !self.settings.respawn.should_retry(attempt) {
                error!(resource = %name, worker = self.index, attempt, "Giving up on worker slot");
                return;
            }
            let delay = self.settings.respawn.delay_for_attempt(attempt);
            attempt += 1;
            warn!(
                resource = %name,
                worker = self.index,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Worker exited without STOP, relaunching"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {
                    return;
                }
            }
        }
    }

    async fn bridge(&self, link: WorkerLink) -> SlotOutcome {
        let WorkerLink {
            mut frames,
            commands,
            exited,
        } = link;
        let mut commands: Option<mpsc::Sender<HostFrame>> = Some(commands);
        let mut pull_pending = false;
        let mut stop_sent = false;
        let mut served = false;
        // Tasks handed to the worker and not yet answered.
        let mut in_flight: HashSet<Uuid> = HashSet::new();

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(WorkerFrame::Pull) => pull_pending = true,
                    Some(WorkerFrame::Result { message }) => {
                        debug!(
                            resource = %self.settings.name,
                            worker = self.index,
                            uuid = %message.uuid,
                            "Result from worker"
                        );
                        served = true;
                        in_flight.remove(&message.uuid);
                        self.queues.outbound.put(message).await;
                    }
                    None => break,
                },
                message = self.queues.inbound.get(), if pull_pending && commands.is_some() => {
                    pull_pending = false;
                    let is_stop = message.is_stop();
                    let uuid = message.uuid;
                    if !is_stop {
                        self.clock.touch();
                    }
                    let Some(tx) = commands.as_ref() else { continue };
                    match tx.send(HostFrame::Task { message }).await {
                        Ok(()) if is_stop => {
                            stop_sent = true;
                            // Closing the worker's input lets it finish reading.
                            commands = None;
                        }
                        Ok(()) => {
                            in_flight.insert(uuid);
                        }
                        Err(mpsc::error::SendError(frame)) => {
                            if let HostFrame::Task { message } = frame {
                                warn!(
                                    resource = %self.settings.name,
                                    worker = self.index,
                                    uuid = %message.uuid,
                                    "Worker gone before taking its task, requeueing"
                                );
                                self.queues.inbound.requeue_front(message);
                            }
                            break;
                        }
                    }
                }
            }
        }

        drop(commands);
        match exited.await {
            Ok(exit) => debug!(resource = %self.settings.name, worker = self.index, ?exit, "Worker exited"),
            Err(_) => debug!(resource = %self.settings.name, worker = self.index, "Worker exit unknown"),
        }
        for uuid in in_flight {
            warn!(
                resource = %self.settings.name,
                worker = self.index,
                %uuid,
                "Worker exited before answering its task"
            );
            self.queues
                .outbound
                .put(ResultMessage::failed(
                    uuid,
                    Status::internal_error("worker exited mid-task"),
                ))
                .await;
        }
        if stop_sent {
            SlotOutcome::Stopped
        } else {
            SlotOutcome::Crashed { served }
        }
    }
}
