//! Self-Healing Controller
//!
//! Periodic control loop that samples host pressure and flips the
//! mitigation flags the engine and fan-out layer consult. Each signal
//! latches on trip and unlatches on recovery (hysteresis), so readings
//! inside the band change nothing. Also owns the deferred-operation
//! queue served while the deferral flag is off.

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::control::flags::{
    ControlFlags, UpdateFrequency, DEFAULT_SNAPSHOT_INTERVAL_MS, REDUCED_RETENTION_MS,
    REDUCED_SNAPSHOT_INTERVAL_MS,
};
use crate::control::sampler::{HostSampler, HostSample};
use crate::game::engine::RaceEngine;

/// Log a status snapshot every this many samples.
const SNAPSHOT_LOG_EVERY: u64 = 6;

/// Controller thresholds and cadences.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Host sampling interval.
    pub sample_interval: Duration,
    /// Memory trip threshold (used/total).
    pub mem_trip: f64,
    /// Memory recovery threshold.
    pub mem_recover: f64,
    /// CPU trip threshold (load per core).
    pub load_trip: f64,
    /// CPU recovery threshold.
    pub load_recover: f64,
    /// Active-session trip threshold.
    pub game_count_trip: usize,
    /// Active-session recovery threshold.
    pub game_count_recover: usize,
    /// Gap between served deferred operations.
    pub deferred_gap: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            mem_trip: 0.90,
            mem_recover: 0.70,
            load_trip: 0.80,
            load_recover: 0.60,
            game_count_trip: 100,
            game_count_recover: 80,
            deferred_gap: Duration::from_millis(100),
        }
    }
}

/// Latch states, exposed on the monitoring surface.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerAlerts {
    /// Memory latch.
    pub memory_alert: bool,
    /// CPU latch.
    pub load_alert: bool,
    /// Session-count latch.
    pub game_count_alert: bool,
}

type DeferredTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct DeferredOp {
    priority: u8,
    seq: u64,
    name: String,
    task: DeferredTask,
}

impl PartialEq for DeferredOp {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for DeferredOp {}

impl PartialOrd for DeferredOp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferredOp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO (lower seq wins).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The self-healing controller. Shared behind an `Arc`; the sampling
/// loop and deferred-operation worker are spawned from it.
pub struct SelfHealingController {
    cfg: ControllerConfig,
    flags: Arc<ControlFlags>,
    engine: RaceEngine,
    mem_alert: AtomicBool,
    load_alert: AtomicBool,
    game_count_alert: AtomicBool,
    deferred: Mutex<BinaryHeap<DeferredOp>>,
    deferred_seq: AtomicU64,
    samples_taken: AtomicU64,
}

impl SelfHealingController {
    /// Build a controller over the shared flags and engine.
    pub fn new(cfg: ControllerConfig, flags: Arc<ControlFlags>, engine: RaceEngine) -> Self {
        Self {
            cfg,
            flags,
            engine,
            mem_alert: AtomicBool::new(false),
            load_alert: AtomicBool::new(false),
            game_count_alert: AtomicBool::new(false),
            deferred: Mutex::new(BinaryHeap::new()),
            deferred_seq: AtomicU64::new(0),
            samples_taken: AtomicU64::new(0),
        }
    }

    /// Spawn the sampling loop.
    pub fn spawn(self: Arc<Self>, mut sampler: Box<dyn HostSampler>) -> JoinHandle<()> {
        let mut ticker = interval(self.cfg.sample_interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let sample = sampler.sample();
                self.evaluate(sample).await;
            }
        })
    }

    /// Spawn the deferred-operation worker.
    pub fn spawn_deferred_worker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.cfg.deferred_gap).await;
                self.serve_deferred_once().await;
            }
        })
    }

    /// Current latch states.
    pub fn alerts(&self) -> ControllerAlerts {
        ControllerAlerts {
            memory_alert: self.mem_alert.load(Ordering::Relaxed),
            load_alert: self.load_alert.load(Ordering::Relaxed),
            game_count_alert: self.game_count_alert.load(Ordering::Relaxed),
        }
    }

    /// Evaluate one host sample against the thresholds, activating or
    /// recovering mitigations as latches flip.
    pub async fn evaluate(&self, sample: HostSample) {
        let active = self.engine.active_session_count().await;

        let n = self.samples_taken.fetch_add(1, Ordering::Relaxed);
        if n % SNAPSHOT_LOG_EVERY == 0 {
            info!(
                "Health snapshot: mem {:.1}%, load/cpu {:.2}, {} active games",
                sample.mem_pct * 100.0,
                sample.load_per_cpu,
                active
            );
        }

        self.evaluate_memory(sample.mem_pct).await;
        self.evaluate_load(sample.load_per_cpu);
        self.evaluate_game_count(active);
    }

    async fn evaluate_memory(&self, mem_pct: f64) {
        if mem_pct > self.cfg.mem_trip {
            if !self.mem_alert.swap(true, Ordering::Relaxed) {
                warn!("Memory alert tripped at {:.1}%", mem_pct * 100.0);
                self.flags.set_accepting_new_players(false);
                let dropped = self.engine.clear_caches().await;
                info!("Cleared caches under memory pressure ({} snapshots dropped)", dropped);
            } else {
                // Still over threshold after cache clearing.
                let terminated = self.engine.terminate_idle_games().await;
                if terminated > 0 {
                    warn!("Memory still high; terminated {} idle games", terminated);
                }
            }
        } else if mem_pct < self.cfg.mem_recover
            && self.mem_alert.swap(false, Ordering::Relaxed)
        {
            info!("Memory alert recovered at {:.1}%", mem_pct * 100.0);
            self.flags.set_accepting_new_players(true);
        }
    }

    fn evaluate_load(&self, load_per_cpu: f64) {
        if load_per_cpu > self.cfg.load_trip {
            if !self.load_alert.swap(true, Ordering::Relaxed) {
                warn!("CPU alert tripped at load/cpu {:.2}", load_per_cpu);
                self.flags.set_update_frequency(UpdateFrequency::Low);
                self.flags.set_throttling_enabled(true);
                self.flags.set_defer_resource_intensive_ops(true);
                self.flags
                    .set_replay_snapshot_interval_ms(REDUCED_SNAPSHOT_INTERVAL_MS);
            }
        } else if load_per_cpu < self.cfg.load_recover
            && self.load_alert.swap(false, Ordering::Relaxed)
        {
            info!("CPU alert recovered at load/cpu {:.2}", load_per_cpu);
            self.flags.set_update_frequency(UpdateFrequency::Normal);
            self.flags.set_throttling_enabled(false);
            self.flags.set_defer_resource_intensive_ops(false);
            self.flags
                .set_replay_snapshot_interval_ms(DEFAULT_SNAPSHOT_INTERVAL_MS);
        }
    }

    fn evaluate_game_count(&self, active: usize) {
        if active > self.cfg.game_count_trip {
            if !self.game_count_alert.swap(true, Ordering::Relaxed) {
                warn!("Game-count alert tripped at {} active games", active);
                self.flags.set_game_creation_queue_enabled(true);
                self.flags.set_max_players_reduction(1);
                self.flags.set_replay_retention_ms(REDUCED_RETENTION_MS);
                self.flags.set_creation_backoff_enabled(true);
            }
        } else if active < self.cfg.game_count_recover
            && self.game_count_alert.swap(false, Ordering::Relaxed)
        {
            info!("Game-count alert recovered at {} active games", active);
            self.flags.set_game_creation_queue_enabled(false);
            self.flags.set_max_players_reduction(0);
            self.flags
                .set_replay_retention_ms(crate::control::flags::DEFAULT_RETENTION_MS);
            self.flags.set_creation_backoff_enabled(false);
        }
    }

    /// Queue a resource-intensive operation. Priority 1-10 (clamped);
    /// higher priorities are served first, ties in submission order.
    pub async fn queue_resource_intensive_op<F>(&self, name: &str, priority: u8, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let op = DeferredOp {
            priority: priority.clamp(1, 10),
            seq: self.deferred_seq.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            task: Box::pin(task),
        };
        self.deferred.lock().await.push(op);
    }

    /// Serve one deferred operation if deferral is off. A failing task
    /// is logged and never blocks the queue. Returns whether a task ran.
    pub async fn serve_deferred_once(&self) -> bool {
        if self.flags.defer_resource_intensive_ops() {
            return false;
        }
        let op = self.deferred.lock().await.pop();
        let Some(op) = op else { return false };
        debug!("Running deferred op '{}' (priority {})", op.name, op.priority);
        if let Err(e) = op.task.await {
            warn!("Deferred op '{}' failed: {}", op.name, e);
        }
        true
    }

    /// Pending deferred operations.
    pub async fn deferred_len(&self) -> usize {
        self.deferred.lock().await.len()
    }
}
