//! Background scheduler that keeps pending units moving.
//!
//! Two loops run while the scheduler is started:
//! - Dispatch: polls for pending units and hands each to a worker task,
//!   bounded by a semaphore of `max_concurrent_tasks` permits
//! - Sweep: recovers units left in `Executing` by a crashed or hung worker

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::ledger::LedgerStore;
use crate::orchestrator::OrderOrchestrator;
use crate::order::Unit;

use super::config::SchedulerConfig;
use super::service::UnitExecutionService;
use super::types::{ExecutionError, SchedulerStatsSnapshot, SchedulerStatus};

/// Upper bound on stuck units recovered per sweep.
const SWEEP_BATCH: usize = 100;

/// Running counters for the scheduler.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    polled: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    reclaimed: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            tasks_polled: self.polled.load(Ordering::Relaxed),
            tasks_executed: self.executed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.polled.store(0, Ordering::Relaxed);
        self.executed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.reclaimed.store(0, Ordering::Relaxed);
    }
}

/// Shared state handed to the loops and worker tasks.
#[derive(Clone)]
struct Dispatcher {
    config: SchedulerConfig,
    store: Arc<dyn LedgerStore>,
    service: Arc<UnitExecutionService>,
    orchestrator: Arc<OrderOrchestrator>,
    stats: Arc<SchedulerStats>,
    permits: Arc<Semaphore>,
    in_flight: Arc<RwLock<HashSet<String>>>,
}

impl Dispatcher {
    async fn poll_once(&self) -> Result<usize, ExecutionError> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let pending = self
            .store
            .fetch_pending_units(self.config.max_concurrent_tasks)?;

        let mut batch: Vec<Unit> = Vec::with_capacity(available);
        {
            let mut in_flight = self.in_flight.write().await;
            for unit in pending {
                if batch.len() == available {
                    break;
                }
                if in_flight.insert(unit.id.clone()) {
                    batch.push(unit);
                }
            }
        }

        let dispatched = batch.len();
        for unit in batch {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed; nothing else will run.
                    self.in_flight.write().await.remove(&unit.id);
                    continue;
                }
            };
            self.stats.polled.fetch_add(1, Ordering::Relaxed);

            let worker = self.clone();
            tokio::spawn(async move {
                let unit_id = unit.id.clone();
                worker.run_unit(unit).await;
                worker.in_flight.write().await.remove(&unit_id);
                drop(permit);
            });
        }

        if dispatched > 0 {
            debug!(count = dispatched, "Dispatched pending units");
        }
        Ok(dispatched)
    }

    async fn run_unit(&self, unit: Unit) {
        let unit_id = unit.id.clone();
        match self.service.execute(unit).await {
            Ok(unit) => {
                self.stats.executed.fetch_add(1, Ordering::Relaxed);
                if unit.status.is_terminal() {
                    self.record_outcome(&unit.id);
                }
            }
            Err(ExecutionError::InvalidState(msg)) => {
                // Lost the claim race or the order closed in the meantime.
                debug!(unit_id = %unit_id, "Skipped unit: {}", msg);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(unit_id = %unit_id, error = %e, "Unit execution failed");
            }
        }
    }

    fn record_outcome(&self, unit_id: &str) {
        if let Err(e) = self.orchestrator.record_unit_outcome(unit_id) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(unit_id = %unit_id, error = %e, "Failed to record unit outcome");
        }
    }

    async fn sweep_stuck_units(&self) -> Result<usize, ExecutionError> {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.config.stuck_unit_grace_ms as i64);
        let stuck = self.store.find_stuck_units(cutoff, SWEEP_BATCH)?;
        if stuck.is_empty() {
            return Ok(0);
        }

        let in_flight = self.in_flight.read().await.clone();
        let mut reclaimed = 0;
        for unit in stuck {
            if in_flight.contains(&unit.id) {
                continue;
            }
            match self.service.reclaim(unit) {
                Ok(unit) => {
                    reclaimed += 1;
                    self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                    if unit.status.is_terminal() {
                        self.record_outcome(&unit.id);
                    }
                }
                Err(ExecutionError::InvalidState(msg)) => {
                    debug!("Stuck unit moved on before reclaim: {}", msg);
                }
                Err(e) => warn!(error = %e, "Failed to reclaim stuck unit"),
            }
        }

        if reclaimed > 0 {
            info!(count = reclaimed, "Reclaimed stuck units");
        }
        Ok(reclaimed)
    }
}

/// Drives pending units through the execution service in the background.
pub struct ExecutionScheduler {
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ExecutionScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn LedgerStore>,
        service: Arc<UnitExecutionService>,
        orchestrator: Arc<OrderOrchestrator>,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        Self {
            dispatcher: Dispatcher {
                config,
                store,
                service,
                orchestrator,
                stats,
                permits,
                in_flight: Arc::new(RwLock::new(HashSet::new())),
            },
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start the dispatch and sweep loops.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!(
            executor = %self.dispatcher.service.executor_name(),
            max_concurrent_tasks = self.dispatcher.config.max_concurrent_tasks,
            "Starting execution scheduler"
        );

        // Units left executing by a previous process.
        if let Err(e) = self.dispatcher.sweep_stuck_units().await {
            error!("Initial stuck-unit sweep failed: {}", e);
        }

        self.spawn_dispatch_loop();
        self.spawn_sweep_loop();
    }

    /// Stop both loops and wait for in-flight units to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping execution scheduler");
        let _ = self.shutdown_tx.send(());

        let drain = Duration::from_millis(self.dispatcher.config.unit_execution_timeout_ms + 1000);
        if tokio::time::timeout(drain, self.wait_idle()).await.is_err() {
            warn!("Timed out waiting for in-flight units");
        }

        info!("Execution scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run one dispatch pass. Returns the number of units handed to workers.
    pub async fn poll_once(&self) -> Result<usize, ExecutionError> {
        self.dispatcher.poll_once().await
    }

    /// Run one stuck-unit sweep. Returns the number of units reclaimed.
    pub async fn sweep_stuck_units(&self) -> Result<usize, ExecutionError> {
        self.dispatcher.sweep_stuck_units().await
    }

    /// Wait until no worker holds a permit.
    pub async fn wait_idle(&self) {
        let max = self.dispatcher.config.max_concurrent_tasks as u32;
        if let Ok(all) = self.dispatcher.permits.acquire_many(max).await {
            drop(all);
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            executor: self.dispatcher.service.executor_name().to_string(),
            max_concurrent_tasks: self.dispatcher.config.max_concurrent_tasks,
            in_flight: self.dispatcher.in_flight.read().await.len(),
            stats: self.dispatcher.stats.snapshot(),
        }
    }

    fn spawn_dispatch_loop(&self) {
        let running = Arc::clone(&self.running);
        let dispatcher = self.dispatcher.clone();
        let interval = Duration::from_millis(dispatcher.config.poll_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Dispatch loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Dispatch loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = dispatcher.poll_once().await {
                            warn!("Dispatch error: {}", e);
                        }
                    }
                }
            }
            info!("Dispatch loop stopped");
        });
    }

    fn spawn_sweep_loop(&self) {
        let running = Arc::clone(&self.running);
        let dispatcher = self.dispatcher.clone();
        let interval = Duration::from_millis(dispatcher.config.sweep_interval_ms);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = dispatcher.sweep_stuck_units().await {
                            warn!("Stuck-unit sweep error: {}", e);
                        }
                    }
                }
            }
            debug!("Sweep loop stopped");
        });
    }
}
