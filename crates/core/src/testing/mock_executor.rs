//! Mock unit executor for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::executor::{ExecutionReport, ExecutorError, UnitCommand, UnitExecutor};

/// Scripted behavior for a mock executor call.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Report success.
    Succeed,
    /// Report a business failure with this reason.
    Reject(String),
    /// Fail with a transport error for the first `times` calls per unit,
    /// then succeed.
    FailTransport { error: ExecutorError, times: u32 },
    /// Fail with a transport error on every call.
    FailAlways(ExecutorError),
    /// Never return (exercise timeouts).
    Hang,
}

/// A recorded executor call for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    /// The command that was sent.
    pub command: UnitCommand,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

/// Mock implementation of the UnitExecutor trait.
///
/// Provides controllable behavior for testing:
/// - Per-identity scripted outcomes with a default for everything else
/// - Recorded commands for assertions
/// - Artificial latency and peak concurrency tracking
///
/// # Example
///
/// ```rust,ignore
/// let executor = MockUnitExecutor::new();
/// executor.set_behavior("identity-3", MockBehavior::Reject("banned".into())).await;
/// executor.set_latency(Duration::from_millis(20)).await;
///
/// // ... run the scheduler ...
///
/// assert_eq!(executor.call_count().await, 10);
/// assert!(executor.max_in_flight() <= 4);
/// ```
#[derive(Debug)]
pub struct MockUnitExecutor {
    /// Behavior by executor identity.
    behaviors: Arc<RwLock<HashMap<String, MockBehavior>>>,
    /// Behavior for identities without an entry.
    default_behavior: Arc<RwLock<MockBehavior>>,
    /// Transport failures already served, by unit id.
    failures_served: Arc<RwLock<HashMap<String, u32>>>,
    /// Recorded execute calls.
    calls: Arc<RwLock<Vec<RecordedCommand>>>,
    latency: Arc<RwLock<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    node: String,
}

impl Default for MockUnitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUnitExecutor {
    /// Create a mock executor where every unit succeeds.
    pub fn new() -> Self {
        Self {
            behaviors: Arc::new(RwLock::new(HashMap::new())),
            default_behavior: Arc::new(RwLock::new(MockBehavior::Succeed)),
            failures_served: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            latency: Arc::new(RwLock::new(Duration::ZERO)),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            node: "mock-node".to_string(),
        }
    }

    /// Create a mock executor with a default behavior.
    pub fn with_default(behavior: MockBehavior) -> Self {
        Self {
            default_behavior: Arc::new(RwLock::new(behavior)),
            ..Self::new()
        }
    }

    pub async fn set_default(&self, behavior: MockBehavior) {
        *self.default_behavior.write().await = behavior;
    }

    /// Script the behavior for one executor identity.
    pub async fn set_behavior(&self, identity: impl Into<String>, behavior: MockBehavior) {
        self.behaviors.write().await.insert(identity.into(), behavior);
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Get all recorded calls.
    pub async fn calls(&self) -> Vec<RecordedCommand> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Recorded calls for one unit.
    pub async fn calls_for_unit(&self, unit_id: &str) -> Vec<RecordedCommand> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.command.unit_id == unit_id)
            .cloned()
            .collect()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Clear recorded calls and counters. Behaviors are kept.
    pub async fn clear_recorded(&self) {
        self.calls.write().await.clear();
        self.failures_served.write().await.clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    async fn behavior_for(&self, identity: &str) -> MockBehavior {
        match self.behaviors.read().await.get(identity) {
            Some(behavior) => behavior.clone(),
            None => self.default_behavior.read().await.clone(),
        }
    }

    async fn respond(
        &self,
        command: &UnitCommand,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.behavior_for(&command.executor_identity).await {
            MockBehavior::Succeed => Ok(ExecutionReport::succeeded(
                &self.node,
                command.retry_count,
                started_at,
            )),
            MockBehavior::Reject(reason) => Ok(ExecutionReport::rejected(
                &self.node,
                reason,
                command.retry_count,
                started_at,
            )),
            MockBehavior::FailTransport { error, times } => {
                let mut served = self.failures_served.write().await;
                let count = served.entry(command.unit_id.clone()).or_insert(0);
                if *count < times {
                    *count += 1;
                    Err(error)
                } else {
                    Ok(ExecutionReport::succeeded(
                        &self.node,
                        command.retry_count,
                        started_at,
                    ))
                }
            }
            MockBehavior::FailAlways(error) => Err(error),
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ExecutorError::Internal("mock hang elapsed".to_string()))
            }
        }
    }
}

/// Decrements the in-flight gauge even when the call future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitExecutor for MockUnitExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, command: UnitCommand) -> Result<ExecutionReport, ExecutorError> {
        let started_at = Utc::now();
        self.calls.write().await.push(RecordedCommand {
            command: command.clone(),
            timestamp: started_at,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        self.respond(&command, started_at).await
    }
}
