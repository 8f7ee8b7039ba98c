//! Stage health monitoring.
//!
//! [`StageMonitor`] tracks:
//! - a heartbeat per stage worker, refreshed after every processed frame
//! - a bounded history of stage failures
//! - an overall [`SystemHealth`] derived from both
//!
//! A stage counts as stalled only while it is inside a transform: idle stages never go
//! stale.

use cam_core::{FrameNumber, MonitorConfig, StageId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Severity of a recorded stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum ErrorSeverity {
    /// Output-level failure, the frame still produced results
    Warning = 1,
    /// Stage run failed
    Error = 2,
    /// Hardware fault
    Critical = 3,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One recorded stage failure.
#[derive(Debug, Clone)]
pub struct StageFault {
    /// Failing stage
    pub stage: StageId,
    /// Severity
    pub severity: ErrorSeverity,
    /// Error text
    pub message: String,
    /// Frame being processed, if any
    pub frame: Option<FrameNumber>,
    /// When it was recorded
    pub timestamp: Instant,
}

/// Heartbeat view of one stage.
#[derive(Debug, Clone)]
pub struct StageHealth {
    /// Stage
    pub stage: StageId,
    /// Last heartbeat
    pub last_heartbeat: Instant,
    /// Inside a transform right now
    pub busy: bool,
    /// False when busy for longer than the heartbeat timeout
    pub is_healthy: bool,
    /// Frames processed since registration
    pub processed: u64,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SystemHealth {
    /// No recent failures, no stalled stage
    Healthy,
    /// Recent warnings or errors
    Degraded,
    /// Stalled stage, hardware fault or error burst
    Critical,
}

struct MonitorState {
    stages: HashMap<StageId, StageHealth>,
    error_history: VecDeque<StageFault>,
    heartbeat_timeout: Duration,
    max_error_history: usize,
    critical_error_count: usize,
    error_window: Duration,
}

/// Heartbeat and failure tracker shared by all stage workers of a session.
#[derive(Clone)]
pub struct StageMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl StageMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        let state = MonitorState {
            stages: HashMap::new(),
            error_history: VecDeque::new(),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            max_error_history: config.max_error_history,
            critical_error_count: config.critical_error_count,
            error_window: Duration::from_secs(config.error_window_secs),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Marks a stage as entering a transform.
    pub async fn begin_work(&self, stage: StageId) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let health = state.stages.entry(stage).or_insert_with(|| StageHealth {
            stage,
            last_heartbeat: now,
            busy: false,
            is_healthy: true,
            processed: 0,
        });
        health.busy = true;
        health.last_heartbeat = now;
    }

    /// Records a processed frame.
    pub async fn heartbeat(&self, stage: StageId) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let health = state.stages.entry(stage).or_insert_with(|| StageHealth {
            stage,
            last_heartbeat: now,
            busy: false,
            is_healthy: true,
            processed: 0,
        });
        health.busy = false;
        health.is_healthy = true;
        health.last_heartbeat = now;
        health.processed += 1;
    }

    /// Records a stage failure.
    pub async fn report_error(
        &self,
        stage: StageId,
        severity: ErrorSeverity,
        message: impl Into<String>,
        frame: Option<FrameNumber>,
    ) {
        let fault = StageFault {
            stage,
            severity,
            message: message.into(),
            frame,
            timestamp: Instant::now(),
        };

        let mut state = self.state.write().await;
        state.error_history.push_back(fault);
        if state.error_history.len() > state.max_error_history {
            state.error_history.pop_front();
        }
    }

    /// Overall health right now.
    pub async fn system_health(&self) -> SystemHealth {
        let state = self.state.read().await;
        let now = Instant::now();

        let has_stalled = state.stages.values().any(|health| {
            health.busy && now.duration_since(health.last_heartbeat) > state.heartbeat_timeout
        });

        let recent: Vec<&StageFault> = state
            .error_history
            .iter()
            .filter(|fault| now.duration_since(fault.timestamp) <= state.error_window)
            .collect();
        let has_critical = recent
            .iter()
            .any(|fault| fault.severity == ErrorSeverity::Critical);
        let error_burst = recent
            .iter()
            .filter(|fault| fault.severity >= ErrorSeverity::Error)
            .count()
            >= state.critical_error_count;

        if has_stalled || has_critical || error_burst {
            SystemHealth::Critical
        } else if recent.is_empty() {
            SystemHealth::Healthy
        } else {
            SystemHealth::Degraded
        }
    }

    /// Per-stage heartbeat view.
    pub async fn stage_health(&self) -> Vec<StageHealth> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let timeout = state.heartbeat_timeout;

        for health in state.stages.values_mut() {
            health.is_healthy =
                !health.busy || now.duration_since(health.last_heartbeat) <= timeout;
        }

        let mut stages: Vec<StageHealth> = state.stages.values().cloned().collect();
        stages.sort_by_key(|h| h.stage);
        stages
    }

    /// Most recent failures first.
    pub async fn error_history(&self, limit: Option<usize>) -> Vec<StageFault> {
        let state = self.state.read().await;
        let errors = state.error_history.iter().rev().cloned();
        match limit {
            Some(limit) => errors.take(limit).collect(),
            None => errors.collect(),
        }
    }

    /// Failures of one stage, most recent first.
    pub async fn stage_errors(&self, stage: StageId, limit: Option<usize>) -> Vec<StageFault> {
        let state = self.state.read().await;
        let errors = state
            .error_history
            .iter()
            .rev()
            .filter(|fault| fault.stage == stage)
            .cloned();
        match limit {
            Some(limit) => errors.take(limit).collect(),
            None => errors.collect(),
        }
    }

    /// Forgets recorded failures.
    pub async fn clear_error_history(&self) {
        self.state.write().await.error_history.clear();
    }

    /// Forgets a stage's heartbeat.
    pub async fn unregister(&self, stage: StageId) {
        self.state.write().await.stages.remove(&stage);
    }

    /// Number of recorded failures.
    pub async fn error_count(&self) -> usize {
        self.state.read().await.error_history.len()
    }
}

impl std::fmt::Debug for StageMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageMonitor").finish_non_exhaustive()
    }
}

/// First fatal error seen by any worker. Latched until the session is reconfigured.
#[derive(Debug, Default)]
pub struct FatalLatch {
    reason: parking_lot::Mutex<Option<String>>,
}

impl FatalLatch {
    /// Records `error` unless an earlier one is already latched.
    pub fn raise(&self, error: &cam_core::CamError) {
        let mut reason = self.reason.lock();
        if reason.is_none() {
            tracing::error!(error = %error, "Fatal pipeline error, session entering error state");
            *reason = Some(error.to_string());
        }
    }

    /// Latched error text.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Whether a fatal error was latched.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// Clears the latch.
    pub fn clear(&self) {
        *self.reason.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfig {
        MonitorConfig {
            heartbeat_timeout_ms: 50,
            max_error_history: 3,
            critical_error_count: 2,
            error_window_secs: 60,
        }
    }

    #[tokio::test]
    async fn heartbeat_tracking() {
        let monitor = StageMonitor::new(&config());
        monitor.begin_work(StageId::Isp).await;
        monitor.heartbeat(StageId::Isp).await;

        let stages = monitor.stage_health().await;
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, StageId::Isp);
        assert_eq!(stages[0].processed, 1);
        assert!(stages[0].is_healthy);
        assert_eq!(monitor.system_health().await, SystemHealth::Healthy);
    }

    #[tokio::test]
    async fn idle_stage_never_stalls() {
        let monitor = StageMonitor::new(&config());
        monitor.heartbeat(StageId::Sensor).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(monitor.system_health().await, SystemHealth::Healthy);
    }

    #[tokio::test]
    async fn busy_stage_past_timeout_is_critical() {
        let monitor = StageMonitor::new(&config());
        monitor.begin_work(StageId::Scaler).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(monitor.system_health().await, SystemHealth::Critical);
        let stages = monitor.stage_health().await;
        assert!(!stages[0].is_healthy);
    }

    #[tokio::test]
    async fn errors_degrade_then_escalate() {
        let monitor = StageMonitor::new(&config());
        monitor
            .report_error(StageId::Scaler, ErrorSeverity::Warning, "output", None)
            .await;
        assert_eq!(monitor.system_health().await, SystemHealth::Degraded);

        monitor
            .report_error(StageId::Scaler, ErrorSeverity::Error, "run", Some(FrameNumber(1)))
            .await;
        monitor
            .report_error(StageId::Isp, ErrorSeverity::Error, "run", Some(FrameNumber(2)))
            .await;
        assert_eq!(monitor.system_health().await, SystemHealth::Critical);

        assert_eq!(monitor.stage_errors(StageId::Scaler, None).await.len(), 2);
        let latest = monitor.error_history(Some(1)).await;
        assert_eq!(latest[0].stage, StageId::Isp);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let monitor = StageMonitor::new(&config());
        for i in 0..5 {
            monitor
                .report_error(StageId::Jpeg, ErrorSeverity::Warning, format!("e{i}"), None)
                .await;
        }
        assert_eq!(monitor.error_count().await, 3);
        monitor.clear_error_history().await;
        assert_eq!(monitor.error_count().await, 0);
    }

    #[test]
    fn fatal_latch_keeps_first_error() {
        let latch = FatalLatch::default();
        assert!(!latch.is_raised());
        latch.raise(&cam_core::CamError::Protocol("first".into()));
        latch.raise(&cam_core::CamError::Protocol("second".into()));
        assert!(latch.reason().unwrap().contains("first"));
        latch.clear();
        assert!(latch.reason().is_none());
    }
}
