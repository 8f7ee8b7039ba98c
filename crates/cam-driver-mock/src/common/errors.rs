//! Error injection framework for mock stages.
//!
//! Enables configurable stage failures for resilience testing. Failures surface as
//! [`StageError`]s (whole-stage failure) or as individual failed outputs.

use super::rng::MockRng;
use cam_core::{FrameNumber, NodeRole, StageError, StageErrorKind, StageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock stages
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-stage failure rate (0.0 to 1.0), keyed by stage name, `"*"` for all stages
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A deterministic failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScenario {
    /// Fail every run of `stage` after `count` successful ones
    FailAfterN {
        /// Affected stage
        stage: StageId,
        /// Successful runs before failures start
        count: u32,
    },
    /// Fail `stage` when it processes `frame`
    FailOnFrame {
        /// Affected stage
        stage: StageId,
        /// Frame sequence number
        frame: u64,
    },
    /// Mark a single output of `stage` as failed on every run
    FailOutput {
        /// Affected stage
        stage: StageId,
        /// Output node
        role: NodeRole,
    },
    /// Every run of `stage` times out
    Timeout {
        /// Affected stage
        stage: StageId,
    },
    /// First run of `stage` latches a hardware fault, every later run fails too
    HardwareFault {
        /// Affected stage
        stage: StageId,
        /// Fault code reported
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Run counters for FailAfterN scenarios
    run_counts: HashMap<StageId, u32>,
    /// Latched hardware faults
    faults: HashMap<StageId, u32>,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    #[must_use]
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random failures and specific seed
    #[must_use]
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate); // Wildcard for all stages
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    #[must_use]
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    #[must_use]
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Create error config with custom failure rates per stage name
    #[must_use]
    pub fn with_rates(rates: HashMap<&'static str, f64>, seed: Option<u64>) -> Self {
        Self::build(rates, Vec::new(), seed)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Decides whether this run of `stage` on `frame` fails as a whole.
    pub fn check_stage(&self, stage: StageId, frame: FrameNumber) -> Result<(), StageError> {
        let mut state = self.state.lock();

        // Latched hardware fault
        if let Some(code) = state.faults.get(&stage) {
            return Err(StageError::new(
                stage,
                StageErrorKind::Hardware,
                format!("Hardware fault: {}", code),
            ));
        }

        let runs = {
            let count = state.run_counts.entry(stage).or_insert(0);
            *count += 1;
            *count
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { stage: s, count } if *s == stage && runs > *count => {
                    return Err(StageError::new(
                        stage,
                        StageErrorKind::Transform,
                        format!("Injected failure after {} runs", count),
                    ));
                }
                ErrorScenario::FailOnFrame { stage: s, frame: f } if *s == stage && *f == frame.0 => {
                    return Err(StageError::new(
                        stage,
                        StageErrorKind::Transform,
                        format!("Injected failure on frame {}", f),
                    ));
                }
                ErrorScenario::Timeout { stage: s } if *s == stage => {
                    return Err(StageError::new(
                        stage,
                        StageErrorKind::Timeout,
                        format!("Stage '{}' timed out", stage),
                    ));
                }
                ErrorScenario::HardwareFault { stage: s, code } if *s == stage => {
                    state.faults.insert(stage, *code);
                    return Err(StageError::new(
                        stage,
                        StageErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        // Check failure rates
        let rate = self
            .failure_rates
            .get(stage.as_str())
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(StageError::new(
                stage,
                StageErrorKind::Transform,
                format!("Random failure on stage '{}'", stage),
            ));
        }

        Ok(())
    }

    /// Outputs of `stage` that fail individually on every run.
    #[must_use]
    pub fn failed_outputs(&self, stage: StageId) -> Vec<NodeRole> {
        self.scenarios
            .iter()
            .filter_map(|scenario| match scenario {
                ErrorScenario::FailOutput { stage: s, role } if *s == stage => Some(*role),
                _ => None,
            })
            .collect()
    }

    /// Clears counters and latched faults.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.run_counts.clear();
        state.faults.clear();
    }

    /// Runs of `stage` seen so far.
    #[must_use]
    pub fn run_count(&self, stage: StageId) -> u32 {
        self.state.lock().run_counts.get(&stage).copied().unwrap_or(0)
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
