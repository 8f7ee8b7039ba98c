//! Operational modes for mock stages.
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Hardware-like timing for integration tests
//! - **Chaos**: Realistic timing plus random jitter and the configured failure rates

use serde::{Deserialize, Serialize};

/// Operational modes for mock stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
    /// Timing jitter and failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether stage delays apply in this mode.
    #[must_use]
    pub fn has_delays(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.has_delays());
        assert!(MockMode::Chaos.has_delays());
    }
}
