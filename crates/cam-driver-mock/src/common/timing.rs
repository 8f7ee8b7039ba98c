//! Per-stage processing times for realistic mode.

use cam_core::StageId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Simulated processing time of each stage family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Sensor readout in milliseconds (30 fps = 33 ms)
    pub sensor_readout_ms: u64,
    /// Demosaic / 3A / ISP passes
    pub isp_ms: u64,
    /// Scaler and vision passes
    pub scaler_ms: u64,
    /// JPEG encode
    pub encode_ms: u64,
    /// Upper bound of random jitter added in chaos mode
    pub jitter_ms: u64,
}

impl TimingConfig {
    /// Timing of a 30 fps sensor module.
    #[must_use]
    pub fn realistic() -> Self {
        Self {
            sensor_readout_ms: 33,
            isp_ms: 4,
            scaler_ms: 2,
            encode_ms: 25,
            jitter_ms: 5,
        }
    }

    /// Processing time of `stage`.
    #[must_use]
    pub fn for_stage(&self, stage: StageId) -> Duration {
        let ms = match stage {
            StageId::Sensor | StageId::SensorSecondary => self.sensor_readout_ms,
            StageId::Isp3a
            | StageId::Isp3aSecondary
            | StageId::Isp
            | StageId::Sync
            | StageId::ReprocIsp => self.isp_ms,
            StageId::Scaler | StageId::Vision | StageId::ReprocScaler => self.scaler_ms,
            StageId::Jpeg | StageId::ReprocJpeg => self.encode_ms,
        };
        Duration::from_millis(ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sensor_readout_ms: 0,
            isp_ms: 0,
            scaler_ms: 0,
            encode_ms: 0,
            jitter_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_families() {
        let timing = TimingConfig::realistic();
        assert_eq!(timing.for_stage(StageId::Sensor), Duration::from_millis(33));
        assert_eq!(timing.for_stage(StageId::ReprocJpeg), Duration::from_millis(25));
        assert_eq!(TimingConfig::default().for_stage(StageId::Isp), Duration::ZERO);
    }
}
