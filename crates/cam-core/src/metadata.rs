//! Control and result metadata carried by requests and frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::FrameNumber;

/// Capture controls in effect for a request. Unset fields inherit from the previous request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlMetadata {
    /// Requested exposure
    pub exposure_time_ns: Option<u64>,
    /// Requested frame duration
    pub frame_duration_ns: Option<u64>,
    /// Analog gain (ISO)
    pub sensitivity: Option<u32>,
    /// Feature toggle for the vision stage
    pub vision_enabled: Option<bool>,
    /// Free-form vendor / tuning entries
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
}

impl ControlMetadata {
    /// Empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the exposure time.
    #[must_use]
    pub fn with_exposure_ns(mut self, exposure_ns: u64) -> Self {
        self.exposure_time_ns = Some(exposure_ns);
        self
    }

    /// Sets the vision feature toggle.
    #[must_use]
    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.vision_enabled = Some(enabled);
        self
    }

    /// Adds a free-form entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// These settings with every unset field taken from `baseline`.
    #[must_use]
    pub fn inherit(&self, baseline: &ControlMetadata) -> ControlMetadata {
        let mut entries = baseline.entries.clone();
        entries.extend(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        ControlMetadata {
            exposure_time_ns: self.exposure_time_ns.or(baseline.exposure_time_ns),
            frame_duration_ns: self.frame_duration_ns.or(baseline.frame_duration_ns),
            sensitivity: self.sensitivity.or(baseline.sensitivity),
            vision_enabled: self.vision_enabled.or(baseline.vision_enabled),
            entries,
        }
    }

    /// Number of sensor frames needed to accumulate the requested exposure.
    #[must_use]
    pub fn accumulation_frames(&self, max_sensor_exposure_ns: u64) -> u32 {
        match self.exposure_time_ns {
            Some(exposure) if max_sensor_exposure_ns > 0 && exposure > max_sensor_exposure_ns => {
                u32::try_from(exposure.div_ceil(max_sensor_exposure_ns)).unwrap_or(u32::MAX)
            }
            _ => 1,
        }
    }
}

/// Result metadata assembled while a frame moves through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Frame that produced this result
    pub frame_number: Option<FrameNumber>,
    /// Start-of-exposure timestamp, drives the shutter notification
    pub sensor_timestamp_ns: Option<u64>,
    /// Exposure actually applied
    pub exposure_time_ns: Option<u64>,
    /// Stage-provided entries (3A state, statistics, detection results)
    #[serde(default)]
    pub entries: BTreeMap<String, Value>,
}

impl ResultMetadata {
    /// Merges `other` into `self`. Existing timing fields win, entries from `other` overwrite.
    pub fn merge(&mut self, other: &ResultMetadata) {
        self.frame_number = self.frame_number.or(other.frame_number);
        self.sensor_timestamp_ns = self.sensor_timestamp_ns.or(other.sensor_timestamp_ns);
        self.exposure_time_ns = self.exposure_time_ns.or(other.exposure_time_ns);
        self.entries
            .extend(other.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame_number.is_none()
            && self.sensor_timestamp_ns.is_none()
            && self.exposure_time_ns.is_none()
            && self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_fills_unset_fields() {
        let baseline = ControlMetadata::new()
            .with_exposure_ns(10_000_000)
            .with_entry("ae.mode", "on");
        let next = ControlMetadata::new()
            .with_vision(true)
            .with_entry("af.mode", "auto");

        let merged = next.inherit(&baseline);
        assert_eq!(merged.exposure_time_ns, Some(10_000_000));
        assert_eq!(merged.vision_enabled, Some(true));
        assert_eq!(merged.entries.len(), 2);
    }

    #[test]
    fn accumulation_frame_count() {
        let max = 100_000_000;
        assert_eq!(ControlMetadata::new().accumulation_frames(max), 1);
        assert_eq!(
            ControlMetadata::new()
                .with_exposure_ns(max)
                .accumulation_frames(max),
            1
        );
        assert_eq!(
            ControlMetadata::new()
                .with_exposure_ns(max * 2 + 1)
                .accumulation_frames(max),
            3
        );
    }

    #[test]
    fn result_merge_keeps_first_timestamp() {
        let mut result = ResultMetadata {
            sensor_timestamp_ns: Some(5),
            ..ResultMetadata::default()
        };
        let later = ResultMetadata {
            sensor_timestamp_ns: Some(9),
            exposure_time_ns: Some(3),
            entries: BTreeMap::from([("awb.state".to_string(), Value::from("converged"))]),
            ..ResultMetadata::default()
        };
        result.merge(&later);
        assert_eq!(result.sensor_timestamp_ns, Some(5));
        assert_eq!(result.exposure_time_ns, Some(3));
        assert!(!result.is_empty());
    }
}
