//! Session configuration.
//!
//! Loaded with `figment` in three layers, later layers winning:
//!
//! 1. Built-in defaults ([`SessionConfig::default`])
//! 2. Optional TOML file
//! 3. `CAM_`-prefixed environment variables, `__` separating nested keys
//!    (e.g. `CAM_SELECTOR__HOLD_COUNT=4`)
//!
//! The resolved capability flags (reprocessing mode, dual mode, vision mode) decide which
//! graphs the session builds and stay fixed until the next `configure`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{CamError, CamResult};
use crate::types::{NodeRole, StageId};

/// How raw data for still captures is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessingMode {
    /// Every streaming frame keeps its raw buffer in a bounded FIFO
    AlwaysOn,
    /// Raw buffers are kept only while a capture needs them
    #[default]
    Dynamic,
    /// No reprocessing graph; stills are encoded inline from the streaming path
    None,
}

/// Dual-sensor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DualMode {
    /// Single sensor module
    #[default]
    Off,
    /// Both sensors stream, joined by the sync stage
    Sync,
    /// Only the primary sensor streams
    Master,
    /// Only the secondary sensor streams
    Slave,
}

/// Allocation policy override for one internal pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicy {
    /// Allocate `count` buffers at configure
    Fixed,
    /// Allocate lazily up to `count`
    OnDemand,
}

/// Size / policy override for the pool of one stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOverride {
    /// Producing stage
    pub stage: StageId,
    /// Output node
    pub role: NodeRole,
    /// Allocation policy
    pub policy: PoolPolicy,
    /// Buffer count (fixed) or ceiling (on-demand)
    pub count: usize,
}

/// Capture selector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Raw buffers held in the FIFO
    pub hold_count: usize,
    /// Budget for waiting on a specific raw frame
    pub select_timeout_ms: u64,
    /// Longest exposure one sensor frame can deliver; longer requests accumulate frames
    pub max_sensor_exposure_ns: u64,
    /// Most sensor frames one long exposure may accumulate
    pub max_accumulation_frames: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hold_count: 2,
            select_timeout_ms: 500,
            max_sensor_exposure_ns: 250_000_000,
            max_accumulation_frames: 8,
        }
    }
}

/// Bounded waits used by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Longest a submit may wait for pacing
    pub submit_ms: u64,
    /// Longest a flush waits for buffers to come home
    pub flush_ms: u64,
    /// Longest a stage waits on an acquire fence
    pub fence_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            submit_ms: 2_000,
            flush_ms: 3_000,
            fence_ms: 500,
        }
    }
}

/// Stage health monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Running stage without a heartbeat for this long is reported stale
    pub heartbeat_timeout_ms: u64,
    /// Errors kept in history
    pub max_error_history: usize,
    /// Errors within the window that make the session critical
    pub critical_error_count: usize,
    /// Window for `critical_error_count`
    pub error_window_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 2_000,
            max_error_history: 100,
            critical_error_count: 10,
            error_window_secs: 60,
        }
    }
}

/// Everything a session needs besides the stream set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sensor output width
    pub sensor_width: u32,
    /// Sensor output height
    pub sensor_height: u32,
    /// Frames the hardware keeps queued
    pub pipeline_depth: usize,
    /// Target streaming frame rate
    pub frame_rate: u32,
    /// Raw retention / still capture policy
    pub reprocessing: ReprocessingMode,
    /// Dual-sensor operation
    pub dual: DualMode,
    /// Build the vision graph instead of the preview graph
    pub vision_mode: bool,
    /// Generate internal frames while no request is waiting
    pub filler_frames: bool,
    /// Capacity of each stage input queue
    pub stage_queue_depth: usize,
    /// Capacity of the completion event queue
    pub event_queue_depth: usize,
    /// Capture selector
    pub selector: SelectorConfig,
    /// Bounded waits
    pub timeouts: TimeoutConfig,
    /// Stage health monitor
    pub monitor: MonitorConfig,
    /// Internal pool overrides
    pub pools: Vec<PoolOverride>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sensor_width: 640,
            sensor_height: 480,
            pipeline_depth: 4,
            frame_rate: 30,
            reprocessing: ReprocessingMode::Dynamic,
            dual: DualMode::Off,
            vision_mode: false,
            filler_frames: false,
            stage_queue_depth: 8,
            event_queue_depth: 64,
            selector: SelectorConfig::default(),
            timeouts: TimeoutConfig::default(),
            monitor: MonitorConfig::default(),
            pools: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Loads defaults, then `path` (if any), then `CAM_*` environment variables.
    pub fn load(path: Option<&Path>) -> CamResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(SessionConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(CamError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "Loading session config file");
            figment = figment.merge(Toml::file(path));
        }
        let config: SessionConfig = figment
            .merge(Env::prefixed("CAM_").split("__"))
            .extract()?;
        config.validate()?;
        info!(
            depth = config.pipeline_depth,
            fps = config.frame_rate,
            reprocessing = ?config.reprocessing,
            dual = ?config.dual,
            "Session config loaded"
        );
        Ok(config)
    }

    /// Parses a TOML document layered over the defaults. Environment is not consulted.
    pub fn from_toml_str(toml: &str) -> CamResult<Self> {
        let config: SessionConfig = Figment::from(Serialized::defaults(SessionConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> CamResult<()> {
        if self.sensor_width == 0 || self.sensor_height == 0 {
            return Err(CamError::Configuration("sensor size must be non-zero".into()));
        }
        if self.pipeline_depth == 0 {
            return Err(CamError::Configuration("pipeline_depth must be > 0".into()));
        }
        if self.frame_rate == 0 {
            return Err(CamError::Configuration("frame_rate must be > 0".into()));
        }
        if self.stage_queue_depth == 0 || self.event_queue_depth == 0 {
            return Err(CamError::Configuration("queue depths must be > 0".into()));
        }
        if self.selector.hold_count == 0 {
            return Err(CamError::Configuration("selector.hold_count must be > 0".into()));
        }
        if self.selector.max_accumulation_frames == 0 {
            return Err(CamError::Configuration(
                "selector.max_accumulation_frames must be > 0".into(),
            ));
        }
        let accumulation = self.selector.max_accumulation_frames as usize;
        if let Some(bad) = self
            .pools
            .iter()
            .find(|p| p.role == NodeRole::Bayer && p.count < accumulation)
        {
            return Err(CamError::Configuration(format!(
                "pool override {}:{} holds {} buffers, long exposures need {accumulation}",
                bad.stage, bad.role, bad.count
            )));
        }
        if self.vision_mode && self.dual != DualMode::Off {
            return Err(CamError::Configuration(
                "vision_mode cannot be combined with dual sensors".into(),
            ));
        }
        if let Some(bad) = self.pools.iter().find(|p| p.count == 0) {
            return Err(CamError::Configuration(format!(
                "pool override {}:{} has count 0",
                bad.stage, bad.role
            )));
        }
        Ok(())
    }

    /// Outstanding accepted requests allowed before `submit_request` waits.
    ///
    /// Faster frame rates keep more work in the hardware queues, so every 30 fps above the
    /// first adds one slot.
    #[must_use]
    pub fn pacing_threshold(&self) -> usize {
        let rate_slots = (self.frame_rate / 30).max(1) as usize;
        self.pipeline_depth + rate_slots - 1
    }

    /// Raw buffers the capture selector keeps unclaimed. Never fewer than one full
    /// accumulation, so the first frames of a long exposure are not evicted before they
    /// are claimed.
    #[must_use]
    pub fn raw_hold_capacity(&self) -> usize {
        self.selector
            .hold_count
            .max(self.selector.max_accumulation_frames as usize)
    }

    /// Ceiling of an on-demand raw retention pool: every paced request accumulating the
    /// longest exposure, plus the selector FIFO.
    #[must_use]
    pub fn raw_pool_ceiling(&self) -> usize {
        let accumulation = self.selector.max_accumulation_frames as usize;
        (self.pacing_threshold() + 1)
            .saturating_mul(accumulation)
            .saturating_add(self.raw_hold_capacity())
    }

    /// Nominal time between sensor frames.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.frame_rate.max(1)))
    }

    /// Bytes of one internal full-size buffer.
    #[must_use]
    pub fn internal_buffer_bytes(&self) -> usize {
        self.sensor_width as usize * self.sensor_height as usize * 2
    }

    /// Override registered for a pool, if any.
    #[must_use]
    pub fn pool_override(&self, stage: StageId, role: NodeRole) -> Option<&PoolOverride> {
        self.pools
            .iter()
            .find(|p| p.stage == stage && p.role == role)
    }

    /// Submit pacing budget.
    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.submit_ms)
    }

    /// Flush reclaim budget.
    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.flush_ms)
    }

    /// Acquire fence budget.
    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.fence_ms)
    }

    /// Raw selection budget.
    #[must_use]
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.selector.select_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pacing_threshold(), 4);
        assert_eq!(config.frame_interval(), Duration::from_micros(33_333));
    }

    #[test]
    fn pacing_grows_with_frame_rate() {
        let config = SessionConfig {
            frame_rate: 120,
            pipeline_depth: 3,
            ..SessionConfig::default()
        };
        assert_eq!(config.pacing_threshold(), 6);
    }

    #[test]
    fn toml_layers_over_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            pipeline_depth = 2
            reprocessing = "always_on"
            dual = "sync"

            [selector]
            hold_count = 5

            [[pools]]
            stage = "isp"
            role = "forward"
            policy = "on_demand"
            count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline_depth, 2);
        assert_eq!(config.reprocessing, ReprocessingMode::AlwaysOn);
        assert_eq!(config.dual, DualMode::Sync);
        assert_eq!(config.selector.hold_count, 5);
        assert_eq!(config.selector.select_timeout_ms, 500);
        let pool = config.pool_override(StageId::Isp, NodeRole::Forward).unwrap();
        assert_eq!(pool.policy, PoolPolicy::OnDemand);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(SessionConfig::from_toml_str("pipeline_depth = 0").is_err());
        assert!(SessionConfig::from_toml_str("vision_mode = true\ndual = \"master\"").is_err());
        assert!(SessionConfig::from_toml_str("pipeline_depth = \"deep\"").is_err());
        assert!(
            SessionConfig::from_toml_str("[selector]\nmax_accumulation_frames = 0").is_err()
        );
    }

    #[test]
    fn raw_pool_fits_longest_accumulation() {
        let mut config = SessionConfig::default();
        config.selector.hold_count = 2;
        config.selector.max_accumulation_frames = 30;
        assert_eq!(config.raw_hold_capacity(), 30);
        // five paced requests of 30 frames plus the FIFO
        assert_eq!(config.raw_pool_ceiling(), 5 * 30 + 30);

        config.pools.push(PoolOverride {
            stage: StageId::Sensor,
            role: NodeRole::Bayer,
            policy: PoolPolicy::OnDemand,
            count: 29,
        });
        assert!(matches!(config.validate(), Err(CamError::Configuration(_))));
        config.pools[0].count = 30;
        config.validate().unwrap();
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "frame_rate = 60\nfiller_frames = true").unwrap();
        let config = SessionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.frame_rate, 60);
        assert!(config.filler_frames);

        let missing = SessionConfig::load(Some(Path::new("/nonexistent/cam.toml")));
        assert!(matches!(missing, Err(CamError::Configuration(_))));
    }
}
