//! Simulated image pipeline hardware.
//!
//! [`MockDevice`] provides a [`StageTransform`] for every [`StageId`]. Each transform:
//!
//! 1. waits while its stage is paused (see [`MockDevice::pause`])
//! 2. sleeps for the configured processing time (Realistic / Chaos)
//! 3. consults the [`ErrorConfig`] and fails the whole run or single outputs
//! 4. stamps every output with a frame marker and publishes stage metadata
//!
//! Sensor stages stamp `sensor_timestamp_ns`, which drives shutter notifications. The 3A
//! stage publishes a partial result.

use async_trait::async_trait;
use cam_core::{
    FrameNumber, StageError, StageErrorKind, StageId, StageIo, StageTransform, TransformProvider,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::pattern;

/// Nominal sensor frame period used for simulated timestamps.
const FRAME_PERIOD_NS: u64 = 33_333_333;

struct DeviceShared {
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: MockRng,
    gates: HashMap<StageId, watch::Sender<bool>>,
    processed: Mutex<HashMap<StageId, u64>>,
    started: Mutex<HashMap<StageId, bool>>,
}

/// Builder for [`MockDevice`].
#[derive(Debug, Default)]
pub struct MockDeviceBuilder {
    mode: MockMode,
    timing: Option<TimingConfig>,
    errors: ErrorConfig,
    seed: Option<u64>,
}

impl MockDeviceBuilder {
    /// Operational mode.
    #[must_use]
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stage timing (defaults to [`TimingConfig::realistic`] outside Instant mode).
    #[must_use]
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Error injection.
    #[must_use]
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Seed for chaos-mode jitter.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the device.
    #[must_use]
    pub fn build(self) -> MockDevice {
        let timing = match (self.timing, self.mode) {
            (Some(timing), _) => timing,
            (None, MockMode::Instant) => TimingConfig::default(),
            (None, _) => TimingConfig::realistic(),
        };
        let gates = StageId::ALL
            .iter()
            .map(|&stage| (stage, watch::channel(true).0))
            .collect();
        MockDevice {
            shared: Arc::new(DeviceShared {
                mode: self.mode,
                timing,
                errors: self.errors,
                rng: MockRng::new(self.seed),
                gates,
                processed: Mutex::new(HashMap::new()),
                started: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Simulated hardware for every pipeline stage.
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<DeviceShared>,
}

impl MockDevice {
    /// Instant mode, no errors.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a device.
    #[must_use]
    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder::default()
    }

    /// Holds every subsequent run of `stage` until [`MockDevice::resume`].
    pub fn pause(&self, stage: StageId) {
        if let Some(gate) = self.shared.gates.get(&stage) {
            gate.send_replace(false);
            debug!(%stage, "Mock stage paused");
        }
    }

    /// Releases runs held by [`MockDevice::pause`].
    pub fn resume(&self, stage: StageId) {
        if let Some(gate) = self.shared.gates.get(&stage) {
            gate.send_replace(true);
            debug!(%stage, "Mock stage resumed");
        }
    }

    /// Frames processed by `stage`, including failed runs.
    #[must_use]
    pub fn processed(&self, stage: StageId) -> u64 {
        self.shared
            .processed
            .lock()
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    /// Whether `stage` is between start and stop.
    #[must_use]
    pub fn is_started(&self, stage: StageId) -> bool {
        self.shared
            .started
            .lock()
            .get(&stage)
            .copied()
            .unwrap_or(false)
    }

    /// Error injection shared by every stage.
    #[must_use]
    pub fn errors(&self) -> &ErrorConfig {
        &self.shared.errors
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("mode", &self.shared.mode)
            .field("timing", &self.shared.timing)
            .finish()
    }
}

impl TransformProvider for MockDevice {
    fn transform_for(&self, stage: StageId) -> Arc<dyn StageTransform> {
        Arc::new(MockTransform {
            stage,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Transform of one simulated stage.
pub struct MockTransform {
    stage: StageId,
    shared: Arc<DeviceShared>,
}

impl MockTransform {
    async fn wait_gate(&self) -> Result<(), StageError> {
        let Some(gate) = self.shared.gates.get(&self.stage) else {
            return Ok(());
        };
        let mut rx = gate.subscribe();
        rx.wait_for(|open| *open).await.map(|_| ()).map_err(|_| {
            StageError::new(self.stage, StageErrorKind::NotRunning, "device gate closed")
        })
    }

    async fn simulate_delay(&self) {
        if !self.shared.mode.has_delays() {
            return;
        }
        let mut delay = self.shared.timing.for_stage(self.stage);
        if self.shared.mode == MockMode::Chaos {
            delay += Duration::from_millis(self.shared.rng.jitter_ms(self.shared.timing.jitter_ms));
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    fn publish_metadata(&self, io: &mut StageIo) {
        let frame = io.frame_number();
        match self.stage {
            StageId::Sensor | StageId::SensorSecondary | StageId::ReprocIsp => {
                io.result.frame_number = Some(frame);
                io.result.sensor_timestamp_ns = Some(timestamp_for(frame));
                io.result.exposure_time_ns = io.control().exposure_time_ns;
                if self.stage == StageId::ReprocIsp && io.inputs.len() > 1 {
                    io.result
                        .entries
                        .insert("accumulated_frames".into(), Value::from(io.inputs.len()));
                }
            }
            StageId::Isp3a | StageId::Isp3aSecondary => {
                let mut partial = cam_core::ResultMetadata::default();
                partial
                    .entries
                    .insert("ae.state".into(), Value::from("converged"));
                partial
                    .entries
                    .insert("awb.state".into(), Value::from("converged"));
                io.partial = Some(partial);
            }
            StageId::Vision => {
                io.result
                    .entries
                    .insert("vision.faces".into(), Value::from(0));
            }
            _ => {}
        }
    }
}

fn timestamp_for(frame: FrameNumber) -> u64 {
    frame.0.saturating_add(1).saturating_mul(FRAME_PERIOD_NS)
}

#[async_trait]
impl StageTransform for MockTransform {
    async fn start(&self, stage: StageId) -> Result<(), StageError> {
        self.shared.started.lock().insert(stage, true);
        Ok(())
    }

    async fn process(&self, io: &mut StageIo) -> Result<(), StageError> {
        self.wait_gate().await?;
        self.simulate_delay().await;

        *self.shared.processed.lock().entry(self.stage).or_insert(0) += 1;
        self.shared
            .errors
            .check_stage(self.stage, io.frame_number())?;

        for role in self.shared.errors.failed_outputs(self.stage) {
            io.fail_output(role);
        }

        let frame = io.frame_number();
        for slot in io.outputs.iter_mut().filter(|slot| !slot.failed) {
            pattern::stamp(&mut slot.buffer, frame, self.stage);
        }
        self.publish_metadata(io);

        trace!(stage = %self.stage, %frame, outputs = io.outputs.len(), "Mock stage processed frame");
        Ok(())
    }

    async fn stop(&self, stage: StageId) -> Result<(), StageError> {
        self.shared.started.lock().insert(stage, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use cam_core::{ControlMetadata, NodeRole, OutputSlot};
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};

    fn io_for(pool: &BufferPool, stage: StageId, frame: u64, roles: &[NodeRole]) -> StageIo {
        StageIo::new(
            FrameNumber(frame),
            stage,
            Arc::new(ControlMetadata::new().with_exposure_ns(1_000)),
            Vec::new(),
            true,
            roles
                .iter()
                .map(|&role| OutputSlot::new(role, pool.try_acquire().unwrap()))
                .collect(),
        )
    }

    fn pool() -> BufferPool {
        BufferPool::with_heap(PoolSpec::fixed("mock", 4, BufferLayout::single_plane(32))).unwrap()
    }

    #[tokio::test]
    async fn sensor_stamps_outputs_and_timestamp() {
        let device = MockDevice::new();
        let transform = device.transform_for(StageId::Sensor);
        let pool = pool();
        let mut io = io_for(&pool, StageId::Sensor, 5, &[NodeRole::Forward]);

        transform.process(&mut io).await.unwrap();
        assert_eq!(io.result.sensor_timestamp_ns, Some(6 * FRAME_PERIOD_NS));
        assert_eq!(io.result.exposure_time_ns, Some(1_000));
        let marker = pattern::read_marker(io.output_mut(NodeRole::Forward).unwrap());
        assert_eq!(marker, Some((FrameNumber(5), StageId::Sensor)));
        assert_eq!(device.processed(StageId::Sensor), 1);
    }

    #[tokio::test]
    async fn isp3a_publishes_partial() {
        let device = MockDevice::new();
        let pool = pool();
        let mut io = io_for(&pool, StageId::Isp3a, 1, &[NodeRole::Forward]);
        device
            .transform_for(StageId::Isp3a)
            .process(&mut io)
            .await
            .unwrap();
        assert!(io.partial.is_some());
    }

    #[tokio::test]
    async fn injected_output_failure() {
        let device = MockDevice::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::FailOutput {
                stage: StageId::Scaler,
                role: NodeRole::Video,
            }))
            .build();
        let pool = pool();
        let mut io = io_for(&pool, StageId::Scaler, 1, &[NodeRole::Preview, NodeRole::Video]);
        device
            .transform_for(StageId::Scaler)
            .process(&mut io)
            .await
            .unwrap();
        let failed: Vec<_> = io.outputs.iter().filter(|o| o.failed).map(|o| o.role).collect();
        assert_eq!(failed, vec![NodeRole::Video]);
    }

    #[tokio::test]
    async fn pause_holds_processing() {
        let device = MockDevice::new();
        device.pause(StageId::Isp);
        let transform = device.transform_for(StageId::Isp);
        let pool = pool();
        let mut io = io_for(&pool, StageId::Isp, 1, &[NodeRole::Forward]);

        let handle = tokio::spawn(async move {
            transform.process(&mut io).await.map(|_| io.frame_number())
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        device.resume(StageId::Isp);
        assert_eq!(handle.await.unwrap().unwrap(), FrameNumber(1));
    }

    #[tokio::test]
    async fn start_stop_tracking() {
        let device = MockDevice::new();
        let transform = device.transform_for(StageId::Vision);
        transform.start(StageId::Vision).await.unwrap();
        assert!(device.is_started(StageId::Vision));
        transform.stop(StageId::Vision).await.unwrap();
        assert!(!device.is_started(StageId::Vision));
    }
}
