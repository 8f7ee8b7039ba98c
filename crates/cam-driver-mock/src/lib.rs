//! Simulated hardware for the capture pipeline.
//!
//! This crate provides stage transforms and allocation backends that behave like the real
//! image pipeline without touching any device. All delays use `tokio::time::sleep`.
//!
//! # Components
//!
//! - [`MockDevice`] - [`cam_core::TransformProvider`] with a transform for every stage
//! - [`MockAllocator`] - heap allocator with an injectable limit
//! - [`ErrorConfig`] / [`ErrorScenario`] - deterministic and random failure injection
//! - [`pattern`] - frame markers written into every output buffer
//!
//! # Example
//!
//! ```rust,ignore
//! use cam_driver_mock::{ErrorConfig, ErrorScenario, MockDevice};
//! use cam_core::StageId;
//!
//! let device = MockDevice::builder()
//!     .errors(ErrorConfig::scenario(ErrorScenario::FailOnFrame {
//!         stage: StageId::Scaler,
//!         frame: 3,
//!     }))
//!     .build();
//! ```

pub mod common;
pub mod pattern;

mod allocator;
mod mock_device;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use allocator::MockAllocator;
pub use mock_device::{MockDevice, MockDeviceBuilder, MockTransform};
