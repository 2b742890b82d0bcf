//! Shared types for the Lemonade gateway.
//!
//! This crate holds the pieces every other crate needs: the unified error
//! type, canonical filesystem locations, the model descriptor, the telemetry
//! record, and the hardware probe.

pub mod error;
pub mod hardware;
pub mod model;
pub mod paths;
pub mod telemetry;

pub use error::{Error, Result};
pub use hardware::{HardwareInfo, SupportedBackends};
pub use model::{DeviceType, ModelDescriptor, ModelSource, ModelType, Recipe};
pub use telemetry::{SharedTelemetry, TelemetryRecord};
