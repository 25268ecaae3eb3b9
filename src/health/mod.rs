//! Health telemetry — rolling uptime, response time and classification per
//! provider, built from the stream of health-check results.

pub mod monitor;
pub mod ring_buffer;

pub use monitor::{HealthMetrics, HealthMonitor, HealthReport, HealthStatus};
pub use ring_buffer::RingBuffer;
