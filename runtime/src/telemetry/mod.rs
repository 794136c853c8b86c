//! Interaction telemetry: batching and delivery.

pub mod analytics;
pub mod transport;

pub use analytics::{AnalyticsBatcher, FlushOutcome};
pub use transport::{HttpTelemetryTransport, OfflineSink, TelemetryTransport};
