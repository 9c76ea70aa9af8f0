pub mod logging;
pub mod metrics_collector;
pub mod structured_logger;

pub use logging::{init_logging, init_metrics, LogFormat, LoggingConfig};
pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
