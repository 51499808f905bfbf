pub mod logger;
pub mod metrics;

pub use logger::{Logger, RequestRecord};
pub use metrics::Metrics;
