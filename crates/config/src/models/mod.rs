pub mod app_config;
pub mod host_policy;
pub mod logging;
pub mod scheduler;

pub use app_config::*;
pub use host_policy::*;
pub use logging::*;
pub use scheduler::*;
