pub mod entities;
pub mod ports;
pub mod repositories;
pub mod resources;
pub mod value_objects;

pub use entities::*;
pub use ports::*;
pub use repositories::*;
pub use resources::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
pub use value_objects::*;
