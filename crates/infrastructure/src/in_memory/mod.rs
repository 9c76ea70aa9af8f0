//! 内存实现
//!
//! 适用于嵌入式部署和测试，所有读-改-写操作都在同一把锁内完成。

mod entity;
mod job;
mod registry;
mod task;

pub use entity::InMemoryEntityRepository;
pub use job::InMemoryJobRepository;
pub use registry::InMemoryRegistry;
pub use task::InMemoryTaskRepository;
