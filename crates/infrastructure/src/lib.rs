pub mod in_memory;
pub mod inventory;
pub mod process_calculator;
pub mod ssh_executor;
pub mod template_store;

pub use in_memory::{
    InMemoryEntityRepository, InMemoryJobRepository, InMemoryRegistry, InMemoryTaskRepository,
};
pub use inventory::Inventory;
pub use process_calculator::ProcessCalculator;
pub use ssh_executor::SshRemoteExecutor;
pub use template_store::{FileTemplateStore, InMemoryTemplateStore};
