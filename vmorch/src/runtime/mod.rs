pub(crate) mod core;
pub mod layout;
pub mod options;
pub(crate) mod rt_impl;
pub mod types;

pub use self::core::VmorchRuntime;
pub use layout::FilesystemLayout;
pub use options::{InstanceOptions, OrchestratorOptions};
pub use types::{InstanceId, InstanceInfo, generate_instance_id};
