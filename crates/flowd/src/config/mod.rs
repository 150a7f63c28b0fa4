//! Static configuration: YAML workflow definitions, with `$include`
//! composition and `${ENV:default}` expansion.

pub mod loader;
pub mod workflow;

pub use loader::{deep_merge, load_yaml_config, load_yaml_file};
pub use workflow::{BuiltWorkflow, ConfigError, EdgeSpec, QueueSpec, RecurrenceSpec, ServerSpec, TaskSpec, WorkflowConfig};
