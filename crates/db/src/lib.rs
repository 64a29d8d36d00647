pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod workflow;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use workflow::{GradeReceipt, WorkflowService, WorkflowStores};
