pub mod chain;
pub mod graded;
pub mod identity;
pub mod kpi;
pub mod workflow;
