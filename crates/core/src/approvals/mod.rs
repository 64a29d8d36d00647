//! Chain construction and the engine that drives decisions and grading.

pub mod builder;
pub mod engine;

pub use builder::{ChainBuilder, ChainPolicy, GradedChainBuilder, WalkStop};
pub use engine::{ApprovalEngine, GradeVerdict, OperationContext};
