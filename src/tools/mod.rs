pub mod dispatcher;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use dispatcher::{DependencyGraph, ToolDispatcher};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schema::{handoff_args_schema, HandoffArgs};
