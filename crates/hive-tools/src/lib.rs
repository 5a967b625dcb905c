pub mod builtin;
pub mod fn_tool;
pub mod mock;
pub mod registry;

pub use fn_tool::FnTool;
pub use mock::DeclaredTool;
pub use registry::{ToolRegistry, ToolRegistryBuilder};
