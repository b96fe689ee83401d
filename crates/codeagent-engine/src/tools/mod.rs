//! Tools: the registry and the built-in workspace tools.

pub mod builtin;
mod registry;

pub use builtin::register_builtins;
pub use registry::{
    RegistryError, Rejection, ToolContext, ToolError, ToolHandler, ToolOutput, ToolRegistry, ToolSpec,
    parse_args,
};
