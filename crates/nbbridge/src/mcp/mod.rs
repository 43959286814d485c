//! Model Context Protocol (MCP) server surface.
//!
//! Each tool resolves its notebook (the active one when no path is given),
//! then goes through the Document Bridge or the Execution Proxy.

mod server;
mod types;

pub use server::{to_error_data, NotebookTools};
pub use types::*;
