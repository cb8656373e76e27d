// MCP (Model Context Protocol) surface of the gateway: JSON-RPC types,
// the tool and resource catalogs, and the request dispatcher.

pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

#[cfg(test)]
mod testing;

pub use server::{Dispatched, McpServer, RequestContext};
