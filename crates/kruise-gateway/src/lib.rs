//! HTTP gateway for the sandbox orchestrator.
//!
//! Serves three listeners: the public E2B-compatible API plus the sandbox
//! proxy and peer route endpoints, the MCP streamable-HTTP endpoint, and
//! the session replication endpoint. All of them are thin wire adapters
//! over `kruise-manager`.

pub mod mcp;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod server;
pub mod telemetry;
