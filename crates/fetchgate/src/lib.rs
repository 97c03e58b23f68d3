//! Facade crate: re-exports the stable core types.
//!
//! Depend on `fetchgate-net` / `fetchgate-mcp` directly for the fetch
//! subsystem and the server.

pub use fetchgate_core::*;
