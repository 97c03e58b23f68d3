//! `fetchgate` server (library surface).
//!
//! The primary entrypoint is the `fetchgate` binary (MCP stdio + streamable
//! HTTP). The library exists to support embedding and integration tests.

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod markdown;
pub mod mcp;
pub mod service;
pub mod session;
pub mod tasks;
