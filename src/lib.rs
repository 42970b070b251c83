//! Gatehouse is the core of an MCP gateway: it keeps connections to many
//! downstream tool servers, gates every tool call by consumer policy and
//! tracks the liveness of every upstream agent session.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns time sources, bounded polling, errors, configuration and
//!   the audit sink.
//! - [`mcp`] provides the transports, the connection factory, the OAuth
//!   client broker and the per-server connection state machine.
//! - [`permissions`] compiles consumer policy and answers access checks.
//! - [`sessions`] owns client sessions, idle collection and pings.
//! - [`event_store`] keeps resumable per-stream event logs.
//! - [`gateway`] merges all of the above into one tool catalog.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod event_store;
pub mod gateway;
pub mod mcp;
pub mod permissions;
pub mod sessions;
