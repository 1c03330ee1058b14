//! HTTP surface for askpipe.
//!
//! The binary (`askpipe`) serves a small JSON API over an Ollama backend:
//! plain chat, SSE-streamed chat with live search dispatch, model listing,
//! and a health probe. The library split exists so integration tests can
//! assemble the router and orchestrator in-process.

pub use askpipe_core as core;

pub mod auth;
pub mod config;
pub mod orchestrate;
pub mod prompts;
pub mod routes;
