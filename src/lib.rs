//! OpenAI-compatible chat completions in front of the AnuNeko chat service.
//!
//! Requests arrive in the OpenAI shape, are bound to a long-lived AnuNeko chat
//! per conversation, and the backend's line stream is translated back into
//! completion objects or SSE chunks.

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod formatter;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod translator;
