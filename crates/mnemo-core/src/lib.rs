//! mnemo core: an agent loop whose only memory is a file.
//!
//! The model stream is reassembled into content blocks, tool calls run one
//! at a time against a sandbox and a persistent bash session, and the
//! working-memory document is replaced wholesale by the `sync` tool.

pub mod config;
pub mod core;
pub mod prompts;
pub mod providers;
pub mod sandbox;
pub mod shell;
pub mod tools;
