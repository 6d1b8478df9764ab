//! Agent telemetry core: a versioned execution-log schema, streaming LLM normalization and
//! MCP connectivity monitoring, with the `mindforge` command line on top.

pub mod cli;
pub mod core;
pub(crate) mod logging;
