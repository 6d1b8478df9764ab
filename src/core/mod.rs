pub mod llm;
pub mod log;
pub mod mcp;
pub mod terminal;
