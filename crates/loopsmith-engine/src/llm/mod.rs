//! Model-service side of the engine: the HTTP client and the tool-calling loop.

pub mod agentic;
pub mod client;

pub use agentic::{DispatchError, ToolDispatcher, TurnResult};
pub use client::{ClientSettings, OpenAiClient};
