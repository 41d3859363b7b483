//! Capabilities, tool dispatch, model client and the feedback loop.

pub mod capabilities;
pub mod feedback;
pub mod llm;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use feedback::{
    FeedbackController, FeedbackSettings, KeywordClassifier, OutcomeClassifier, RunOutcome,
    RunReport,
};
pub use llm::{ClientSettings, DispatchError, OpenAiClient, ToolDispatcher, TurnResult};
pub use tools::{ToolContext, ToolError, ToolRegistry};
