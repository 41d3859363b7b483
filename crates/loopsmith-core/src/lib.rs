//! Core data model for loopsmith: messages, tool descriptors, test outcomes,
//! the model-service contract, and the bounded conversation window.

pub mod conversation;
pub mod protocol;

pub use conversation::ConversationState;
pub use protocol::{
    ChatModel, Message, ModelError, ParamSpec, Role, Task, TestClassification,
    TestOutcome, ToolCallRequest, ToolDefinition,
};
