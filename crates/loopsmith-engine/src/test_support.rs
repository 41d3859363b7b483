//! Scripted model double shared by unit and scenario tests.

use loopsmith_core::{ChatModel, Message, ModelError, ToolCallRequest, ToolDefinition};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Replays a fixed sequence of replies and records every request it sees.
///
/// Once the script is exhausted it answers with [`ModelError::NoChoices`],
/// unless built with [`ScriptedModel::repeating`].
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<Message, String>>>,
    fallback: Option<Message>,
    requests: Mutex<Vec<Vec<Message>>>,
    advertised: Mutex<Vec<Vec<&'static str>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Message>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    /// `Err(text)` entries surface as transport failures.
    pub fn from_results(replies: Vec<Result<Message, String>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            advertised: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with the same reply.
    pub fn repeating(reply: Message) -> Self {
        let mut model = Self::new(Vec::new());
        model.fallback = Some(reply);
        model
    }

    /// Every message list sent so far, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Tool names offered with each request.
    pub fn advertised_tools(&self) -> Vec<Vec<&'static str>> {
        self.advertised.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// User messages across all requests, deduplicated in first-seen order.
    pub fn user_prompts(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for request in self.requests() {
            for message in request {
                if message.role == loopsmith_core::Role::User && !seen.contains(&message.content) {
                    seen.push(message.content);
                }
            }
        }
        seen
    }

    fn next_reply(&self) -> Result<Message, ModelError> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(Ok(message)) => Ok(message),
            Some(Err(text)) => Err(ModelError::Transport(anyhow::anyhow!(text))),
            None => self.fallback.clone().ok_or(ModelError::NoChoices),
        }
    }
}

impl ChatModel for ScriptedModel {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDefinition],
    ) -> Pin<Box<dyn Future<Output = Result<Message, ModelError>> + Send + 'a>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        if let Ok(mut advertised) = self.advertised.lock() {
            advertised.push(tools.iter().map(|t| t.name).collect());
        }
        let reply = self.next_reply();
        Box::pin(async move { reply })
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// An assistant reply that only requests tools.
pub fn calls(requests: Vec<ToolCallRequest>) -> Message {
    Message::assistant("", requests)
}

/// An assistant reply that ends the turn.
pub fn answer(text: &str) -> Message {
    Message::assistant(text, Vec::new())
}
