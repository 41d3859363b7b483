//! Tool-calling loop for one feedback turn.
//!
//! Sends the conversation to the model, runs any tool calls it requests and
//! feeds the results back, until the model answers in plain text or the hop
//! budget runs out.

use crate::tools::{ToolContext, ToolRegistry};
use loopsmith_adapters::util::truncate;
use loopsmith_core::{ChatModel, ConversationState, Message, ModelError, ToolDefinition};
use std::sync::Arc;

/// Result of a turn that ended with a plain-text answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    pub answer: String,
    /// Request/response round trips used, including the final one.
    pub hops: usize,
    pub tool_calls: usize,
    pub tool_failures: usize,
}

/// Failures that end the current turn. None of them are retried here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned an empty response with no tool calls")]
    EmptyResponse,
    #[error("tool loop exceeded {hops} hops without a final answer")]
    ToolLoopExceeded { hops: usize },
}

pub struct ToolDispatcher {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    catalog: Vec<ToolDefinition>,
    max_hops: usize,
}

impl ToolDispatcher {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        ctx: ToolContext,
        max_hops: usize,
    ) -> Self {
        let catalog = registry.definitions();
        Self {
            model,
            registry,
            ctx: Arc::new(ctx),
            catalog,
            max_hops: max_hops.max(1),
        }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Run one turn: append `instruction`, then alternate model requests and
    /// tool execution until a plain answer arrives.
    pub async fn run_turn(
        &self,
        conversation: &mut ConversationState,
        instruction: &str,
    ) -> Result<TurnResult, DispatchError> {
        conversation.append(Message::user(instruction));

        let mut tool_calls = 0;
        let mut tool_failures = 0;

        for hop in 1..=self.max_hops {
            let request = conversation.snapshot_for_request();
            let reply = self.model.complete(&request, &self.catalog).await?;
            conversation.append(reply.clone());

            if !reply.has_tool_calls() {
                if reply.content.trim().is_empty() {
                    return Err(DispatchError::EmptyResponse);
                }
                return Ok(TurnResult {
                    answer: reply.content,
                    hops: hop,
                    tool_calls,
                    tool_failures,
                });
            }

            // Strictly in order: each result is appended before the next call runs.
            for call in reply.tool_calls {
                tool_calls += 1;
                tracing::info!(hop, tool = %call.name, id = %call.id, "tool call");
                tracing::debug!(arguments = %truncate(&call.arguments, 300), "tool arguments");

                let content = match self.execute(call.name.clone(), call.arguments).await {
                    Ok(output) => output,
                    Err(message) => {
                        tool_failures += 1;
                        tracing::warn!(tool = %call.name, "tool call failed: {message}");
                        message
                    }
                };
                conversation.append(Message::tool_result(call.id, content));
            }
        }

        Err(DispatchError::ToolLoopExceeded {
            hops: self.max_hops,
        })
    }

    /// Run one tool off the async runtime. Failures come back as the text
    /// the model will see.
    async fn execute(&self, name: String, arguments: String) -> Result<String, String> {
        let registry = Arc::clone(&self.registry);
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || {
            registry
                .execute(&ctx, &name, &arguments)
                .map_err(|err| err.to_string())
        })
        .await
        .unwrap_or_else(|join_err| {
            Err(format!(
                "Tool execution failed. Please try again. ({join_err})"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ShellOptions;
    use crate::test_support::{tool_call, ScriptedModel};
    use loopsmith_adapters::Sandbox;
    use loopsmith_core::Role;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn dispatcher(model: Arc<ScriptedModel>, root: &Path, max_hops: usize) -> ToolDispatcher {
        let ctx = ToolContext {
            sandbox: Sandbox::new(root),
            shell: ShellOptions {
                timeout: Duration::from_secs(10),
                allowed_commands: None,
            },
        };
        let registry = Arc::new(ToolRegistry::with_builtin_tools().unwrap());
        ToolDispatcher::new(model, registry, ctx, max_hops)
    }

    #[tokio::test]
    async fn test_plain_answer_ends_turn_after_one_hop() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![Message::assistant("all done", vec![])]));
        let dispatcher = dispatcher(model.clone(), dir.path(), 5);
        let mut conversation = ConversationState::new("sys", 40);

        let result = dispatcher.run_turn(&mut conversation, "hi").await.unwrap();
        assert_eq!(result.answer, "all done");
        assert_eq!(result.hops, 1);
        assert_eq!(result.tool_calls, 0);

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][0].role, Role::System);
        assert_eq!(requests[0][1].content, "hi");
        assert_eq!(model.advertised_tools()[0].len(), 6);
    }

    #[tokio::test]
    async fn test_tool_calls_resolved_in_order_with_matching_ids() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant(
                "",
                vec![
                    tool_call("c1", "create_file", r#"{"path": "a.txt", "content": "X"}"#),
                    tool_call("c2", "read_file", r#"{"path": "a.txt"}"#),
                ],
            ),
            Message::assistant("created", vec![]),
        ]));
        let dispatcher = dispatcher(model.clone(), dir.path(), 5);
        let mut conversation = ConversationState::new("sys", 40);

        let result = dispatcher
            .run_turn(&mut conversation, "make a.txt")
            .await
            .unwrap();
        assert_eq!(result.hops, 2);
        assert_eq!(result.tool_calls, 2);
        assert_eq!(result.tool_failures, 0);

        let second_request = &model.requests()[1];
        let tool_msgs: Vec<_> = second_request
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 2);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("c2"));
        // The read saw the file the preceding call wrote.
        assert_eq!(tool_msgs[1].content, "X");
    }

    #[tokio::test]
    async fn test_tool_failures_are_fed_back_not_raised() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant(
                "",
                vec![
                    tool_call("c1", "read_file", r#"{"path": "../etc/passwd"}"#),
                    tool_call("c2", "teleport", "{}"),
                    tool_call("c3", "create_file", "{not json"),
                ],
            ),
            Message::assistant("recovered", vec![]),
        ]));
        let dispatcher = dispatcher(model.clone(), dir.path(), 5);
        let mut conversation = ConversationState::new("sys", 40);

        let result = dispatcher.run_turn(&mut conversation, "go").await.unwrap();
        assert_eq!(result.answer, "recovered");
        assert_eq!(result.tool_failures, 3);

        let contents: Vec<_> = conversation
            .history()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect();
        assert!(contents[0].starts_with("Invalid path"));
        assert!(contents[1].starts_with("Unknown tool: teleport"));
        assert!(contents[2].starts_with("Invalid arguments"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_shell_command_does_not_end_turn() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            Message::assistant(
                "",
                vec![tool_call(
                    "c1",
                    "run_shell",
                    r#"{"command": "echo 'permission denied' >&2; exit 1"}"#,
                )],
            ),
            Message::assistant("saw the failure", vec![]),
        ]));
        let dispatcher = dispatcher(model, dir.path(), 5);
        let mut conversation = ConversationState::new("sys", 40);

        let result = dispatcher.run_turn(&mut conversation, "run").await.unwrap();
        assert_eq!(result.answer, "saw the failure");
        assert_eq!(result.tool_failures, 0);
        let tool_output = conversation
            .history()
            .find(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .unwrap();
        assert!(tool_output.contains("permission denied"));
        assert!(tool_output.contains("[exit code: 1]"));
    }

    #[tokio::test]
    async fn test_hop_budget_is_never_exceeded() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::repeating(Message::assistant(
            "",
            vec![tool_call("loop", "list_files", "{}")],
        )));
        let dispatcher = dispatcher(model.clone(), dir.path(), 3);
        let mut conversation = ConversationState::new("sys", 40);

        let err = dispatcher.run_turn(&mut conversation, "spin").await.unwrap_err();
        assert!(matches!(err, DispatchError::ToolLoopExceeded { hops: 3 }));
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_reply_is_a_protocol_violation() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![Message::assistant("  ", vec![])]));
        let dispatcher = dispatcher(model, dir.path(), 3);
        let mut conversation = ConversationState::new("sys", 40);

        let err = dispatcher.run_turn(&mut conversation, "hi").await.unwrap_err();
        assert!(matches!(err, DispatchError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_model_errors_propagate() {
        let dir = tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![]));
        let dispatcher = dispatcher(model, dir.path(), 3);
        let mut conversation = ConversationState::new("sys", 40);

        let err = dispatcher.run_turn(&mut conversation, "hi").await.unwrap_err();
        assert!(matches!(err, DispatchError::Model(ModelError::NoChoices)));
    }
}
