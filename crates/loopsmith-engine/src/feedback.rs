//! Outer feedback loop: run a turn, verify with the project's tests, and
//! either stop or hand the failures back to the model.

use crate::capabilities::{run_shell, ShellOptions};
use crate::llm::agentic::ToolDispatcher;
use loopsmith_adapters::util::truncate;
use loopsmith_adapters::AgentConfig;
use loopsmith_core::{ConversationState, Task, TestClassification, TestOutcome};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Decides whether a test run passed from its captured output.
pub trait OutcomeClassifier: Send + Sync {
    fn classify(&self, raw_output: &str) -> TestClassification;
}

/// Case-insensitive marker search tuned for pytest-style summaries.
///
/// Passed needs no failure marker and at least one success or "nothing to
/// run" marker. Everything else is Failed.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    pub failure_markers: Vec<String>,
    pub success_markers: Vec<String>,
    pub no_tests_markers: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            failure_markers: owned(&["failed", "error"]),
            success_markers: owned(&["passed"]),
            no_tests_markers: owned(&["no tests ran", "no tests collected", "collected 0 items"]),
        }
    }
}

impl OutcomeClassifier for KeywordClassifier {
    fn classify(&self, raw_output: &str) -> TestClassification {
        let text = raw_output.to_lowercase();
        let has = |markers: &[String]| markers.iter().any(|m| text.contains(m.as_str()));

        if has(&self.failure_markers) {
            return TestClassification::Failed;
        }
        if has(&self.success_markers) || has(&self.no_tests_markers) {
            TestClassification::Passed
        } else {
            TestClassification::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackSettings {
    pub max_turns: usize,
    /// Relative to the sandbox root. Its presence turns verification on.
    pub tests_dir: String,
    pub test_command: String,
    pub test_timeout: Duration,
    pub retry_pause: Duration,
}

impl FeedbackSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_turns: config.max_turns,
            tests_dir: config.tests_dir.clone(),
            test_command: config.test_command.clone(),
            test_timeout: config.test_timeout(),
            retry_pause: config.retry_pause(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    /// Every turn in the budget ended with failing tests.
    Exhausted,
    /// A dispatcher failure ended the run early.
    Aborted(String),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Done => f.write_str("done"),
            RunOutcome::Exhausted => f.write_str("turn budget exhausted"),
            RunOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub turns: usize,
    pub last_test: Option<TestOutcome>,
    pub last_answer: Option<String>,
}

impl RunReport {
    /// 0 when the task finished, 1 when it ended incomplete.
    pub fn completion_status(&self) -> i32 {
        match self.outcome {
            RunOutcome::Done => 0,
            RunOutcome::Exhausted | RunOutcome::Aborted(_) => 1,
        }
    }
}

pub struct FeedbackController {
    conversation: ConversationState,
    dispatcher: ToolDispatcher,
    classifier: Box<dyn OutcomeClassifier>,
    settings: FeedbackSettings,
}

impl FeedbackController {
    pub fn new(
        conversation: ConversationState,
        dispatcher: ToolDispatcher,
        settings: FeedbackSettings,
    ) -> Self {
        Self {
            conversation,
            dispatcher,
            classifier: Box::new(KeywordClassifier::default()),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn OutcomeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub async fn run(&mut self, instruction: &str) -> RunReport {
        tracing::info!(task = %truncate(instruction, 200), "starting task");
        let mut task = Task::initial(instruction, self.settings.max_turns.max(1));
        let mut last_test = None;
        let mut last_answer = None;

        loop {
            tracing::info!(turn = task.turn, budget = task.budget, "turn start");

            match self
                .dispatcher
                .run_turn(&mut self.conversation, &task.instruction)
                .await
            {
                Ok(result) => {
                    tracing::info!(
                        hops = result.hops,
                        tool_calls = result.tool_calls,
                        "model finished turn"
                    );
                    tracing::debug!(answer = %result.answer);
                    last_answer = Some(result.answer);
                }
                Err(err) => {
                    tracing::error!(turn = task.turn, "turn failed: {err}");
                    return RunReport {
                        outcome: RunOutcome::Aborted(err.to_string()),
                        turns: task.turn,
                        last_test,
                        last_answer,
                    };
                }
            }

            let tests_path = self.tests_path();
            if !tests_path.exists() {
                tracing::info!(path = %tests_path.display(), "no tests found, task complete");
                return RunReport {
                    outcome: RunOutcome::Done,
                    turns: task.turn,
                    last_test,
                    last_answer,
                };
            }

            let outcome = self.run_tests().await;
            tracing::info!(classification = ?outcome.classification, "test run finished");
            tracing::debug!(output = %outcome.raw_output);

            let next_instruction = match outcome.classification {
                TestClassification::Passed => {
                    tracing::info!("all tests passed");
                    return RunReport {
                        outcome: RunOutcome::Done,
                        turns: task.turn,
                        last_test: Some(outcome),
                        last_answer,
                    };
                }
                TestClassification::Failed => failure_instruction(&outcome.raw_output, instruction),
                TestClassification::Indeterminate => {
                    setup_failure_instruction(&outcome.raw_output, instruction)
                }
            };
            last_test = Some(outcome);

            if task.is_last() {
                tracing::warn!(turns = task.turn, "turn budget exhausted with failing tests");
                return RunReport {
                    outcome: RunOutcome::Exhausted,
                    turns: task.turn,
                    last_test,
                    last_answer,
                };
            }

            tracing::info!("tests failed, asking for fixes");
            if !self.settings.retry_pause.is_zero() {
                tokio::time::sleep(self.settings.retry_pause).await;
            }
            task = task.next(next_instruction);
        }
    }

    fn tests_path(&self) -> PathBuf {
        self.dispatcher
            .context()
            .sandbox
            .root()
            .join(&self.settings.tests_dir)
    }

    /// Run the test command without the allow-list. Timeouts and spawn
    /// failures come back as `Indeterminate`.
    async fn run_tests(&self) -> TestOutcome {
        let root = self.dispatcher.context().sandbox.root().to_path_buf();
        let command = self.settings.test_command.clone();
        let options = ShellOptions {
            timeout: self.settings.test_timeout,
            allowed_commands: None,
        };
        tracing::info!(command = %command, "running tests");

        let run = tokio::task::spawn_blocking(move || run_shell(&root, &command, &options)).await;
        match run {
            Ok(Ok(output)) if output.timed_out => TestOutcome {
                raw_output: output.tail(),
                classification: TestClassification::Indeterminate,
            },
            // Classify the whole output; only the tail is kept for the next prompt.
            Ok(Ok(output)) => TestOutcome {
                classification: self.classifier.classify(&output.text),
                raw_output: output.tail(),
            },
            Ok(Err(err)) => TestOutcome {
                raw_output: err.to_string(),
                classification: TestClassification::Indeterminate,
            },
            Err(join_err) => TestOutcome {
                raw_output: format!("Test command did not complete: {join_err}"),
                classification: TestClassification::Indeterminate,
            },
        }
    }
}

pub fn failure_instruction(test_output: &str, original_task: &str) -> String {
    format!(
        "Tests failed. Here is the output:\n{test_output}\n\
         Please fix the errors. Original task: {original_task}"
    )
}

pub fn setup_failure_instruction(test_output: &str, original_task: &str) -> String {
    format!(
        "The test command failed to run to completion. Here is the output:\n{test_output}\n\
         Please check the test setup or fix the code based on this. Original task: {original_task}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_classifier_on_pytest_summaries() {
        let classifier = KeywordClassifier::default();
        let cases = [
            ("3 passed in 0.02s", TestClassification::Passed),
            ("1 failed, 2 passed in 0.10s", TestClassification::Failed),
            ("E   AssertionError: boom\n1 error in 0.01s", TestClassification::Failed),
            ("no tests ran in 0.01s\n[exit code: 5]", TestClassification::Passed),
            ("collected 0 items", TestClassification::Passed),
            ("ALL PASSED", TestClassification::Passed),
            ("Command completed with exit code 0", TestClassification::Failed),
            ("", TestClassification::Failed),
        ];
        for (output, expected) in cases {
            assert_eq!(classifier.classify(output), expected, "output: {output:?}");
        }
    }

    #[test]
    fn test_custom_markers_replace_defaults() {
        let classifier = KeywordClassifier {
            failure_markers: vec!["FAIL".to_string()],
            success_markers: vec!["ok".to_string()],
            no_tests_markers: Vec::new(),
        };
        assert_eq!(
            classifier.classify("test result: ok. 4 passed"),
            TestClassification::Passed
        );
        assert_eq!(
            classifier.classify("test foo ... FAIL"),
            TestClassification::Failed
        );
    }

    #[test]
    fn test_retry_instructions_embed_output_and_task() {
        let failed = failure_instruction("1 failed", "write fib");
        assert!(failed.contains("1 failed"));
        assert!(failed.ends_with("Original task: write fib"));

        let setup = setup_failure_instruction("sh: pytest: not found", "write fib");
        assert!(setup.contains("sh: pytest: not found"));
        assert!(setup.contains("test setup"));
        assert!(setup.ends_with("Original task: write fib"));
    }

    #[test]
    fn test_completion_status() {
        let report = |outcome| RunReport {
            outcome,
            turns: 1,
            last_test: None,
            last_answer: None,
        };
        assert_eq!(report(RunOutcome::Done).completion_status(), 0);
        assert_eq!(report(RunOutcome::Exhausted).completion_status(), 1);
        assert_eq!(
            report(RunOutcome::Aborted("x".to_string())).completion_status(),
            1
        );
    }

    #[test]
    fn test_settings_follow_config() {
        let config = AgentConfig::default();
        let settings = FeedbackSettings::from_config(&config);
        assert_eq!(settings.max_turns, config.max_turns);
        assert_eq!(settings.tests_dir, "tests");
        assert_eq!(settings.test_timeout, Duration::from_secs(600));
    }
}
