//! Tool catalog and dispatch registry.
//!
//! The catalog is what the model sees; the registry maps each advertised name
//! to the handler that runs it. The two are checked against each other when
//! the registry is built, so a tool can never be advertised without a handler.

use crate::capabilities::{self, MatchMode, ShellOptions, UpdateOutcome, EMPTY_LISTING};
use loopsmith_adapters::{PathError, Sandbox};
use loopsmith_core::{ParamSpec, ToolDefinition};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

// ═══════════════════════════════════════════════════════════════════════════
//  ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Everything a tool call can fail with. Always recoverable: the rendered
/// message goes back to the model as the tool result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Failed to execute command: {0}")]
    Spawn(String),
    #[error("Command blocked: {0}")]
    Blocked(String),
}

impl ToolError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        ToolError::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CATALOG
// ═══════════════════════════════════════════════════════════════════════════

pub const CREATE_FILE: &str = "create_file";
pub const APPEND_FILE: &str = "append_file";
pub const UPDATE_FILE: &str = "update_file";
pub const READ_FILE: &str = "read_file";
pub const LIST_FILES: &str = "list_files";
pub const RUN_SHELL: &str = "run_shell";

const PATH_HINT: &str = "Path relative to the project root, e.g. `src/app.py`";

/// Capability descriptors advertised to the model, in presentation order.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: CREATE_FILE,
            description: "Create a file with the given content, overwriting it if it exists. \
                          Parent directories are created as needed.",
            params: vec![
                ParamSpec::required("path", PATH_HINT),
                ParamSpec::required("content", "Full file content"),
            ],
        },
        ToolDefinition {
            name: APPEND_FILE,
            description: "Append content to the end of a file, creating it if missing.",
            params: vec![
                ParamSpec::required("path", PATH_HINT),
                ParamSpec::required("content", "Text to append"),
            ],
        },
        ToolDefinition {
            name: UPDATE_FILE,
            description: "Replace every occurrence of `find` in an existing file. \
                          mode=auto treats `find` as a regex when it compiles and as \
                          literal text otherwise; the result says which ran. `replace` \
                          is inserted as-is, except with mode=regex where `$1` refers \
                          to capture groups.",
            params: vec![
                ParamSpec::required("path", PATH_HINT),
                ParamSpec::required("find", "Text or regex to search for"),
                ParamSpec::optional("replace", "Replacement text (empty deletes matches)"),
                ParamSpec::optional("mode", "How to interpret `find` (default: auto)")
                    .with_choices(MatchMode::CHOICES),
            ],
        },
        ToolDefinition {
            name: READ_FILE,
            description: "Read a file and return its content verbatim.",
            params: vec![ParamSpec::required("path", PATH_HINT)],
        },
        ToolDefinition {
            name: LIST_FILES,
            description: "Recursively list regular files, relative to the project root.",
            params: vec![ParamSpec::optional(
                "path",
                "Sub-directory to list (default: the project root)",
            )],
        },
        ToolDefinition {
            name: RUN_SHELL,
            description: "Run a shell command in the project root and return its combined \
                          stdout/stderr. A non-zero exit status is reported in the output.",
            params: vec![ParamSpec::required("command", "Shell command line to execute")],
        },
    ]
}

// ═══════════════════════════════════════════════════════════════════════════
//  ARGUMENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Decoded tool-call arguments: an untyped key→value mapping.
#[derive(Debug, Clone, Default)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    /// Decode the raw JSON text the model sent. Empty text means no arguments.
    pub fn decode(raw: &str) -> Result<Self, ToolError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(ToolError::InvalidArguments(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(err) => Err(ToolError::InvalidArguments(format!(
                "arguments are not valid JSON: {err}"
            ))),
        }
    }

    /// Check every required parameter is a non-blank string and every
    /// supplied parameter is one the tool declares.
    pub fn validate(&self, definition: &ToolDefinition) -> Result<(), ToolError> {
        for name in definition.required_params() {
            match self.0.get(name) {
                None | Some(Value::Null) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required parameter '{name}'"
                    )))
                }
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(ToolError::InvalidArguments(format!(
                        "parameter '{name}' must not be blank"
                    )))
                }
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(ToolError::InvalidArguments(format!(
                        "parameter '{name}' must be a string, got {}",
                        json_kind(other)
                    )))
                }
            }
        }
        if let Some(unknown) = self
            .0
            .keys()
            .find(|key| !definition.params.iter().any(|p| p.name == key.as_str()))
        {
            return Err(ToolError::InvalidArguments(format!(
                "unexpected parameter '{unknown}' for {}",
                definition.name
            )));
        }
        Ok(())
    }

    /// A string parameter that [`ToolArgs::validate`] already checked.
    pub fn required(&self, name: &str) -> Result<&str, ToolError> {
        self.optional(name)?.ok_or_else(|| {
            ToolError::InvalidArguments(format!("missing required parameter '{name}'"))
        })
    }

    pub fn optional(&self, name: &str) -> Result<Option<&str>, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "parameter '{name}' must be a string, got {}",
                json_kind(other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  HANDLERS
// ═══════════════════════════════════════════════════════════════════════════

/// Shared state every handler runs against.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub sandbox: Sandbox,
    pub shell: ShellOptions,
}

pub trait ToolHandler: Send + Sync {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError>;
}

struct CreateFile;
struct AppendFile;
struct UpdateFile;
struct ReadFile;
struct ListFiles;
struct RunShell;

impl ToolHandler for CreateFile {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let path = args.required("path")?;
        let target = ctx.sandbox.resolve(path)?;
        let write = capabilities::create_file(&target, args.required("content")?)?;
        Ok(format!("File created: {} ({} bytes)", path, write.bytes))
    }
}

impl ToolHandler for AppendFile {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let path = args.required("path")?;
        let target = ctx.sandbox.resolve(path)?;
        let write = capabilities::append_file(&target, args.required("content")?)?;
        Ok(format!("Appended to: {} ({} bytes)", path, write.bytes))
    }
}

impl ToolHandler for UpdateFile {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let path = args.required("path")?;
        let mode = MatchMode::parse(args.optional("mode")?)?;
        let target = ctx.sandbox.resolve(path)?;
        let outcome = capabilities::update_file(
            &target,
            args.required("find")?,
            args.optional("replace")?.unwrap_or_default(),
            mode,
        )?;
        Ok(match outcome {
            UpdateOutcome::Updated { mode, replacements } => format!(
                "File updated: {path} ({replacements} replacement(s), {mode} match)"
            ),
            UpdateOutcome::Unchanged { mode } => format!(
                "No changes: pattern not found in {path} ({mode} match). The file was left as is."
            ),
        })
    }
}

impl ToolHandler for ReadFile {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let target = ctx.sandbox.resolve(args.required("path")?)?;
        capabilities::read_file(&target)
    }
}

impl ToolHandler for ListFiles {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let dir = ctx.sandbox.resolve_dir(args.optional("path")?)?;
        let files = capabilities::list_files(ctx.sandbox.root(), &dir)?;
        if files.is_empty() {
            return Ok(EMPTY_LISTING.to_string());
        }
        Ok(files.join("\n"))
    }
}

impl ToolHandler for RunShell {
    fn execute(&self, ctx: &ToolContext, args: &ToolArgs) -> Result<String, ToolError> {
        let output =
            capabilities::run_shell(ctx.sandbox.root(), args.required("command")?, &ctx.shell)?;
        Ok(output.head())
    }
}

fn builtin_handler(name: &str) -> Option<Box<dyn ToolHandler>> {
    let handler: Box<dyn ToolHandler> = match name {
        CREATE_FILE => Box::new(CreateFile),
        APPEND_FILE => Box::new(AppendFile),
        UPDATE_FILE => Box::new(UpdateFile),
        READ_FILE => Box::new(ReadFile),
        LIST_FILES => Box::new(ListFiles),
        RUN_SHELL => Box::new(RunShell),
        _ => return None,
    };
    Some(handler)
}

// ═══════════════════════════════════════════════════════════════════════════
//  REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Box<dyn ToolHandler>,
}

/// Maps tool names to their definition and handler.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one handler for every entry of [`tool_definitions`].
    pub fn with_builtin_tools() -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for definition in tool_definitions() {
            let handler = builtin_handler(definition.name).ok_or_else(|| {
                anyhow::anyhow!("no handler for advertised tool '{}'", definition.name)
            })?;
            registry.register(definition, handler)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Box<dyn ToolHandler>,
    ) -> anyhow::Result<()> {
        if self.by_name.contains_key(definition.name) {
            anyhow::bail!("tool '{}' is already registered", definition.name);
        }
        self.by_name.insert(definition.name, self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            handler,
        });
        Ok(())
    }

    /// The catalog to advertise, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.iter().map(|t| t.definition.name)
    }

    /// Decode, validate and run one tool call.
    pub fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        raw_arguments: &str,
    ) -> Result<String, ToolError> {
        let tool = self
            .by_name
            .get(name)
            .map(|&idx| &self.tools[idx])
            .ok_or_else(|| ToolError::UnknownTool(format!("{name}. Available: {}", self.available())))?;
        let args = ToolArgs::decode(raw_arguments)?;
        args.validate(&tool.definition)?;
        tool.handler.execute(ctx, &args)
    }

    fn available(&self) -> String {
        self.names().collect::<Vec<_>>().join(", ")
    }
}
