//! File and process capabilities offered to the model.
//!
//! Every function here takes paths that already went through
//! [`Sandbox`](loopsmith_adapters::Sandbox) resolution. Failures come back as
//! [`ToolError`] so the dispatcher can hand them to the model as text.

use crate::tools::ToolError;
use loopsmith_adapters::util::{run_command_with_timeout, truncate_at_line, truncate_tail_at_line};
use regex::{NoExpand, Regex};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use walkdir::WalkDir;

/// Rendered by `list_files` when the tree holds no regular files.
pub const EMPTY_LISTING: &str = "(no files)";

/// Shell output beyond this is cut at a line boundary (16 KB ≈ 4k tokens).
pub const MAX_SHELL_OUTPUT: usize = 16 * 1024;

const TRUNCATION_MARKER: &str = "... (output truncated)";

/// Shell metacharacters that would let a command slip past an allow-list.
const DANGEROUS_SHELL_CHARS: &[char] = &['`', '$', ';', '&', '\n', '>', '<'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: PathBuf,
    pub bytes: usize,
}

pub fn create_file(target: &Path, content: &str) -> Result<FileWrite, ToolError> {
    ensure_parent(target)?;
    fs::write(target, content).map_err(|e| ToolError::io("write", target, e))?;
    Ok(FileWrite {
        path: target.to_path_buf(),
        bytes: content.len(),
    })
}

pub fn append_file(target: &Path, content: &str) -> Result<FileWrite, ToolError> {
    ensure_parent(target)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .map_err(|e| ToolError::io("open for appending", target, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| ToolError::io("append to", target, e))?;
    Ok(FileWrite {
        path: target.to_path_buf(),
        bytes: content.len(),
    })
}

pub fn read_file(target: &Path) -> Result<String, ToolError> {
    fs::read_to_string(target).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ToolError::NotFound(target.display().to_string()),
        _ => ToolError::io("read", target, e),
    })
}

fn ensure_parent(target: &Path) -> Result<(), ToolError> {
    match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|e| ToolError::io("create directory", parent, e)),
        _ => Ok(()),
    }
}

/// How `update_file` interprets its `find` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Regex when `find` compiles as one, literal text otherwise.
    #[default]
    Auto,
    Regex,
    Literal,
}

impl MatchMode {
    pub const CHOICES: &'static [&'static str] = &["auto", "regex", "literal"];

    pub fn parse(raw: Option<&str>) -> Result<Self, ToolError> {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("auto") => Ok(MatchMode::Auto),
            Some("regex") => Ok(MatchMode::Regex),
            Some("literal") => Ok(MatchMode::Literal),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "unknown mode '{other}', expected one of: {}",
                Self::CHOICES.join(", ")
            ))),
        }
    }
}

/// The interpretation that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedMode {
    Regex,
    Literal,
}

impl fmt::Display for AppliedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppliedMode::Regex => write!(f, "regex"),
            AppliedMode::Literal => write!(f, "literal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated {
        mode: AppliedMode,
        replacements: usize,
    },
    /// Nothing matched, or every match was replaced by identical text.
    /// The file is left untouched.
    Unchanged { mode: AppliedMode },
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, UpdateOutcome::Updated { .. })
    }
}

pub fn update_file(
    target: &Path,
    find: &str,
    replace: &str,
    mode: MatchMode,
) -> Result<UpdateOutcome, ToolError> {
    let original = read_file(target)?;

    let pattern = match mode {
        MatchMode::Literal => None,
        MatchMode::Auto => Regex::new(find).ok(),
        MatchMode::Regex => Some(Regex::new(find).map_err(|e| {
            ToolError::InvalidArguments(format!("find is not a valid regex: {e}"))
        })?),
    };

    let (updated, applied, replacements) = match pattern {
        Some(re) => {
            let count = re.find_iter(&original).count();
            // Capture references like `$1` only expand when regex mode was asked for.
            let out = if mode == MatchMode::Regex {
                re.replace_all(&original, replace).into_owned()
            } else {
                re.replace_all(&original, NoExpand(replace)).into_owned()
            };
            (out, AppliedMode::Regex, count)
        }
        None => {
            let count = original.matches(find).count();
            (original.replace(find, replace), AppliedMode::Literal, count)
        }
    };

    if updated == original {
        return Ok(UpdateOutcome::Unchanged { mode: applied });
    }

    fs::write(target, updated).map_err(|e| ToolError::io("write", target, e))?;
    Ok(UpdateOutcome::Updated {
        mode: applied,
        replacements,
    })
}

/// Regular files under `dir`, relative to `root`, in sorted traversal order.
///
/// Directories that deny access are skipped; any other walk error aborts.
pub fn list_files(root: &Path, dir: &Path) -> Result<Vec<String>, ToolError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let kind = err.io_error().map(|io| io.kind());
                match kind {
                    Some(ErrorKind::PermissionDenied) => continue,
                    Some(ErrorKind::NotFound) if err.depth() == 0 => {
                        return Err(ToolError::NotFound(dir.display().to_string()))
                    }
                    _ => {
                        let at = err.path().unwrap_or(dir).to_path_buf();
                        return Err(ToolError::Io {
                            action: "list",
                            path: at.display().to_string(),
                            source: err.into(),
                        });
                    }
                }
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        files.push(
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        );
    }
    Ok(files)
}

/// Limits applied at the single shell entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    pub timeout: Duration,
    /// Base commands allowed to run. `None` runs anything.
    pub allowed_commands: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Full captured output with exit status or timeout folded in.
    pub text: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ShellOutput {
    /// The first [`MAX_SHELL_OUTPUT`] bytes, cut at a line boundary.
    pub fn head(&self) -> String {
        truncate_at_line(self.text.clone(), MAX_SHELL_OUTPUT, TRUNCATION_MARKER)
    }

    /// The last [`MAX_SHELL_OUTPUT`] bytes, where test runners put their summary.
    pub fn tail(&self) -> String {
        truncate_tail_at_line(self.text.clone(), MAX_SHELL_OUTPUT, TRUNCATION_MARKER)
    }
}

/// Run `command` through the platform shell with `root` as working directory.
///
/// A non-zero exit is not an error here: the status is folded into the text.
/// Only a failure to spawn, or a command rejected by the allow-list, is.
pub fn run_shell(root: &Path, command: &str, options: &ShellOptions) -> Result<ShellOutput, ToolError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ToolError::InvalidArguments("missing command".to_string()));
    }
    if let Some(allowed) = &options.allowed_commands {
        check_allowed(command, allowed)?;
    }

    let mut cmd = shell_command(command);
    cmd.current_dir(root);

    let run = run_command_with_timeout(&mut cmd, options.timeout)
        .map_err(|e| ToolError::Spawn(e.to_string()))?;

    let mut text = run.combined_output();
    let exit_code = run.exit_code();
    tracing::debug!(
        exit_code = ?exit_code,
        timed_out = run.timed_out,
        elapsed_ms = run.elapsed.as_millis() as u64,
        "shell command finished"
    );
    if run.timed_out {
        text = format!(
            "Command timed out after {} seconds\n{}",
            options.timeout.as_secs(),
            text
        );
    } else if text.trim().is_empty() {
        text = format!(
            "Command completed with exit code {}",
            exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );
    } else if !run.success() {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        match exit_code {
            Some(code) => text.push_str(&format!("[exit code: {code}]")),
            None => text.push_str("[terminated by signal]"),
        }
    }

    Ok(ShellOutput {
        text,
        exit_code,
        timed_out: run.timed_out,
    })
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

fn check_allowed(command: &str, allowed: &[String]) -> Result<(), ToolError> {
    if command.chars().any(|c| DANGEROUS_SHELL_CHARS.contains(&c)) {
        return Err(ToolError::Blocked(
            "contains shell metacharacters (backticks, $, ;, &, <, > or newlines); \
             only pipes (|) may chain allowed commands"
                .to_string(),
        ));
    }
    for part in command.split('|').map(str::trim).filter(|p| !p.is_empty()) {
        let base = part.split_whitespace().next().unwrap_or_default();
        if !allowed.iter().any(|a| a == base) {
            return Err(ToolError::Blocked(format!(
                "'{}' is not in the allow-list. Allowed commands: {}",
                base,
                allowed.join(", ")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn unrestricted() -> ShellOptions {
        ShellOptions {
            timeout: Duration::from_secs(10),
            allowed_commands: None,
        }
    }

    #[test]
    fn test_create_then_read_returns_exact_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/deeper/a.txt");
        for content in ["", "X", "line1\nline2\r\n", "ünïcødé ✓", "$1 (.*) \\d"] {
            let write = create_file(&target, content).unwrap();
            assert_eq!(write.bytes, content.len());
            assert_eq!(read_file(&target).unwrap(), content);
        }
    }

    #[test]
    fn test_append_creates_missing_file_and_parents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("logs/out.txt");
        append_file(&target, "one\n").unwrap();
        append_file(&target, "two\n").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_read_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_file(&dir.path().join("nope.txt")).unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(err.to_string().starts_with("File not found"));
    }

    #[test]
    fn test_update_auto_uses_regex_when_pattern_compiles() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("main.py");
        fs::write(&target, "x = 1\ny = 22\n").unwrap();

        let outcome = update_file(&target, r"\d+", "N", MatchMode::Auto).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                mode: AppliedMode::Regex,
                replacements: 2
            }
        );
        assert_eq!(fs::read_to_string(&target).unwrap(), "x = N\ny = N\n");
    }

    #[test]
    fn test_update_auto_keeps_dollar_signs_in_replacement() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("run.sh");
        fs::write(&target, "echo PLACEHOLDER\n").unwrap();

        let outcome = update_file(&target, "PLACEHOLDER", "$HOME/bin ${PATH} $1", MatchMode::Auto)
            .unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                mode: AppliedMode::Regex,
                replacements: 1
            }
        );
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "echo $HOME/bin ${PATH} $1\n"
        );
    }

    #[test]
    fn test_update_regex_mode_expands_capture_groups() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.txt");
        fs::write(&target, "name=alice name=bob").unwrap();
        update_file(&target, r"name=(\w+)", "user:$1", MatchMode::Regex).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "user:alice user:bob");
    }

    #[test]
    fn test_update_auto_falls_back_to_literal_for_invalid_pattern() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.py");
        fs::write(&target, "call(a, b\ncall(a, b\n").unwrap();

        let outcome = update_file(&target, "call(a, b", "call(a, b)", MatchMode::Auto).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                mode: AppliedMode::Literal,
                replacements: 2
            }
        );
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "call(a, b)\ncall(a, b)\n"
        );
    }

    #[test]
    fn test_update_literal_mode_does_not_interpret_metacharacters() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.txt");
        fs::write(&target, "a.b axb").unwrap();
        let outcome = update_file(&target, "a.b", "c", MatchMode::Literal).unwrap();
        assert!(outcome.changed());
        assert_eq!(fs::read_to_string(&target).unwrap(), "c axb");
    }

    #[test]
    fn test_update_without_match_is_unchanged_and_bytes_preserved() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("keep.txt");
        let original = b"alpha\nbeta\n";
        fs::write(&target, original).unwrap();

        for find in ["gamma", "[unclosed", "^zzz$"] {
            let outcome = update_file(&target, find, "x", MatchMode::Auto).unwrap();
            assert!(!outcome.changed(), "{find} should not change the file");
            assert_eq!(fs::read(&target).unwrap(), original);
        }
    }

    #[test]
    fn test_update_regex_mode_rejects_invalid_pattern() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f.txt");
        fs::write(&target, "text").unwrap();
        let err = update_file(&target, "(", "x", MatchMode::Regex).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_update_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = update_file(&dir.path().join("absent"), "a", "b", MatchMode::Auto).unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn test_match_mode_parse() {
        assert_eq!(MatchMode::parse(None).unwrap(), MatchMode::Auto);
        assert_eq!(MatchMode::parse(Some("Literal")).unwrap(), MatchMode::Literal);
        assert!(MatchMode::parse(Some("glob")).is_err());
    }

    #[test]
    fn test_list_files_relative_sorted_and_sentinel_free() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/util")).unwrap();
        fs::write(dir.path().join("src/util/b.rs"), "").unwrap();
        fs::write(dir.path().join("src/a.rs"), "").unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();

        let files = list_files(dir.path(), dir.path()).unwrap();
        assert_eq!(files, vec!["README.md", "src/a.rs", "src/util/b.rs"]);

        let sub = list_files(dir.path(), &dir.path().join("src/util")).unwrap();
        assert_eq!(sub, vec!["src/util/b.rs"]);
    }

    #[test]
    fn test_list_files_empty_tree_and_missing_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("empty/inner")).unwrap();
        assert!(list_files(dir.path(), dir.path()).unwrap().is_empty());
        assert!(matches!(
            list_files(dir.path(), &dir.path().join("missing")),
            Err(ToolError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_files_through_a_regular_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();

        let err = list_files(dir.path(), &dir.path().join("a.txt/sub")).unwrap_err();
        assert!(matches!(err, ToolError::Io { action: "list", .. }));
        assert!(err.to_string().starts_with("Failed to list "));
        assert!(err.to_string().contains("a.txt/sub"));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_files_skips_unreadable_directories() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("secret.txt"), "").unwrap();
        fs::write(dir.path().join("open.txt"), "").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let result = list_files(dir.path(), dir.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let files = result.unwrap();
        assert!(files.contains(&"open.txt".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_folds_nonzero_exit_into_output() {
        let dir = tempdir().unwrap();
        let out = run_shell(
            dir.path(),
            "echo 'permission denied' >&2; exit 126",
            &unrestricted(),
        )
        .unwrap();
        assert_eq!(out.exit_code, Some(126));
        assert!(out.text.contains("permission denied"));
        assert!(out.text.contains("[exit code: 126]"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_uses_root_as_working_directory() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = run_shell(dir.path(), "ls", &unrestricted()).unwrap();
        assert!(out.text.contains("marker.txt"));
        assert_eq!(out.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_keeps_full_text_and_offers_head_and_tail() {
        let dir = tempdir().unwrap();
        let out = run_shell(
            dir.path(),
            "i=0; while [ $i -lt 2000 ]; do echo ..........; i=$((i+1)); done; echo '20000 passed'",
            &unrestricted(),
        )
        .unwrap();
        assert!(out.text.len() > MAX_SHELL_OUTPUT);
        assert!(out.text.ends_with("20000 passed\n"));

        let head = out.head();
        assert!(head.starts_with(".........."));
        assert!(head.ends_with(TRUNCATION_MARKER));
        assert!(!head.contains("passed"));

        let tail = out.tail();
        assert!(tail.starts_with(TRUNCATION_MARKER));
        assert!(tail.ends_with("20000 passed\n"));
        assert!(tail.len() <= MAX_SHELL_OUTPUT + TRUNCATION_MARKER.len() + 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_reports_silent_success() {
        let dir = tempdir().unwrap();
        let out = run_shell(dir.path(), "true", &unrestricted()).unwrap();
        assert_eq!(out.text, "Command completed with exit code 0");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_shell_timeout_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let options = ShellOptions {
            timeout: Duration::from_millis(200),
            allowed_commands: None,
        };
        let out = run_shell(dir.path(), "sleep 5", &options).unwrap();
        assert!(out.timed_out);
        assert!(out.text.starts_with("Command timed out after"));
    }

    #[test]
    fn test_allow_list_blocks_unlisted_and_metacharacters() {
        let dir = tempdir().unwrap();
        let options = ShellOptions {
            timeout: Duration::from_secs(5),
            allowed_commands: Some(vec!["ls".to_string(), "grep".to_string()]),
        };
        assert!(matches!(
            run_shell(dir.path(), "rm -rf .", &options),
            Err(ToolError::Blocked(_))
        ));
        assert!(matches!(
            run_shell(dir.path(), "ls; rm x", &options),
            Err(ToolError::Blocked(_))
        ));
        assert!(matches!(
            run_shell(dir.path(), "ls | wc -l", &options),
            Err(ToolError::Blocked(_))
        ));
        assert!(check_allowed("ls -la | grep foo", &["ls".into(), "grep".into()]).is_ok());
    }
}
