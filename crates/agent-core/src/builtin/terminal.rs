//! Sandboxed terminal tool
//!
//! Runs a small set of read-only commands inside a workspace directory.
//! Commands are executed directly (no shell), so pipes, redirects and
//! globbing are not available. `cd` is handled by the tool itself and can
//! never leave the workspace root.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};
use crate::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};

/// Commands the tool will run
pub const ALLOWED_COMMANDS: &[&str] = &[
    "cat", "cd", "cut", "df", "du", "echo", "egrep", "fgrep", "file", "find", "grep", "head",
    "ls", "pwd", "sort", "stat", "tail", "tree", "uniq", "wc", "whereis", "which",
];

/// `find` arguments that modify the filesystem, spawn processes or follow symlinks
const FORBIDDEN_FIND_ARGS: &[&str] = &[
    "-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls", "-L",
    "-follow",
];

pub struct TerminalTool {
    workspace: PathBuf,
    current_dir: RwLock<PathBuf>,
    timeout: Duration,
    max_output_bytes: usize,
    allow_cd: bool,
}

impl TerminalTool {
    /// Create the tool rooted at `workspace`, creating the directory if needed
    pub fn new(workspace: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(workspace.as_ref())?;
        let workspace = workspace.as_ref().canonicalize()?;
        Ok(Self {
            current_dir: RwLock::new(workspace.clone()),
            workspace,
            timeout: Duration::from_secs(30),
            max_output_bytes: 10 * 1024 * 1024,
            allow_cd: true,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_cd(mut self, allow: bool) -> Self {
        self.allow_cd = allow;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub async fn current_dir(&self) -> PathBuf {
        self.current_dir.read().await.clone()
    }

    /// Return to the workspace root
    pub async fn reset_dir(&self) {
        *self.current_dir.write().await = self.workspace.clone();
    }

    /// Run one command line and describe the outcome
    pub async fn run(&self, command: &str) -> String {
        let command = command.trim();
        if command.is_empty() {
            return "Error: command must not be empty".into();
        }

        let parts = match split_command(command) {
            Ok(parts) if !parts.is_empty() => parts,
            Ok(_) => return "Error: command must not be empty".into(),
            Err(e) => return format!("Error: could not parse command: {}", e),
        };

        let program = parts[0].as_str();
        if !ALLOWED_COMMANDS.contains(&program) {
            return format!(
                "Error: command not allowed: {}\nAllowed commands: {}",
                program,
                ALLOWED_COMMANDS.join(", ")
            );
        }

        if program == "cd" {
            return self.change_dir(parts.get(1).map(String::as_str)).await;
        }

        if let Some(arg) = forbidden_argument(program, &parts[1..]) {
            return format!("Error: argument not allowed for {}: {}", program, arg);
        }

        let cwd = self.current_dir().await;
        for arg in &parts[1..] {
            if let Some(path) = path_operand(arg) {
                if !self.stays_inside(&cwd, path) {
                    return format!("Error: path outside the workspace: {}", arg);
                }
            }
        }

        self.execute(&parts, &cwd).await
    }

    async fn change_dir(&self, target: Option<&str>) -> String {
        if !self.allow_cd {
            return "Error: cd is disabled".into();
        }

        let mut current = self.current_dir.write().await;
        let Some(target) = target else {
            return format!("Current directory: {}", current.display());
        };

        let candidate = match target {
            "~" => self.workspace.clone(),
            _ => current.join(target),
        };
        let resolved = match candidate.canonicalize() {
            Ok(path) => path,
            Err(_) => return format!("Error: directory does not exist: {}", candidate.display()),
        };
        if !resolved.starts_with(&self.workspace) {
            return format!("Error: path outside the workspace: {}", resolved.display());
        }
        if !resolved.is_dir() {
            return format!("Error: not a directory: {}", resolved.display());
        }

        *current = resolved;
        format!("Changed directory to {}", current.display())
    }

    /// Whether `arg`, read as a path from `cwd`, resolves inside the workspace
    fn stays_inside(&self, cwd: &Path, arg: &str) -> bool {
        resolve_path(&cwd.join(arg)).starts_with(&self.workspace)
    }

    async fn execute(&self, parts: &[String], cwd: &Path) -> String {
        tracing::debug!(command = ?parts, cwd = %cwd.display(), "Running terminal command");

        let child = Command::new(&parts[0])
            .args(&parts[1..])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => return format!("Error: command timed out after {} seconds", self.timeout.as_secs()),
            Ok(Err(e)) => return format!("Error: command failed to start: {}", e),
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        if text.len() > self.max_output_bytes {
            let mut cut = self.max_output_bytes;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str(&format!("\n\n[output truncated at {} bytes]", self.max_output_bytes));
        }

        if !output.status.success() {
            let code = output.status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
            text = format!("Warning: command exited with status {}\n\n{}", code, text);
        }

        if text.trim().is_empty() {
            "Command completed with no output".into()
        } else {
            text.trim_end().to_string()
        }
    }
}

/// Walk `path` one component at a time, resolving symlinks for every prefix
/// that exists. `..` after a resolved prefix pops the real parent, the way
/// the kernel would.
fn resolve_path(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => {
                resolved.push(other);
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
        }
    }
    resolved
}

/// The part of an argument that names a file: the argument itself, the
/// value of `--name=value`, or a path glued to a short flag (`-o/tmp/x`)
fn path_operand(arg: &str) -> Option<&str> {
    if let Some(long) = arg.strip_prefix("--") {
        return long.split_once('=').map(|(_, value)| value).filter(|value| !value.is_empty());
    }
    if let Some(short) = arg.strip_prefix('-') {
        return short.find(['/', '.']).map(|i| &short[i..]);
    }
    Some(arg)
}

/// First argument that would let `program` write files or leave the tree
fn forbidden_argument<'a>(program: &str, args: &'a [String]) -> Option<&'a str> {
    let (short, long): (&[char], &[&str]) = match program {
        "sort" => (&['o'], &["--output", "--compress-program"]),
        "tree" => (&['o', 'l'], &[]),
        "grep" | "egrep" | "fgrep" => (&['R'], &["--dereference-recursive"]),
        "find" => {
            return args
                .iter()
                .map(String::as_str)
                .find(|arg| FORBIDDEN_FIND_ARGS.contains(arg));
        }
        "uniq" => return uniq_output_operand(args),
        _ => return None,
    };

    args.iter().map(String::as_str).find(|arg| {
        if arg.starts_with("--") {
            // GNU accepts any unambiguous prefix, e.g. `--out`
            let name = arg.split('=').next().unwrap_or(*arg);
            name.len() > 2 && long.iter().any(|option| option.starts_with(name))
        } else if let Some(cluster) = arg.strip_prefix('-') {
            cluster
                .chars()
                .take_while(char::is_ascii_alphabetic)
                .any(|c| short.contains(&c))
        } else {
            false
        }
    })
}

/// `uniq INPUT OUTPUT` writes OUTPUT
fn uniq_output_operand(args: &[String]) -> Option<&str> {
    let mut operands = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-f" | "-s" | "-w" | "--skip-fields" | "--skip-chars" | "--check-chars" => {
                iter.next();
            }
            "--" => operands.extend(iter.by_ref().map(String::as_str)),
            flag if flag.starts_with('-') && flag != "-" => {}
            operand => operands.push(operand),
        }
    }
    operands.get(1).copied()
}

/// Split a command line into words, honouring single and double quotes
fn split_command(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\\') if c == '"' => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        Some(other) => current.push(other),
                        None => return Err("unterminated quote".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }

    Ok(words)
}

#[async_trait]
impl Tool for TerminalTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "terminal".into(),
            description: format!(
                "Run a read-only command inside the workspace. Allowed: {}. \
                 Examples: 'ls -la', 'cat notes.txt', 'grep -rn TODO src', 'head -n 20 data.csv'",
                ALLOWED_COMMANDS.join(", ")
            ),
            parameters: vec![ParameterSchema::required("command", "string", "Command line to run")],
            category: Some("system".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let command = call
            .str_arg("command")
            .ok_or_else(|| AgentError::ToolValidation("Missing command".into()))?;

        let output = self.run(command).await;
        Ok(if output.starts_with("Error:") {
            ToolResult::failure("terminal", output.trim_start_matches("Error:").trim())
        } else {
            ToolResult::success("terminal", output)
        })
    }
}
