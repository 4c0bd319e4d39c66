use std::fmt;

use anyhow::bail;
use anyhow::Result;
use bstr::ByteSlice;

/// A shell invocation: the exact script, optional stdin and an optional cap
/// on captured output.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    script: String,
    stdin: Option<Vec<u8>>,
    limit: Option<usize>,
}

/// Constructors
impl Command {
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            stdin: None,
            limit: None,
        }
    }

    /// Joins `commands` with `&&` so the first failing step aborts the rest.
    ///
    /// # Errors
    ///
    /// If more than one command carries stdin, or there are no commands.
    pub fn chain(commands: impl IntoIterator<Item = Command>) -> Result<Self> {
        let mut scripts = Vec::new();
        let mut stdin = None;
        let mut limit: Option<usize> = None;

        for command in commands {
            if command.stdin.is_some() && stdin.is_some() {
                bail!("only one command in a chain may read stdin");
            }
            stdin = stdin.or(command.stdin);
            limit = match (limit, command.limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            scripts.push(format!("{{ {}\n}}", command.script));
        }

        if scripts.is_empty() {
            bail!("cannot chain zero commands");
        }

        Ok(Self {
            script: scripts.join(" && "),
            stdin,
            limit,
        })
    }
}

/// Builders
impl Command {
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Caps each of stdout and stderr at `limit` bytes.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rewrites the script, keeping input and limit untouched.
    #[must_use]
    pub fn map_script(mut self, f: impl FnOnce(String) -> String) -> Self {
        self.script = f(self.script);
        self
    }
}

/// Accessors
impl Command {
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    #[must_use]
    pub fn stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("script", &self.script)
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("limit", &self.limit)
            .finish()
    }
}

/// Outcome of a command that ran to completion.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Whether output was cut at the command's limit.
    pub truncated: bool,
}

impl CommandResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Stderr as trimmed lossy UTF-8, for error details.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        self.stderr.to_str_lossy().trim().to_owned()
    }

    /// Appends `data` to `buf` without growing it past `limit`.
    pub(crate) fn capture(buf: &mut Vec<u8>, data: &[u8], limit: Option<usize>) -> bool {
        match limit {
            Some(limit) if buf.len() + data.len() > limit => {
                let room = limit.saturating_sub(buf.len());
                buf.extend_from_slice(&data[..room]);
                true
            }
            _ => {
                buf.extend_from_slice(data);
                false
            }
        }
    }
}

impl fmt::Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandResult")
            .field("exit_status", &self.exit_status)
            .field("stdout", &self.stdout.as_bstr())
            .field("stderr", &self.stderr.as_bstr())
            .field("truncated", &self.truncated)
            .finish()
    }
}
