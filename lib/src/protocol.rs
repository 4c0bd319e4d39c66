//! Renders state transitions as single POSIX `sh` invocations and parses
//! their output.
//!
//! Every operation is one function definition followed by its call:
//!
//! ```text
//! _do() {
//!   path=${1}
//!   [ -f "$path" ] || return 17
//!   _old_mode=$(stat -c %a -- "$path") || return 1
//!   { chmod -- "$mode" "$path"
//!   } >&2 || return 1
//!   { chown -- "$owner" "$path"
//!   } >&2 || { chmod -- "$_old_mode" "$path"; return 1; }
//!   stat -c '...' -- "$path"
//! }; _do '/etc/motd' ...
//! ```
//!
//! Checks return a sentinel exit code, steps undo the ones before them when
//! they fail, and the trailing read-back is the only thing writing stdout.

pub mod getent;
pub mod props;
pub mod stat;

use std::fmt;
use std::fmt::Write as _;

use crate::session::Command;

// Quoting --------------------------------------------------------------------

/// Quotes `value` for `sh` so it is always a single literal word.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// Sentinels ------------------------------------------------------------------

/// What a sentinel exit code stands for, independent of resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meaning {
    Success,
    Failure,
    NotFound,
    Conflict(Conflict),
    /// A requirement other than existence does not hold.
    Precondition(&'static str),
}

/// Which identity collided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Conflict {
    #[strum(serialize = "path")]
    Path,
    #[strum(serialize = "rename destination")]
    Destination,
    #[strum(serialize = "id")]
    Id,
    #[strum(serialize = "name")]
    Name,
}

/// An exit code table, one per resource kind.
pub trait Sentinel: Copy + fmt::Debug {
    fn from_exit(code: u32) -> Option<Self>;

    fn exit_code(self) -> u32;

    fn meaning(self) -> Meaning;
}

/// Declares a sentinel table as a `#[repr(u32)]` enum.
///
/// ```ignore
/// sentinel_table! {
///     pub enum GroupExit {
///         Ok = 0 => Meaning::Success,
///         NotFound = 17 => Meaning::NotFound,
///     }
/// }
/// ```
macro_rules! sentinel_table {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $meaning:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
        #[repr(u32)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $code, )+
        }

        impl $crate::protocol::Sentinel for $name {
            fn from_exit(code: u32) -> Option<Self> {
                Self::from_repr(code)
            }

            fn exit_code(self) -> u32 {
                self as u32
            }

            fn meaning(self) -> $crate::protocol::Meaning {
                #[allow(unused_imports)]
                use $crate::protocol::{Conflict, Meaning};
                match self {
                    $( Self::$variant => $meaning, )+
                }
            }
        }
    };
}

pub(crate) use sentinel_table;

/// Shell fragment running a wrapped utility and forwarding only the exit
/// codes listed in `forward`. Anything else becomes 1.
///
/// `useradd` exits 4 for a taken uid, 6 for a missing group and 9 for a
/// taken name, which line up with the user and group tables.
#[must_use]
pub fn remap<S: Sentinel>(invocation: &str, forward: &[S]) -> String {
    let codes = forward
        .iter()
        .map(|code| code.exit_code().to_string())
        .collect::<Vec<_>>()
        .join("|");
    if codes.is_empty() {
        return format!("{invocation} || return 1");
    }
    format!("{invocation}; _rc=$?; case $_rc in 0) ;; {codes}) return $_rc ;; *) return 1 ;; esac")
}

// Script ---------------------------------------------------------------------

/// One side effect plus what reverts it.
#[derive(Debug, Clone)]
pub struct Step {
    run: String,
    capture: Option<(String, String)>,
    undo: Option<String>,
}

impl Step {
    #[must_use]
    pub fn run(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            capture: None,
            undo: None,
        }
    }

    /// Stores the output of `command` in `$var` before any step runs, so the
    /// undo can restore it.
    #[must_use]
    pub fn capture(mut self, var: &str, command: impl Into<String>) -> Self {
        self.capture = Some((format!("_{var}"), command.into()));
        self
    }

    #[must_use]
    pub fn undo(mut self, undo: impl Into<String>) -> Self {
        self.undo = Some(undo.into());
        self
    }
}

/// Builder for one `_do` invocation.
#[derive(Debug, Clone, Default)]
pub struct Script {
    params: Vec<(String, String)>,
    checks: Vec<(String, u32)>,
    steps: Vec<Step>,
    readback: Option<String>,
    stdin: Option<Vec<u8>>,
}

impl Script {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` to the shell variable `name`. Values are passed as
    /// quoted positional arguments, never spliced into the body.
    #[must_use]
    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.params.push((name.to_owned(), value.to_string()));
        self
    }

    /// Returns `code` when `condition` fails.
    #[must_use]
    pub fn check<S: Sentinel>(mut self, condition: impl Into<String>, code: S) -> Self {
        self.checks.push((condition.into(), code.exit_code()));
        self
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// The final command, the only one whose stdout reaches the caller.
    #[must_use]
    pub fn readback(mut self, readback: impl Into<String>) -> Self {
        self.readback = Some(readback.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Whether the script changes anything.
    #[must_use]
    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("_do() {\n");

        for (i, (name, _)) in self.params.iter().enumerate() {
            let _ = writeln!(out, "  {name}=${{{}}}", i + 1);
        }
        for (condition, code) in &self.checks {
            let _ = writeln!(out, "  {condition} || return {code}");
        }
        for (var, command) in self.steps.iter().filter_map(|s| s.capture.as_ref()) {
            let _ = writeln!(out, "  {var}=$({command}) || return 1");
        }
        for (i, step) in self.steps.iter().enumerate() {
            let undos = self.steps[..i]
                .iter()
                .rev()
                .filter_map(|s| s.undo.as_deref())
                .map(|undo| format!("{{ {undo}\n  }} >&2; "))
                .collect::<String>();
            let _ = writeln!(out, "  {{ {}\n  }} >&2 || {{ {undos}return 1; }}", step.run);
        }
        if let Some(readback) = &self.readback {
            let _ = writeln!(out, "  {readback}");
        }

        out.push_str("}; _do");
        for (_, value) in &self.params {
            out.push(' ');
            out.push_str(&quote(value));
        }
        out
    }

    #[must_use]
    pub fn into_command(self) -> Command {
        let command = Command::new(self.render());
        match self.stdin {
            Some(stdin) => command.with_stdin(stdin),
            None => command,
        }
    }
}

// Parsing --------------------------------------------------------------------

/// Output that does not have the expected shape.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found} in {line:?}")]
    FieldCount {
        expected: usize,
        found: usize,
        line: String,
    },

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("missing key {0}")]
    MissingKey(String),

    #[error("malformed line {0:?}")]
    Malformed(String),

    #[error("empty output")]
    Empty,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Parses `value` as `T`, naming `field` in the error.
pub(crate) fn field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_owned(),
    })
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::session::Session;
    use crate::transport::LocalConnector;
    use tokio_util::sync::CancellationToken;

    sentinel_table! {
        enum TestExit {
            Ok = 0 => Meaning::Success,
            Failed = 1 => Meaning::Failure,
            Taken = 9 => Meaning::Conflict(Conflict::Name),
            Missing = 17 => Meaning::NotFound,
        }
    }

    #[rstest]
    #[case("plain", "'plain'")]
    #[case("with space", "'with space'")]
    #[case("it's", r"'it'\''s'")]
    #[case("$(rm -rf /)", "'$(rm -rf /)'")]
    #[case("", "''")]
    fn quote_works(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(quote(input), expected);
    }

    #[test]
    fn sentinel_table_round_trips() {
        assert_eq!(TestExit::from_exit(17), Some(TestExit::Missing));
        assert_eq!(TestExit::from_exit(3), None);
        assert_eq!(TestExit::Taken.exit_code(), 9);
        assert_eq!(TestExit::Taken.meaning(), Meaning::Conflict(Conflict::Name));
    }

    async fn run(script: Script) -> crate::session::CommandResult {
        let session = Session::builder()
            .connector(std::sync::Arc::new(LocalConnector::default()))
            .build();
        session
            .execute(&CancellationToken::new(), script.into_command())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn hostile_values_stay_literal() {
        let value = "a'b; echo pwned $(id) `id` \"q\"";
        let result = run(Script::new().param("v", value).readback(r#"printf %s "$v""#)).await;
        assert_eq!(result.stdout, value.as_bytes());
    }

    #[tokio::test]
    async fn failed_check_returns_sentinel() {
        let result = run(
            Script::new()
                .param("path", "/nonexistent/path")
                .check(r#"[ -e "$path" ]"#, TestExit::Missing)
                .readback("echo unreachable"),
        )
        .await;
        assert_eq!(result.exit_status, 17);
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn failing_step_undoes_earlier_steps() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("state");
        std::fs::write(&marker, "before").unwrap();

        let result = run(
            Script::new()
                .param("f", marker.display())
                .step(
                    Step::run(r#"echo one > "$f""#)
                        .capture("old", r#"cat "$f""#)
                        .undo(r#"printf %s "$_old" > "$f""#),
                )
                .step(Step::run("false"))
                .readback(r#"cat "$f""#),
        )
        .await;

        assert_eq!(result.exit_status, 1);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "before");
    }

    #[tokio::test]
    async fn steps_do_not_pollute_stdout() {
        let result = run(
            Script::new()
                .step(Step::run("echo noise"))
                .readback("echo clean"),
        )
        .await;
        assert_eq!(result.stdout, b"clean\n");
        assert_eq!(result.stderr, b"noise\n");
    }

    #[tokio::test]
    async fn remap_forwards_known_codes() {
        let forwarded = run(Script::new().readback(remap("(exit 9)", &[TestExit::Taken]))).await;
        assert_eq!(forwarded.exit_status, 9);

        let collapsed = run(Script::new().readback(remap("(exit 5)", &[TestExit::Taken]))).await;
        assert_eq!(collapsed.exit_status, 1);

        let ok = run(Script::new().readback(remap("true", &[TestExit::Taken]))).await;
        assert_eq!(ok.exit_status, 0);
    }

    #[test]
    fn render_shape() {
        let script = Script::new()
            .param("path", "/tmp/x")
            .check(r#"[ -f "$path" ]"#, TestExit::Missing)
            .step(Step::run("a").undo("undo_a"))
            .step(Step::run("b"))
            .readback("stat");

        assert_eq!(
            script.render(),
            "_do() {\n  path=${1}\n  [ -f \"$path\" ] || return 17\n  { a\n  } >&2 || { return 1; }\n  { b\n  } >&2 || { { undo_a\n  } >&2; return 1; }\n  stat\n}; _do '/tmp/x'"
        );
    }
}
