use std::fmt;
use std::sync::Arc;

use super::Command;
use crate::protocol::quote;

/// Rewrites a command before it is executed. Applied in configuration order,
/// so later middleware wraps earlier middleware.
#[derive(Clone)]
pub enum Middleware {
    /// Runs the script under a login shell so profile-provided `PATH` and
    /// environment apply.
    LoginShell,
    /// Elevates through non-interactive `sudo`, optionally as `user`.
    Sudo { user: Option<String> },
    /// Arbitrary script rewrite.
    Custom(Arc<dyn Fn(String) -> String + Send + Sync>),
}

impl Middleware {
    /// Wraps `command`, keeping its stdin and output limit.
    #[must_use]
    pub fn apply(&self, command: Command) -> Command {
        match self {
            Self::LoginShell => command.map_script(|script| format!("sh -l -c {}", quote(&script))),
            Self::Sudo { user: None } => {
                command.map_script(|script| format!("sudo -n -- sh -c {}", quote(&script)))
            }
            Self::Sudo { user: Some(user) } => command.map_script(|script| {
                format!("sudo -n -u {} -- sh -c {}", quote(user), quote(&script))
            }),
            Self::Custom(f) => command.map_script(|script| f(script)),
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginShell => f.write_str("LoginShell"),
            Self::Sudo { user } => f.debug_struct("Sudo").field("user", user).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Middleware::LoginShell, "sh -l -c 'echo '\\''hi'\\'''")]
    #[case(Middleware::Sudo { user: None }, "sudo -n -- sh -c 'echo '\\''hi'\\'''")]
    #[case(
        Middleware::Sudo { user: Some("app".into()) },
        "sudo -n -u 'app' -- sh -c 'echo '\\''hi'\\'''"
    )]
    fn wraps_script(#[case] middleware: Middleware, #[case] expected: &str) {
        let command = Command::new("echo 'hi'").with_stdin("in").with_limit(4);
        let wrapped = middleware.apply(command);
        assert_eq!(wrapped.script(), expected);
        assert_eq!(wrapped.stdin(), Some(&b"in"[..]));
        assert_eq!(wrapped.limit(), Some(4));
    }

    #[test]
    fn composes_in_order() {
        let chain = [
            Middleware::Custom(Arc::new(|s: String| format!("{s}; echo done"))),
            Middleware::Sudo { user: None },
        ];
        let command = chain
            .iter()
            .fold(Command::new("true"), |command, m| m.apply(command));
        assert_eq!(command.script(), "sudo -n -- sh -c 'true; echo done'");
    }
}
