use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use hostform::session::Middleware;
use hostform::session::Session;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::ConnectionArgs;

const HEADING: Option<&str> = Some("Execution Options");

/// Arguments for command execution.
#[derive(Debug, Args, Clone)]
pub struct ExecutionArgs {
    /// Number of commands to run on the host at once. 0 means unbounded.
    #[clap(long, default_value_t = 1, help_heading = HEADING)]
    pub concurrency: usize,

    /// Time to allow the whole command to complete.
    #[clap(long, default_value = "5m", help_heading = HEADING)]
    pub timeout: humantime::Duration,

    /// Run remote commands under a login shell.
    #[clap(long, help_heading = HEADING)]
    pub login_shell: bool,

    /// Elevate remote commands with non-interactive sudo.
    #[clap(long, help_heading = HEADING)]
    pub sudo: bool,

    /// User to sudo to, implies --sudo.
    #[clap(long, help_heading = HEADING)]
    pub sudo_user: Option<String>,
}

impl ExecutionArgs {
    pub fn session(&self, connection: &ConnectionArgs) -> Result<Arc<Session>> {
        let mut middleware = Vec::new();
        if self.login_shell {
            middleware.push(Middleware::LoginShell);
        }
        if self.sudo || self.sudo_user.is_some() {
            middleware.push(Middleware::Sudo {
                user: self.sudo_user.clone(),
            });
        }

        let session = Session::builder()
            .connector(connection.connector()?)
            .middleware(middleware)
            .concurrency(self.concurrency)
            .build();
        Ok(Arc::new(session))
    }

    /// A child of `cancel` that also fires once the timeout elapses.
    pub fn deadline(&self, cancel: &CancellationToken) -> CancellationToken {
        let token = cancel.child_token();
        let timeout = self.timeout;
        let expiry = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout.into()) => {
                    warn!(%timeout, "Timed out, cancelling");
                    expiry.cancel();
                }
                () = expiry.cancelled() => {}
            }
        });
        token
    }
}
