use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use hostform::session::Command;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing::warn;

use crate::args::ConnectionArgs;
use crate::args::ExecutionArgs;
use crate::cmd::Run;

/// Run a shell command on the host and exit with its status
#[derive(Debug, Args)]
pub struct ExecArgs {
    #[clap(flatten)]
    connection_args: ConnectionArgs,

    #[clap(flatten)]
    execution_args: ExecutionArgs,

    /// Forward local stdin to the command.
    #[arg(long)]
    stdin: bool,

    /// Bytes of stdout and of stderr to keep.
    #[arg(long, default_value_t = 1 << 20)]
    max_output: usize,

    /// Command to run, interpreted by the remote shell.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

impl Run for ExecArgs {
    #[instrument(skip_all, fields(host = %self.connection_args.host))]
    async fn run(&self, cancel: CancellationToken) -> Result<ExitCode> {
        let cancel = self.execution_args.deadline(&cancel);
        let session = self.execution_args.session(&self.connection_args)?;

        let mut command = Command::new(self.command.join(" ")).with_limit(self.max_output);
        if self.stdin {
            let mut stdin = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut stdin)
                .await
                .context("unable to read stdin")?;
            command = command.with_stdin(stdin);
        }

        let result = session
            .execute(&cancel, command)
            .await
            .context("unable to run command")?;
        session.close();

        tokio::io::stdout().write_all(&result.stdout).await?;
        tokio::io::stderr().write_all(&result.stderr).await?;
        if result.truncated {
            warn!(limit = self.max_output, "Output truncated");
        }

        Ok(ExitCode::from(
            u8::try_from(result.exit_status).unwrap_or(u8::MAX),
        ))
    }
}
