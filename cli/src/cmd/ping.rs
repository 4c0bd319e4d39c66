use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use hostform::session::Command;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::args::ConnectionArgs;
use crate::args::ExecutionArgs;
use crate::cmd::Run;

/// Connect to the host and run a trivial command
#[derive(Debug, Args)]
pub struct PingArgs {
    #[clap(flatten)]
    connection_args: ConnectionArgs,

    #[clap(flatten)]
    execution_args: ExecutionArgs,
}

impl Run for PingArgs {
    #[instrument(skip_all, fields(host = %self.connection_args.host))]
    async fn run(&self, cancel: CancellationToken) -> Result<ExitCode> {
        let cancel = self.execution_args.deadline(&cancel);
        let session = self.execution_args.session(&self.connection_args)?;

        let start = Instant::now();
        session.connect(&cancel).await.context("unable to connect")?;
        let connected = start.elapsed();

        let result = session
            .execute(&cancel, Command::new("uname -srm"))
            .await
            .context("unable to ping")?;
        session.close();

        println!(
            "{}: connected in {}, {}",
            self.connection_args.host,
            humantime::format_duration(round(connected)),
            String::from_utf8_lossy(&result.stdout).trim(),
        );
        Ok(ExitCode::SUCCESS)
    }
}

fn round(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
