mod exec;
mod get;
mod ping;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use enum_dispatch::enum_dispatch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::args::GlobalArgs;

/// Idempotent configuration of remote Unix hosts over SSH
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    global_args: GlobalArgs,
}

/// Subcommands must implement [`Run`] to be executed at runtime.
#[enum_dispatch]
pub trait Run {
    /// Runs until done or until `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<ExitCode>;
}

#[enum_dispatch(Run)]
#[derive(Debug, Subcommand)]
enum Command {
    Ping(ping::PingArgs),
    Exec(exec::ExecArgs),
    Get(get::GetArgs),
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = cli.global_args.init_tracing()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    cli.command.run(cancel).await
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "hostform", "ping", "-H", "web1", "--insecure", "--log", "debug", "--log-file", "/tmp/h.log",
        ])
        .unwrap();
        assert_eq!(cli.global_args.log, "debug");
        assert_eq!(cli.global_args.log_file.as_deref().map(|p| p.as_str()), Some("/tmp/h.log"));
        assert!(matches!(cli.command, Command::Ping(_)));
    }

    #[test]
    fn proxy_options_need_proxy_on_every_subcommand() {
        for argv in [
            &["hostform", "ping", "-H", "web1", "--proxy-user", "jump"][..],
            &["hostform", "exec", "-H", "web1", "--proxy-user", "jump", "true"][..],
        ] {
            let error = Cli::try_parse_from(argv).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument, "{argv:?}");
        }
    }

    #[test]
    fn exec_keeps_command_flags() {
        let cli = Cli::try_parse_from(["hostform", "exec", "-H", "web1", "--insecure", "ls", "-la"]).unwrap();
        assert!(matches!(cli.command, Command::Exec(_)));
    }
}
