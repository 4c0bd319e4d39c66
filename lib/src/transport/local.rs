//! Runs commands on the local host through `sh`.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::mpsc;

use super::Channel;
use super::ChannelEvent;
use super::Connect;
use super::ConnectError;
use super::Transport;

const SHELL: &str = "sh";

/// Connector for the local host. Connecting never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connect for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        Ok(Arc::new(LocalTransport))
    }
}

struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        Ok(Box::new(LocalChannel {
            child: None,
            events: None,
            exited: false,
        }))
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct LocalChannel {
    child: Option<Child>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    exited: bool,
}

impl LocalChannel {
    fn child(&mut self) -> Result<&mut Child> {
        self.child.as_mut().context("command not started")
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        if self.child.is_some() {
            bail!("command already started");
        }

        let mut child = tokio::process::Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {SHELL}"))?;

        // readers hold the only senders, so the receiver drains once both
        // pipes hit EOF
        let (tx, rx) = mpsc::channel(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, tx.clone(), ChannelEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, tx, ChannelEvent::Stderr));
        }

        self.child = Some(child);
        self.events = Some(rx);
        Ok(())
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<()> {
        let mut stdin = self.child()?.stdin.take().context("stdin already closed")?;
        // the script may exit without reading its input
        match stdin.write_all(data).await {
            Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other.context("unable to write stdin"),
        }
        // dropping stdin closes the pipe
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        if let Some(events) = self.events.as_mut() {
            if let Some(event) = events.recv().await {
                return Some(event);
            }
            self.events = None;
        }

        if self.exited {
            return None;
        }
        let child = self.child.as_mut()?;
        // closes stdin if nobody sent input
        drop(child.stdin.take());
        let status = child.wait().await.ok()?;
        self.exited = true;

        match status.code() {
            Some(code) => Some(ChannelEvent::Exit(u32::try_from(code).unwrap_or(u32::MAX))),
            None => Some(ChannelEvent::Signal(signal_name(&status))),
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        send_interrupt(self.child()?)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.events = None;
        Ok(())
    }
}

async fn forward<R>(
    mut reader: R,
    tx: mpsc::Sender<ChannelEvent>,
    wrap: fn(Vec<u8>) -> ChannelEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Sends SIGINT so the process can run its traps.
#[cfg(unix)]
fn send_interrupt(child: &mut Child) -> Result<()> {
    use nix::sys::signal::kill;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    // already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).context("pid out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGINT).context("unable to interrupt local process")
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) -> Result<()> {
    child.start_kill().context("unable to kill local process")
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(2) => "INT".into(),
        Some(9) => "KILL".into(),
        Some(15) => "TERM".into(),
        Some(other) => other.to_string(),
        None => "unknown".into(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> String {
    "unknown".into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn run(command: &str, stdin: Option<&[u8]>) -> Vec<ChannelEvent> {
        let transport = LocalConnector.connect().await.unwrap();
        let mut channel = transport.open_channel().await.unwrap();
        channel.exec(command).await.unwrap();
        if let Some(data) = stdin {
            channel.send_stdin(data).await.unwrap();
        }
        let mut events = Vec::new();
        while let Some(event) = channel.wait().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reports_output_and_status() {
        let events = run("echo out; echo err >&2; exit 3", None).await;
        assert!(events.contains(&ChannelEvent::Stdout(b"out\n".to_vec())));
        assert!(events.contains(&ChannelEvent::Stderr(b"err\n".to_vec())));
        assert_eq!(events.last(), Some(&ChannelEvent::Exit(3)));
    }

    #[tokio::test]
    async fn pipes_stdin() {
        let events = run("cat", Some(b"hello")).await;
        assert_eq!(
            events,
            vec![
                ChannelEvent::Stdout(b"hello".to_vec()),
                ChannelEvent::Exit(0)
            ]
        );
    }

    #[tokio::test]
    async fn interrupt_runs_traps() {
        let transport = LocalConnector.connect().await.unwrap();
        let mut channel = transport.open_channel().await.unwrap();
        channel
            .exec("trap 'echo stopping; exit 5' INT; echo ready; while :; do sleep 0.1; done")
            .await
            .unwrap();
        channel.send_stdin(b"").await.unwrap();
        assert_eq!(
            channel.wait().await,
            Some(ChannelEvent::Stdout(b"ready\n".to_vec()))
        );

        channel.interrupt().await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), channel.wait())
            .await
            .unwrap()
        {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                ChannelEvent::Stdout(b"stopping\n".to_vec()),
                ChannelEvent::Exit(5)
            ]
        );
    }
}
