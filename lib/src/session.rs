//! Executes commands against a lazily connected transport.

mod command;
mod middleware;

use std::fmt;
use std::sync::Arc;

use bon::bon;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

pub use self::command::Command;
pub use self::command::CommandResult;
pub use self::middleware::Middleware;
use crate::transport::Channel;
use crate::transport::ChannelEvent;
use crate::transport::Connect;
use crate::transport::ConnectError;
use crate::transport::Transport;

/// Failure running a command. A non-zero exit is not a failure, it is
/// reported in [`CommandResult::exit_status`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("remote execution was cancelled")]
    Cancelled,

    #[error("remote process terminated by signal {0}")]
    Signal(String),

    #[error("remote process exited without reporting a status")]
    NoExitStatus,

    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Channel(anyhow::Error),
}

impl ExecError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Connect(ConnectError::Cancelled))
    }
}

/// Runs [`Command`]s on one remote host.
///
/// The transport is connected on first use and re-established if it drops.
/// At most `concurrency` commands run at once, `0` meaning unbounded.
pub struct Session {
    connector: Arc<dyn Connect>,
    middleware: Vec<Middleware>,
    permits: Option<Arc<Semaphore>>,
    transport: Mutex<Option<Connected>>,
    shutdown: CancellationToken,
}

/// A live transport plus the guard retiring its shutdown watcher.
struct Connected {
    transport: Arc<dyn Transport>,
    _watcher: DropGuard,
}

#[bon]
impl Session {
    #[builder]
    pub fn new(
        connector: Arc<dyn Connect>,
        #[builder(default)] middleware: Vec<Middleware>,
        #[builder(default = 1)] concurrency: usize,
        /// Closes every transport this session opened when cancelled.
        #[builder(default)]
        shutdown: CancellationToken,
    ) -> Self {
        let permits = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        Self {
            connector,
            middleware,
            permits,
            transport: Mutex::new(None),
            shutdown: shutdown.child_token(),
        }
    }
}

impl Session {
    /// Runs `command` and collects its output.
    ///
    /// Cancelling `cancel` aborts waiting for a permit or a connection, and
    /// interrupts a running remote process.
    ///
    /// # Errors
    ///
    /// See [`ExecError`].
    #[instrument(skip_all)]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        command: Command,
    ) -> Result<CommandResult, ExecError> {
        let _permit = match &self.permits {
            Some(permits) => Some(tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecError::Cancelled),
                permit = permits.clone().acquire_owned() => permit.map_err(|_| ExecError::Closed)?,
            }),
            None => None,
        };

        let command = self
            .middleware
            .iter()
            .fold(command, |command, middleware| middleware.apply(command));
        trace!(script = %command.script(), "executing");

        let transport = self.transport(cancel).await?;
        let mut channel = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecError::Cancelled),
            channel = transport.open_channel() => channel.map_err(ExecError::Channel)?,
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = drive(channel.as_mut(), &command) => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                debug!("cancelled, interrupting remote process");
                if let Err(error) = channel.interrupt().await {
                    debug!(?error, "unable to interrupt remote process");
                }
                if let Err(error) = channel.close().await {
                    debug!(?error, "unable to close channel");
                }
                Err(ExecError::Cancelled)
            }
        }
    }

    /// Connects now instead of on first use.
    ///
    /// # Errors
    ///
    /// If connecting fails or is cancelled.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ExecError> {
        self.transport(cancel).await.map(drop)
    }

    /// Closes every transport opened by this session. Later calls to
    /// [`Session::execute`] fail with [`ExecError::Closed`].
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(permits) = &self.permits {
            permits.close();
        }
    }

    async fn transport(&self, cancel: &CancellationToken) -> Result<Arc<dyn Transport>, ExecError> {
        if self.shutdown.is_cancelled() {
            return Err(ExecError::Closed);
        }

        let mut current = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecError::Cancelled),
            guard = self.transport.lock() => guard,
        };

        if let Some(connected) = current.as_ref() {
            if !connected.transport.is_closed() {
                return Ok(connected.transport.clone());
            }
            debug!("transport closed, reconnecting");
        }

        let transport = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecError::Cancelled),
            result = self.connector.connect() => result?,
        };

        *current = Some(Connected {
            transport: transport.clone(),
            _watcher: self.watch(transport.clone()),
        });
        Ok(transport)
    }

    /// Closes `transport` once the session shuts down. Dropping the returned
    /// guard retires the watcher without closing anything.
    fn watch(&self, transport: Arc<dyn Transport>) -> DropGuard {
        let shutdown = self.shutdown.clone();
        let retired = CancellationToken::new();
        let guard = retired.clone().drop_guard();

        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("session shut down, closing transport");
                    if let Err(error) = transport.close().await {
                        debug!(?error, "error closing transport");
                    }
                }
                () = retired.cancelled() => {}
            }
        });

        guard
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("middleware", &self.middleware)
            .field("permits", &self.permits.as_ref().map(|p| p.available_permits()))
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Starts `command` on `channel` and collects events until it drains.
async fn drive(channel: &mut dyn Channel, command: &Command) -> Result<CommandResult, ExecError> {
    channel
        .exec(command.script())
        .await
        .map_err(ExecError::Channel)?;
    // always send EOF so scripts reading stdin never block
    channel
        .send_stdin(command.stdin().unwrap_or_default())
        .await
        .map_err(ExecError::Channel)?;

    let limit = command.limit();
    let mut result = CommandResult::default();
    let mut code = None;

    while let Some(event) = channel.wait().await {
        match event {
            ChannelEvent::Stdout(data) => {
                result.truncated |= CommandResult::capture(&mut result.stdout, &data, limit);
            }
            ChannelEvent::Stderr(data) => {
                result.truncated |= CommandResult::capture(&mut result.stderr, &data, limit);
            }
            ChannelEvent::Exit(status) => {
                code = Some(status);
                // cannot leave the loop immediately, there might still be
                // more data to receive
            }
            ChannelEvent::Signal(signal) => return Err(ExecError::Signal(signal)),
        }
    }

    result.exit_status = code.ok_or(ExecError::NoExitStatus)?;
    Ok(result)
}
