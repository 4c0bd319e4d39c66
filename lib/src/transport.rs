//! Connection pipeline producing transports that can run remote commands.
//!
//! A [`Connect`] implementation yields a connected [`Transport`]. Connectors
//! are composed as decorators: [`SshConnector`] dials (directly or through a
//! [`proxy`] hop) and performs the SSH handshake, [`Retry`] re-attempts
//! transient failures, and [`CircuitBreaker`] remembers the first terminal
//! failure. [`pipeline`] wires the usual stack.

pub mod breaker;
pub mod dial;
pub mod local;
pub mod proxy;
pub mod retry;
pub mod ssh;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bon::Builder;

pub use self::breaker::CircuitBreaker;
pub use self::local::LocalConnector;
pub use self::retry::Backoff;
pub use self::retry::Retry;
pub use self::ssh::SshConnector;
pub use self::ssh::SshTransport;

/// Port used when an address does not carry one.
pub const DEFAULT_PORT: u16 = 22;

// Traits ---------------------------------------------------------------------

/// Something that can be observed on a running remote execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
    /// The remote process was terminated by the named signal.
    Signal(String),
}

/// One exclusive remote execution channel.
#[async_trait]
pub trait Channel: Send {
    /// Starts `command` on the remote end.
    async fn exec(&mut self, command: &str) -> Result<()>;

    /// Writes all of `data` to the remote stdin, then signals EOF.
    async fn send_stdin(&mut self, data: &[u8]) -> Result<()>;

    /// Waits for the next event. `None` once the channel is drained.
    ///
    /// Must be cancel safe, it is raced against caller cancellation.
    async fn wait(&mut self) -> Option<ChannelEvent>;

    /// Asks the remote process to stop.
    async fn interrupt(&mut self) -> Result<()>;

    /// Closes the channel.
    async fn close(&mut self) -> Result<()>;
}

/// A connected handle able to open execution channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a fresh channel.
    async fn open_channel(&self) -> Result<Box<dyn Channel>>;

    /// Whether the underlying connection is gone and must be re-established.
    fn is_closed(&self) -> bool;

    /// Tears down the connection.
    async fn close(&self) -> Result<()>;
}

/// Produces connected transports.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError>;
}

#[async_trait]
impl<C> Connect for Arc<C>
where
    C: Connect + ?Sized,
{
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        (**self).connect().await
    }
}

// Errors ---------------------------------------------------------------------

/// Failure establishing a transport.
///
/// Cloneable so that a [`CircuitBreaker`] can hand the same failure to every
/// caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("unable to dial {addr}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("ssh handshake with {addr} failed")]
    Handshake {
        addr: String,
        #[source]
        source: Arc<russh::Error>,
    },

    #[error("host key presented by {addr} does not match the expected key")]
    HostKeyMismatch { addr: String },

    #[error("authentication as {user} at {addr} failed: {detail}")]
    Auth {
        user: String,
        addr: String,
        detail: String,
    },

    #[error("unable to reach {target} through proxy {proxy}")]
    Proxy {
        proxy: String,
        target: String,
        #[source]
        source: Box<ConnectError>,
    },

    #[error("invalid connection parameters: {0}")]
    Config(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Whether another attempt may succeed without changing anything.
    ///
    /// Only network-level failures and handshakes cut short by a remote that
    /// is not ready yet qualify. Credentials and host keys never do.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Dial { source, .. } => is_transient_io(source),
            Self::Timeout { .. } => true,
            Self::Handshake { source, .. } => match source.as_ref() {
                russh::Error::Disconnect
                | russh::Error::HUP
                | russh::Error::ConnectionTimeout => true,
                russh::Error::IO(error) => is_transient_io(error),
                _other => false,
            },
            Self::Proxy { source, .. } => source.is_transient(),
            Self::HostKeyMismatch { .. }
            | Self::Auth { .. }
            | Self::Config(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether the failure is about credentials or host identity rather than
    /// the network.
    #[must_use]
    pub fn is_credential_problem(&self) -> bool {
        match self {
            Self::Auth { .. } | Self::HostKeyMismatch { .. } => true,
            Self::Proxy { source, .. } => source.is_credential_problem(),
            _other => false,
        }
    }
}

fn is_transient_io(error: &io::Error) -> bool {
    use io::ErrorKind as K;
    matches!(
        error.kind(),
        K::ConnectionRefused
            | K::ConnectionReset
            | K::ConnectionAborted
            | K::NotConnected
            | K::AddrNotAvailable
            | K::BrokenPipe
            | K::TimedOut
            | K::UnexpectedEof
            | K::Interrupted
    )
}

// Parameters -----------------------------------------------------------------

/// Everything needed to reach and log into one SSH endpoint.
#[derive(Debug, Clone, Builder)]
pub struct ConnectSpec {
    /// `host` or `host:port`. IPv6 literals go in brackets.
    #[builder(into)]
    pub addr: String,

    #[builder(into)]
    pub user: String,

    /// Tried in order until one succeeds.
    #[builder(default)]
    pub auth: Vec<AuthMethod>,

    pub host_key: HostKeyPolicy,

    /// Applies to dialing and to the handshake, per attempt.
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,

    /// Hop to tunnel through before reaching `addr`.
    pub proxy: Option<Box<ConnectSpec>>,
}

impl ConnectSpec {
    /// Splits [`Self::addr`] into host and port.
    ///
    /// # Errors
    ///
    /// If the port is not a number.
    pub fn host_port(&self) -> Result<(String, u16), ConnectError> {
        split_host_port(&self.addr)
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), ConnectError> {
    let invalid = || ConnectError::Config(format!("invalid address: {addr}"));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_owned(), port));
    }

    match addr.rsplit_once(':') {
        // more than one colon without brackets is a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((addr.to_owned(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_owned(), port.parse().map_err(|_| invalid())?)),
        None if addr.is_empty() => Err(invalid()),
        None => Ok((addr.to_owned(), DEFAULT_PORT)),
    }
}

/// Credentials offered during the handshake.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    /// OpenSSH or PEM encoded private key.
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    /// Private key plus the OpenSSH certificate signed for it.
    Certificate { key: String, cert: String },
    /// Keys held by an SSH agent. When `identities` is non-empty only agent
    /// keys matching one of these OpenSSH public keys are offered.
    Agent {
        socket: Option<String>,
        identities: Vec<String>,
    },
}

impl AuthMethod {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "publickey",
            Self::Certificate { .. } => "certificate",
            Self::Agent { .. } => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Certificate { cert, .. } => f
                .debug_struct("Certificate")
                .field("key", &"<redacted>")
                .field("cert", cert)
                .finish(),
            Self::Agent { socket, identities } => f
                .debug_struct("Agent")
                .field("socket", socket)
                .field("identities", identities)
                .finish(),
        }
    }
}

/// How the server's host key is verified.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Only this key is accepted.
    Fixed(russh::keys::PublicKey),
    /// Any key is accepted. Must be opted into explicitly.
    Insecure,
}

impl HostKeyPolicy {
    /// Parses an OpenSSH public key line, e.g. `ssh-ed25519 AAAA... comment`.
    ///
    /// # Errors
    ///
    /// If the key cannot be parsed.
    pub fn fixed(openssh: &str) -> Result<Self, ConnectError> {
        russh::keys::PublicKey::from_openssh(openssh.trim())
            .map(Self::Fixed)
            .map_err(|error| ConnectError::Config(format!("invalid host key: {error}")))
    }
}

// Pipeline -------------------------------------------------------------------

/// Knobs for [`pipeline`].
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Retry transient failures with this policy. `None` disables retries.
    pub retry: Option<Backoff>,
}

/// Builds the standard connector stack for `spec`:
/// circuit breaker, then optional retry, then the SSH connector.
#[must_use]
pub fn pipeline(spec: ConnectSpec, options: PipelineOptions) -> Arc<dyn Connect> {
    let ssh = SshConnector::new(spec);
    match options.retry {
        Some(backoff) => Arc::new(CircuitBreaker::new(Retry::new(ssh, backoff))),
        None => Arc::new(CircuitBreaker::new(ssh)),
    }
}

// Tests ----------------------------------------------------------------------
