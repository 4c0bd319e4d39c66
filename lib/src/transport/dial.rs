//! Raw byte streams the SSH handshake runs over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::proxy::Proxy;
use super::ConnectError;
use super::SshTransport;

/// Bytestreams that an SSH session can be established over.
pub enum Stream {
    /// Direct TCP connection.
    Tcp(TcpStream),
    /// Tunnel through an established SSH connection. The hop is kept so it
    /// outlives the stream.
    Tunnel {
        stream: russh::ChannelStream<russh::client::Msg>,
        hop: Arc<SshTransport>,
    },
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(tcp) => f.debug_tuple("Tcp").field(tcp).finish(),
            Self::Tunnel { hop, .. } => f.debug_struct("Tunnel").field("hop", &hop.addr()).finish(),
        }
    }
}

/// Sets up the stream to a target.
#[async_trait]
#[enum_dispatch]
pub trait Dialer {
    async fn dial(&self) -> Result<Stream, ConnectError>;
}

/// All dialer implementations.
#[enum_dispatch(Dialer)]
#[derive(Debug, Clone)]
pub enum DialerImpl {
    Direct(Direct),
    Proxy(Proxy),
}

// Direct ---------------------------------------------------------------------

/// Dials TCP connections straight to the target.
#[derive(Debug, Clone)]
pub struct Direct {
    addr: String,
    connect_timeout: Duration,
}

impl Direct {
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for Direct {
    async fn dial(&self) -> Result<Stream, ConnectError> {
        let (host, port) = super::split_host_port(&self.addr)?;
        debug!(addr = %self.addr, "dialing");

        let tcp = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_elapsed| ConnectError::Timeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|error| ConnectError::Dial {
                addr: self.addr.clone(),
                source: Arc::new(error),
            })?;

        // SSH is chatty with small packets
        if let Err(error) = tcp.set_nodelay(true) {
            debug!(?error, "unable to set TCP_NODELAY");
        }

        Ok(Stream::Tcp(tcp))
    }
}
