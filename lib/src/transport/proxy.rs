use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::dial::Dialer;
use super::dial::Stream;
use super::ConnectError;
use super::SshConnector;

/// Reaches the target through a bastion.
///
/// The hop is fully established first, then a `direct-tcpip` channel to the
/// target is opened through it and handed out as the stream.
#[derive(Debug, Clone)]
pub struct Proxy {
    hop: Box<SshConnector>,
    target: String,
}

impl Proxy {
    #[must_use]
    pub fn new(hop: SshConnector, target: impl Into<String>) -> Self {
        Self {
            hop: Box::new(hop),
            target: target.into(),
        }
    }

    fn wrap(&self, source: ConnectError) -> ConnectError {
        ConnectError::Proxy {
            proxy: self.hop.spec().addr.clone(),
            target: self.target.clone(),
            source: Box::new(source),
        }
    }
}

#[async_trait]
impl Dialer for Proxy {
    async fn dial(&self) -> Result<Stream, ConnectError> {
        let (host, port) = super::split_host_port(&self.target)?;

        let hop = self.hop.connect_ssh().await.map_err(|error| self.wrap(error))?;
        debug!(proxy = %hop.addr(), target = %self.target, "opening tunnel");

        let stream = hop.tunnel(&host, port).await.map_err(|error| {
            self.wrap(ConnectError::Handshake {
                addr: hop.addr().to_owned(),
                source: Arc::new(error),
            })
        })?;

        Ok(Stream::Tunnel {
            stream,
            hop: Arc::new(hop),
        })
    }
}
