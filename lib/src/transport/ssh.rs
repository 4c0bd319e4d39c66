use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::PrivateKeyWithHashAlg;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use super::dial::Dialer;
use super::dial::DialerImpl;
use super::dial::Direct;
use super::dial::Stream;
use super::proxy::Proxy;
use super::AuthMethod;
use super::Channel;
use super::ChannelEvent;
use super::Connect;
use super::ConnectError;
use super::ConnectSpec;
use super::HostKeyPolicy;
use super::Transport;

// Connector ------------------------------------------------------------------

/// Dials the target and runs the SSH handshake and authentication on top.
#[derive(Debug, Clone)]
pub struct SshConnector {
    spec: ConnectSpec,
    dialer: DialerImpl,
}

impl SshConnector {
    #[must_use]
    pub fn new(spec: ConnectSpec) -> Self {
        let dialer = match &spec.proxy {
            Some(hop) => Proxy::new(SshConnector::new((**hop).clone()), spec.addr.clone()).into(),
            None => Direct::new(spec.addr.clone(), spec.timeout).into(),
        };
        Self { spec, dialer }
    }

    #[must_use]
    pub fn spec(&self) -> &ConnectSpec {
        &self.spec
    }

    /// Like [`Connect::connect`] but keeps the concrete type, which proxies
    /// need to open tunnels.
    ///
    /// # Errors
    ///
    /// If dialing, the handshake, or every authentication method fails.
    #[instrument(skip_all, fields(addr = %self.spec.addr, user = %self.spec.user))]
    pub async fn connect_ssh(&self) -> Result<SshTransport, ConnectError> {
        let stream = self.dialer.dial().await?;

        let (mut handle, hop) = match stream {
            Stream::Tcp(tcp) => (self.handshake(tcp).await?, None),
            Stream::Tunnel { stream, hop } => (self.handshake(stream).await?, Some(hop)),
        };

        self.authenticate(&mut handle).await?;
        debug!("ssh session established");

        Ok(SshTransport {
            addr: self.spec.addr.clone(),
            handle,
            _hop: hop,
        })
    }

    async fn handshake<R>(&self, stream: R) -> Result<Handle<SshClientHandler>, ConnectError>
    where
        R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::new(russh::client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(10)),
            ..Default::default()
        });

        let handler = SshClientHandler {
            host_key: self.spec.host_key.clone(),
            server_banner: None,
        };

        let handle = tokio::time::timeout(
            self.spec.timeout,
            russh::client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_elapsed| ConnectError::Timeout {
            addr: self.spec.addr.clone(),
            timeout: self.spec.timeout,
        })?;

        handle.map_err(|error| match error {
            russh::Error::UnknownKey => ConnectError::HostKeyMismatch {
                addr: self.spec.addr.clone(),
            },
            other => ConnectError::Handshake {
                addr: self.spec.addr.clone(),
                source: Arc::new(other),
            },
        })
    }

    /// Tries every configured method in order and returns on the first
    /// success.
    async fn authenticate(
        &self,
        session: &mut Handle<SshClientHandler>,
    ) -> Result<(), ConnectError> {
        let user = self.spec.user.as_str();

        if self.spec.auth.is_empty() {
            let result = session
                .authenticate_none(user)
                .await
                .map_err(|error| self.handshake_error(error))?;
            if result.success() {
                return Ok(());
            }
            return Err(self.auth_error("no authentication methods configured".into()));
        }

        let mut failures = Vec::new();
        for method in &self.spec.auth {
            let outcome = match method {
                AuthMethod::Password(password) => auth_password(session, user, password).await,
                AuthMethod::PrivateKey { key, passphrase } => {
                    auth_ssh_key(session, user, key, passphrase.as_deref()).await
                }
                AuthMethod::Certificate { key, cert } => {
                    auth_ssh_cert(session, user, key, cert).await
                }
                AuthMethod::Agent { socket, identities } => {
                    auth_ssh_agent(session, user, socket.as_deref(), identities).await
                }
            };
            match outcome {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(method = method.name(), "ssh auth denied");
                    failures.push(format!("{}: denied", method.name()));
                }
                Err(AuthFailure::Credential(detail)) => {
                    warn!(method = method.name(), %detail, "ssh auth method unusable");
                    failures.push(format!("{}: {detail}", method.name()));
                }
                Err(AuthFailure::Protocol(error)) => return Err(self.handshake_error(error)),
            }
        }

        Err(self.auth_error(failures.join(", ")))
    }

    fn auth_error(&self, detail: String) -> ConnectError {
        ConnectError::Auth {
            user: self.spec.user.clone(),
            addr: self.spec.addr.clone(),
            detail,
        }
    }

    fn handshake_error(&self, error: russh::Error) -> ConnectError {
        ConnectError::Handshake {
            addr: self.spec.addr.clone(),
            source: Arc::new(error),
        }
    }
}

#[async_trait]
impl Connect for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        let transport = self.connect_ssh().await?;
        Ok(Arc::new(transport))
    }
}

// Auth -----------------------------------------------------------------------

/// Why an auth method could not be evaluated.
enum AuthFailure {
    /// Bad or unusable credential material, try the next method.
    Credential(String),
    /// The session itself broke.
    Protocol(russh::Error),
}

impl From<russh::Error> for AuthFailure {
    fn from(value: russh::Error) -> Self {
        Self::Protocol(value)
    }
}

async fn auth_password(
    session: &mut Handle<SshClientHandler>,
    user: &str,
    password: &str,
) -> Result<bool, AuthFailure> {
    let result = session.authenticate_password(user, password).await?;
    Ok(result.success())
}

async fn auth_ssh_key(
    session: &mut Handle<SshClientHandler>,
    user: &str,
    private_key: &str,
    passphrase: Option<&str>,
) -> Result<bool, AuthFailure> {
    let key = russh::keys::decode_secret_key(private_key, passphrase)
        .map_err(|error| AuthFailure::Credential(format!("unable to decode key: {error}")))?;
    let hash_alg = match key.algorithm() {
        russh::keys::Algorithm::Rsa { hash } => hash,
        _else => None,
    };
    let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    let result = session.authenticate_publickey(user, key).await?;
    Ok(result.success())
}

async fn auth_ssh_cert(
    session: &mut Handle<SshClientHandler>,
    user: &str,
    private_key: &str,
    cert: &str,
) -> Result<bool, AuthFailure> {
    let key = russh::keys::decode_secret_key(private_key, None)
        .map_err(|error| AuthFailure::Credential(format!("unable to decode key: {error}")))?;
    let cert = russh::keys::Certificate::from_openssh(cert.trim())
        .map_err(|error| AuthFailure::Credential(format!("unable to parse certificate: {error}")))?;

    let result = session
        .authenticate_openssh_cert(user, Arc::new(key), cert)
        .await?;
    Ok(result.success())
}

/// Iterates through the identities found in the SSH agent, optionally
/// narrowed to `identities`, and returns on the first success.
async fn auth_ssh_agent(
    session: &mut Handle<SshClientHandler>,
    user: &str,
    socket: Option<&str>,
    identities: &[String],
) -> Result<bool, AuthFailure> {
    let socket = match socket {
        Some(socket) => socket.to_owned(),
        None => std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| AuthFailure::Credential("SSH_AUTH_SOCK is not set".into()))?,
    };

    let wanted = identities
        .iter()
        .map(|line| russh::keys::PublicKey::from_openssh(line.trim()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| AuthFailure::Credential(format!("invalid identity filter: {error}")))?;

    let mut agent = russh::keys::agent::client::AgentClient::connect_uds(&socket)
        .await
        .map_err(|error| AuthFailure::Credential(format!("unable to reach agent: {error}")))?;
    let keys = agent
        .request_identities()
        .await
        .map_err(|error| AuthFailure::Credential(format!("unable to list agent keys: {error}")))?;

    for key in keys {
        if !wanted.is_empty() && !wanted.iter().any(|w| w.key_data() == key.key_data()) {
            continue;
        }
        let fingerprint = key.fingerprint(Default::default());
        let hash_alg = match key.algorithm() {
            russh::keys::Algorithm::Rsa { hash } => hash,
            _else => None,
        };
        let result = session
            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
            .await;
        match result {
            Ok(auth_result) if auth_result.success() => return Ok(true),
            Ok(_denied) => debug!(%user, key = %fingerprint, "ssh agent auth denied"),
            Err(error) => warn!(?error, key = %fingerprint, "ssh agent auth failed"),
        }
    }

    Ok(false)
}

// Transport ------------------------------------------------------------------

/// An authenticated SSH connection.
pub struct SshTransport {
    addr: String,
    handle: Handle<SshClientHandler>,
    _hop: Option<Arc<SshTransport>>,
}

impl SshTransport {
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Opens a `direct-tcpip` channel from the remote end to `host:port`.
    ///
    /// # Errors
    ///
    /// If the remote refuses the forward.
    pub async fn tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<russh::ChannelStream<russh::client::Msg>, russh::Error> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?;
        Ok(channel.into_stream())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_channel(&self) -> Result<Box<dyn Channel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("unable to open ssh session channel")?;
        Ok(Box::new(SshChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

// Channel --------------------------------------------------------------------

struct SshChannel {
    channel: russh::Channel<russh::client::Msg>,
}

#[async_trait]
impl Channel for SshChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        self.channel.exec(true, command).await?;
        Ok(())
    }

    async fn send_stdin(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await?;
        self.channel.eof().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Option<ChannelEvent> {
        loop {
            let msg = self.channel.wait().await?;
            let event = match msg {
                russh::ChannelMsg::Data { ref data } => ChannelEvent::Stdout(data.to_vec()),
                russh::ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    ChannelEvent::Stderr(data.to_vec())
                }
                russh::ChannelMsg::ExitStatus { exit_status } => ChannelEvent::Exit(exit_status),
                russh::ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::Signal(format!("{signal_name:?}"))
                }
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn interrupt(&mut self) -> Result<()> {
        self.channel.signal(russh::Sig::INT).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.close().await?;
        Ok(())
    }
}

// russh details --------------------------------------------------------------

#[derive(Debug)]
pub struct SshClientHandler {
    host_key: HostKeyPolicy,
    server_banner: Option<String>,
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.host_key {
            HostKeyPolicy::Insecure => Ok(true),
            HostKeyPolicy::Fixed(expected) => {
                let matches = expected.key_data() == server_public_key.key_data();
                if !matches {
                    let fingerprint = server_public_key.fingerprint(Default::default());
                    warn!(%fingerprint, "unexpected host key");
                }
                Ok(matches)
            }
        }
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        debug!(%banner, "ssh auth banner");
        self.server_banner = Some(banner.to_owned());
        Ok(())
    }
}
