use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use clap::Args;
use hostform::transport::pipeline;
use hostform::transport::Backoff;
use hostform::transport::Connect;
use hostform::transport::ConnectSpec;
use hostform::transport::HostKeyPolicy;
use hostform::transport::PipelineOptions;

use super::AuthArgs;
use super::ProxyArgs;

const HEADING: Option<&str> = Some("Connection Options");

/// Where to connect and how.
#[derive(Debug, Args, Clone)]
pub struct ConnectionArgs {
    /// Target host, as host or host:port.
    #[arg(short = 'H', long, env = "HOSTFORM_HOST", help_heading = HEADING)]
    pub host: String,

    /// Expected host key, as an OpenSSH public key line.
    #[arg(long, env = "HOSTFORM_HOST_KEY", help_heading = HEADING)]
    pub host_key: Option<String>,

    /// Accept any host key.
    #[arg(long, conflicts_with = "host_key", help_heading = HEADING)]
    pub insecure: bool,

    /// Time to allow dialing and the handshake, per attempt.
    #[arg(long, default_value = "10s", help_heading = HEADING)]
    pub connect_timeout: humantime::Duration,

    /// Attempts made on transient connection failures. 1 disables retries.
    #[arg(long, default_value_t = 6, help_heading = HEADING)]
    pub connect_attempts: u32,

    #[clap(flatten)]
    pub auth: AuthArgs,

    #[clap(flatten)]
    pub proxy: ProxyArgs,
}

impl ConnectionArgs {
    /// The standard connector stack for the target.
    pub fn connector(&self) -> Result<Arc<dyn Connect>> {
        let timeout = self.connect_timeout.into();
        let spec = ConnectSpec::builder()
            .addr(&self.host)
            .user(&self.auth.user)
            .auth(self.auth.methods()?)
            .host_key(host_key_policy(self.host_key.as_deref(), self.insecure)?)
            .timeout(timeout)
            .maybe_proxy(self.proxy.spec(&self.auth, timeout)?.map(Box::new))
            .build();

        let retry = (self.connect_attempts > 1).then(|| Backoff {
            max_attempts: self.connect_attempts,
            ..Backoff::default()
        });
        Ok(pipeline(spec, PipelineOptions { retry }))
    }
}

pub(super) fn host_key_policy(key: Option<&str>, insecure: bool) -> Result<HostKeyPolicy> {
    match (key, insecure) {
        (Some(key), _) => Ok(HostKeyPolicy::fixed(key)?),
        (None, true) => Ok(HostKeyPolicy::Insecure),
        (None, false) => bail!("a host key is required, pass --insecure to accept any"),
    }
}
