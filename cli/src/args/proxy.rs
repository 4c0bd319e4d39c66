use std::time::Duration;

use anyhow::Result;
use clap::Args;
use hostform::transport::ConnectSpec;

use super::connection::host_key_policy;
use super::AuthArgs;

const HEADING: Option<&str> = Some("Proxy Options");

/// Bastion host to tunnel through. It is offered the same credentials as the
/// target.
#[derive(Debug, Args, Clone)]
pub struct ProxyArgs {
    /// Bastion address, as host or host:port.
    #[arg(long, env = "HOSTFORM_PROXY", help_heading = HEADING)]
    pub proxy: Option<String>,

    /// User on the bastion [default: --user]
    #[arg(long, requires = "proxy", help_heading = HEADING)]
    pub proxy_user: Option<String>,

    /// Expected bastion host key, as an OpenSSH public key line.
    #[arg(long, env = "HOSTFORM_PROXY_HOST_KEY", requires = "proxy", help_heading = HEADING)]
    pub proxy_host_key: Option<String>,

    /// Accept any bastion host key.
    #[arg(long, requires = "proxy", help_heading = HEADING)]
    pub proxy_insecure: bool,
}

impl ProxyArgs {
    /// The hop to reach the target through, if any.
    pub fn spec(&self, auth: &AuthArgs, timeout: Duration) -> Result<Option<ConnectSpec>> {
        let Some(addr) = &self.proxy else {
            return Ok(None);
        };
        let spec = ConnectSpec::builder()
            .addr(addr)
            .user(self.proxy_user.as_ref().unwrap_or(&auth.user))
            .auth(auth.methods()?)
            .host_key(host_key_policy(
                self.proxy_host_key.as_deref(),
                self.proxy_insecure,
            )?)
            .timeout(timeout)
            .build();
        Ok(Some(spec))
    }
}
