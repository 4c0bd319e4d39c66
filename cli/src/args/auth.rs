use anyhow::Context;
use anyhow::Result;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use clap::Args;
use hostform::transport::AuthMethod;

const HEADING: Option<&str> = Some("Authentication Options");

/// Credentials offered to the remote host, tried in the order listed here.
#[derive(Debug, Args, Clone)]
pub struct AuthArgs {
    /// Remote user to authenticate as.
    #[arg(short = 'u', long, env = "HOSTFORM_USER", default_value = "root", help_heading = HEADING)]
    pub user: String,

    /// Path to OpenSSH certificate for the SSH key.
    #[arg(long, requires = "ssh_key", help_heading = HEADING)]
    pub ssh_cert: Option<Utf8PathBuf>,

    /// Path to SSH private key.
    #[arg(long, help_heading = HEADING)]
    pub ssh_key: Option<Utf8PathBuf>,

    /// Passphrase for the SSH private key.
    #[arg(long, env = "HOSTFORM_SSH_KEY_PASSPHRASE", hide_env_values = true, help_heading = HEADING)]
    pub ssh_key_passphrase: Option<String>,

    /// Path to SSH agent socket.
    #[arg(long, env = "SSH_AUTH_SOCK", help_heading = HEADING)]
    pub ssh_agent: Option<String>,

    /// Public key file restricting which agent keys are offered. Repeatable.
    #[arg(long, help_heading = HEADING)]
    pub agent_identity: Vec<Utf8PathBuf>,

    /// Path to password file.
    #[arg(long, help_heading = HEADING)]
    pub password_file: Option<Utf8PathBuf>,
}

impl AuthArgs {
    /// Loads every configured credential.
    pub fn methods(&self) -> Result<Vec<AuthMethod>> {
        let mut methods = Vec::new();

        if let Some(key) = &self.ssh_key {
            let key = read(key)?;
            if let Some(cert) = &self.ssh_cert {
                methods.push(AuthMethod::Certificate {
                    key: key.clone(),
                    cert: read(cert)?,
                });
            }
            methods.push(AuthMethod::PrivateKey {
                key,
                passphrase: self.ssh_key_passphrase.clone(),
            });
        }

        if let Some(socket) = &self.ssh_agent {
            let identities = self
                .agent_identity
                .iter()
                .map(|path| read(path))
                .collect::<Result<_>>()?;
            methods.push(AuthMethod::Agent {
                socket: Some(socket.clone()),
                identities,
            });
        }

        if let Some(password_file) = &self.password_file {
            let password = read(password_file)?;
            methods.push(AuthMethod::Password(
                password.trim_end_matches(['\r', '\n']).to_owned(),
            ));
        }

        Ok(methods)
    }
}

fn read(path: &Utf8Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("unable to read {path}"))
}
