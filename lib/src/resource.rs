//! Clients reading and changing one kind of host state each.
//!
//! Every operation is a single remote invocation built by
//! [`crate::protocol::Script`]. Its exit code is looked up in the client's
//! sentinel table and turned into either a parsed record or a
//! [`ResourceError`].

pub mod file;
pub mod folder;
mod fs;
pub mod group;
pub mod link;
pub mod package;
pub mod service;
pub mod user;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use self::file::FileClient;
pub use self::folder::FolderClient;
pub use self::group::GroupClient;
pub use self::link::LinkClient;
pub use self::package::PackageClient;
pub use self::service::ServiceClient;
pub use self::user::UserClient;
pub use crate::protocol::Conflict;
use crate::protocol::Meaning;
use crate::protocol::ParseError;
use crate::protocol::Sentinel;
use crate::session::Command;
use crate::session::CommandResult;
use crate::session::ExecError;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    File,
    Folder,
    Link,
    User,
    Group,
    Service,
    Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Get,
    Create,
    Update,
    Delete,
}

// Errors ---------------------------------------------------------------------

/// Why a resource operation failed.
#[derive(Debug, thiserror::Error)]
pub enum Cause {
    #[error("not found")]
    NotFound,

    #[error("{0} already in use")]
    AlreadyExists(Conflict),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{summary}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Unexpected {
        summary: String,
        detail: Option<String>,
    },

    #[error("still transitioning after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Failure of one operation on one resource. Test the family with
/// [`ResourceError::kind`] and the specific reason with
/// [`ResourceError::cause`].
#[derive(Debug, thiserror::Error)]
#[error("unable to {op} {kind} {id}")]
pub struct ResourceError {
    pub kind: ResourceKind,
    pub op: Operation,
    pub id: String,
    #[source]
    pub cause: Cause,
}

impl ResourceError {
    #[must_use]
    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.cause, Cause::NotFound)
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self.cause, Cause::AlreadyExists(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.cause, Cause::Exec(error) if error.is_cancelled())
    }

    /// Whether the caller can fix this by changing its input or credentials,
    /// as opposed to a broken remote or a bug.
    #[must_use]
    pub fn is_user_correctable(&self) -> bool {
        match &self.cause {
            Cause::NotFound | Cause::AlreadyExists(_) | Cause::PreconditionFailed(_) => true,
            Cause::Exec(ExecError::Connect(error)) => error.is_credential_problem(),
            Cause::Unexpected { .. } | Cause::Timeout(_) | Cause::Exec(_) => false,
        }
    }
}

// Calls ----------------------------------------------------------------------

/// Identity of one operation, used to run it and to build its errors.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    kind: ResourceKind,
    op: Operation,
    id: String,
}

impl Call {
    pub(crate) fn new(kind: ResourceKind, op: Operation, id: impl fmt::Display) -> Self {
        Self {
            kind,
            op,
            id: id.to_string(),
        }
    }

    pub(crate) fn error(&self, cause: Cause) -> ResourceError {
        ResourceError {
            kind: self.kind,
            op: self.op,
            id: self.id.clone(),
            cause,
        }
    }

    pub(crate) fn unexpected(&self, summary: impl Into<String>, detail: String) -> ResourceError {
        self.error(Cause::Unexpected {
            summary: summary.into(),
            detail: (!detail.is_empty()).then_some(detail),
        })
    }

    pub(crate) fn malformed(&self, error: &ParseError) -> ResourceError {
        self.unexpected("unexpected remote output", error.to_string())
    }

    /// Executes `command` and maps its exit code through `S`. Only a
    /// successful result is returned.
    pub(crate) async fn run<S: Sentinel>(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        command: Command,
    ) -> Result<CommandResult, ResourceError> {
        debug!(kind = %self.kind, op = %self.op, id = %self.id, "running");
        let result = session
            .execute(cancel, command)
            .await
            .map_err(|error| self.error(Cause::Exec(error)))?;

        let Some(code) = S::from_exit(result.exit_status) else {
            return Err(self.unexpected(
                format!("unknown exit status {}", result.exit_status),
                result.stderr_lossy(),
            ));
        };

        match code.meaning() {
            Meaning::Success => Ok(result),
            Meaning::Failure => Err(self.unexpected("remote command failed", result.stderr_lossy())),
            Meaning::NotFound => Err(self.error(Cause::NotFound)),
            Meaning::Conflict(conflict) => Err(self.error(Cause::AlreadyExists(conflict))),
            Meaning::Precondition(reason) => Err(self.error(Cause::PreconditionFailed(reason.into()))),
        }
    }

    /// Like [`Call::run`] for deletes, where a missing resource is the
    /// desired end state.
    pub(crate) async fn run_delete<S: Sentinel>(
        &self,
        session: &Session,
        cancel: &CancellationToken,
        command: Command,
    ) -> Result<(), ResourceError> {
        match self.run::<S>(session, cancel, command).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => {
                debug!(kind = %self.kind, id = %self.id, "already absent");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

/// Serializes bytes as lossy UTF-8.
pub(crate) fn serialize_lossy<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::sentinel_table;
    use crate::testing::CountingConnector;
    use crate::testing::ScriptedConnector;
    use crate::transport::ConnectError;

    sentinel_table! {
        enum TestExit {
            Ok = 0 => Meaning::Success,
            Failed = 1 => Meaning::Failure,
            Taken = 4 => Meaning::Conflict(Conflict::Id),
            Missing = 6 => Meaning::Precondition("group missing"),
            Gone = 17 => Meaning::NotFound,
        }
    }

    fn call() -> Call {
        Call::new(ResourceKind::User, Operation::Create, 1000)
    }

    #[tokio::test]
    async fn maps_sentinels() {
        let remote = ScriptedConnector::default()
            .reply(0, "ok")
            .reply(4, "")
            .reply(6, "")
            .reply(17, "")
            .reply_with(CommandResult {
                exit_status: 1,
                stderr: b"useradd: boom\n".to_vec(),
                ..CommandResult::default()
            })
            .reply(42, "");
        let session = remote.session();
        let cancel = CancellationToken::new();
        let call = call();
        let run = || call.run::<TestExit>(&session, &cancel, Command::new("x"));

        assert_eq!(run().await.unwrap().stdout, b"ok");

        let taken = run().await.unwrap_err();
        assert!(taken.is_already_exists());
        assert!(taken.is_user_correctable());
        assert_eq!(taken.cause.to_string(), "id already in use");

        let missing = run().await.unwrap_err();
        assert!(matches!(missing.cause, Cause::PreconditionFailed(ref r) if r == "group missing"));

        assert!(run().await.unwrap_err().is_not_found());

        let failed = run().await.unwrap_err();
        assert!(!failed.is_user_correctable());
        assert_eq!(failed.cause.to_string(), "remote command failed: useradd: boom");
        assert_eq!(failed.to_string(), "unable to create user 1000");

        let unknown = run().await.unwrap_err();
        assert!(matches!(unknown.cause, Cause::Unexpected { ref summary, detail: None } if summary == "unknown exit status 42"));
    }

    #[tokio::test]
    async fn delete_treats_missing_as_done() {
        let remote = ScriptedConnector::default().reply(17, "").reply(0, "");
        let session = remote.session();
        let cancel = CancellationToken::new();
        let call = Call::new(ResourceKind::User, Operation::Delete, 1000);

        call.run_delete::<TestExit>(&session, &cancel, Command::new("x"))
            .await
            .unwrap();
        call.run_delete::<TestExit>(&session, &cancel, Command::new("x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn credential_failures_are_user_correctable() {
        let inner = CountingConnector::failing_then_ok(1, CountingConnector::denied);
        let session = Session::builder().connector(Arc::new(inner)).build();
        let error = call()
            .run::<TestExit>(&session, &CancellationToken::new(), Command::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(
            error.cause,
            Cause::Exec(ExecError::Connect(ConnectError::Auth { .. }))
        ));
        assert!(error.is_user_correctable());
    }
}
