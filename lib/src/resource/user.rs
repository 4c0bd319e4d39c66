use std::sync::Arc;

use bon::Builder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::Call;
use super::Operation;
use super::ResourceError;
use super::ResourceKind;
use crate::protocol::field;
use crate::protocol::getent;
use crate::protocol::remap;
use crate::protocol::sentinel_table;
use crate::protocol::ParseError;
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of user scripts. 4, 6 and 9 match `useradd` and `usermod`.
    pub enum UserExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        UidInUse = 4 => Meaning::Conflict(Conflict::Id),
        GroupNotFound = 6 => Meaning::Precondition("primary group not found"),
        NameInUse = 9 => Meaning::Conflict(Conflict::Name),
        NotFound = 17 => Meaning::NotFound,
    }
}

const WRAPPED: [UserExit; 3] = [UserExit::UidInUse, UserExit::GroupNotFound, UserExit::NameInUse];

#[derive(Debug, Clone, Builder)]
pub struct UserSpec {
    #[builder(into)]
    pub name: String,
    pub uid: u32,
    /// Primary group, by name or gid.
    #[builder(into)]
    pub group: String,
    #[builder(into)]
    pub gecos: Option<String>,
    #[builder(into)]
    pub home: Option<String>,
    #[builder(into)]
    pub shell: Option<String>,
    /// Create the home directory.
    #[builder(default)]
    pub create_home: bool,
}

/// Changes to a user. The uid is the identity and never changes.
#[derive(Debug, Clone, Default, Builder)]
pub struct UserUpdate {
    #[builder(into)]
    pub name: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
    #[builder(into)]
    pub gecos: Option<String>,
    #[builder(into)]
    pub home: Option<String>,
    #[builder(into)]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

impl UserRecord {
    fn parse(output: &str) -> Result<Self, ParseError> {
        let line = getent::single_line(output)?;
        let [name, _, uid, gid, gecos, home, shell] = getent::fields::<{ getent::PASSWD_FIELDS }>(line)?;
        Ok(Self {
            name: name.to_owned(),
            uid: field("uid", uid)?,
            gid: field("gid", gid)?,
            gecos: gecos.to_owned(),
            home: home.to_owned(),
            shell: shell.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UserClient {
    session: Arc<Session>,
}

impl UserClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] if no user has `uid`.
    #[instrument(skip(self, cancel))]
    pub async fn get(&self, cancel: &CancellationToken, uid: u32) -> Result<UserRecord, ResourceError> {
        let call = Call::new(ResourceKind::User, Operation::Get, uid);
        let script = Script::new()
            .param("uid", uid)
            .check(exists(), UserExit::NotFound)
            .readback(READBACK);
        self.run(cancel, &call, script).await
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::AlreadyExists`] if the uid or name is
    /// taken, [`crate::resource::Cause::PreconditionFailed`] if the primary
    /// group does not exist.
    #[instrument(skip_all, fields(name = %spec.name, uid = spec.uid))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        spec: UserSpec,
    ) -> Result<UserRecord, ResourceError> {
        let call = Call::new(ResourceKind::User, Operation::Create, spec.uid);

        let mut flags = vec![r#"-u "$uid" -g "$group""#];
        let mut script = Script::new()
            .param("uid", spec.uid)
            .param("name", &spec.name)
            .param("group", &spec.group);
        if let Some(gecos) = &spec.gecos {
            script = script.param("gecos", gecos);
            flags.push(r#"-c "$gecos""#);
        }
        if let Some(home) = &spec.home {
            script = script.param("home", home);
            flags.push(r#"-d "$home""#);
        }
        if let Some(shell) = &spec.shell {
            script = script.param("shell", shell);
            flags.push(r#"-s "$shell""#);
        }
        flags.push(if spec.create_home { "-m" } else { "-M" });

        let useradd = format!(r#"useradd {} "$name""#, flags.join(" "));
        let script = script
            .check(format!("! {}", exists()), UserExit::UidInUse)
            .check(r#"! getent passwd "$name" >/dev/null"#, UserExit::NameInUse)
            .check(r#"getent group "$group" >/dev/null"#, UserExit::GroupNotFound)
            .step(Step::run(remap(&useradd, &WRAPPED)))
            .readback(READBACK);
        self.run(cancel, &call, script).await
    }

    /// Applies every set field with one `usermod`.
    ///
    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] if no user has `uid`,
    /// [`crate::resource::Cause::AlreadyExists`] if the new name is taken.
    #[instrument(skip(self, cancel, update))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        uid: u32,
        update: UserUpdate,
    ) -> Result<UserRecord, ResourceError> {
        let call = Call::new(ResourceKind::User, Operation::Update, uid);

        let mut flags = Vec::new();
        let mut script = Script::new().param("uid", uid).check(exists(), UserExit::NotFound);
        if let Some(name) = &update.name {
            script = script
                .param("name", name)
                .check(
                    r#"[ "$(getent passwd "$name" | cut -d: -f3)" = "$uid" ] || ! getent passwd "$name" >/dev/null"#,
                    UserExit::NameInUse,
                );
            flags.push(r#"-l "$name""#);
        }
        if let Some(group) = &update.group {
            script = script
                .param("group", group)
                .check(r#"getent group "$group" >/dev/null"#, UserExit::GroupNotFound);
            flags.push(r#"-g "$group""#);
        }
        if let Some(gecos) = &update.gecos {
            script = script.param("gecos", gecos);
            flags.push(r#"-c "$gecos""#);
        }
        if let Some(home) = &update.home {
            script = script.param("home", home);
            flags.push(r#"-d "$home""#);
        }
        if let Some(shell) = &update.shell {
            script = script.param("shell", shell);
            flags.push(r#"-s "$shell""#);
        }

        if !flags.is_empty() {
            let usermod = format!(r#"usermod {} "$_current""#, flags.join(" "));
            script = script.step(
                Step::run(remap(&usermod, &WRAPPED)).capture("current", CURRENT_NAME),
            );
        }
        self.run(cancel, &call, script.readback(READBACK)).await
    }

    /// Removes the user. `userdel` also removes the user's primary group
    /// when no other user shares it. A missing user counts as removed.
    ///
    /// # Errors
    ///
    /// If `userdel` fails.
    #[instrument(skip(self, cancel))]
    pub async fn delete(&self, cancel: &CancellationToken, uid: u32) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::User, Operation::Delete, uid);
        let script = Script::new()
            .param("uid", uid)
            .check(exists(), UserExit::NotFound)
            .step(
                Step::run(remap::<UserExit>(r#"userdel "$_current""#, &[]))
                    .capture("current", CURRENT_NAME),
            );
        call.run_delete::<UserExit>(&self.session, cancel, script.into_command())
            .await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
    ) -> Result<UserRecord, ResourceError> {
        let result = call
            .run::<UserExit>(&self.session, cancel, script.into_command())
            .await?;
        UserRecord::parse(&String::from_utf8_lossy(&result.stdout))
            .map_err(|error| call.malformed(&error))
    }
}

const READBACK: &str = r#"getent passwd "$uid""#;

const CURRENT_NAME: &str = r#"getent passwd "$uid" | cut -d: -f1"#;

fn exists() -> String {
    r#"getent passwd "$uid" >/dev/null"#.to_owned()
}
