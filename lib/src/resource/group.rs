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
    /// Exit codes of group scripts. 4 and 9 match `groupadd` and `groupmod`.
    pub enum GroupExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        GidInUse = 4 => Meaning::Conflict(Conflict::Id),
        NameInUse = 9 => Meaning::Conflict(Conflict::Name),
        NotFound = 17 => Meaning::NotFound,
    }
}

#[derive(Debug, Clone, Builder)]
pub struct GroupSpec {
    #[builder(into)]
    pub name: String,
    pub gid: u32,
}

/// The gid is immutable, a group can only be renamed.
#[derive(Debug, Clone, Default, Builder)]
pub struct GroupUpdate {
    #[builder(into)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRecord {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

impl GroupRecord {
    fn parse(output: &str) -> Result<Self, ParseError> {
        let line = getent::single_line(output)?;
        let [name, _, gid, members] = getent::fields::<{ getent::GROUP_FIELDS }>(line)?;
        Ok(Self {
            name: name.to_owned(),
            gid: field("gid", gid)?,
            members: getent::members(members),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroupClient {
    session: Arc<Session>,
}

impl GroupClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] if no group has `gid`.
    #[instrument(skip(self, cancel))]
    pub async fn get(&self, cancel: &CancellationToken, gid: u32) -> Result<GroupRecord, ResourceError> {
        let call = Call::new(ResourceKind::Group, Operation::Get, gid);
        let script = Script::new()
            .param("gid", gid)
            .check(EXISTS, GroupExit::NotFound)
            .readback(READBACK);
        self.run(cancel, &call, script).await
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::AlreadyExists`] if the gid or name is
    /// taken.
    #[instrument(skip_all, fields(name = %spec.name, gid = spec.gid))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        spec: GroupSpec,
    ) -> Result<GroupRecord, ResourceError> {
        let call = Call::new(ResourceKind::Group, Operation::Create, spec.gid);
        let script = Script::new()
            .param("gid", spec.gid)
            .param("name", &spec.name)
            .check(format!("! {EXISTS}"), GroupExit::GidInUse)
            .check(r#"! getent group "$name" >/dev/null"#, GroupExit::NameInUse)
            .step(Step::run(remap(
                r#"groupadd -g "$gid" "$name""#,
                &[GroupExit::GidInUse, GroupExit::NameInUse],
            )))
            .readback(READBACK);
        self.run(cancel, &call, script).await
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] if no group has `gid`,
    /// [`crate::resource::Cause::AlreadyExists`] if the new name is taken.
    #[instrument(skip(self, cancel, update))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        gid: u32,
        update: GroupUpdate,
    ) -> Result<GroupRecord, ResourceError> {
        let call = Call::new(ResourceKind::Group, Operation::Update, gid);
        let mut script = Script::new().param("gid", gid).check(EXISTS, GroupExit::NotFound);
        if let Some(name) = &update.name {
            script = script
                .param("name", name)
                .check(
                    r#"[ "$(getent group "$name" | cut -d: -f3)" = "$gid" ] || ! getent group "$name" >/dev/null"#,
                    GroupExit::NameInUse,
                )
                .step(
                    Step::run(remap(r#"groupmod -n "$name" "$_current""#, &[GroupExit::NameInUse]))
                        .capture("current", CURRENT_NAME),
                );
        }
        self.run(cancel, &call, script.readback(READBACK)).await
    }

    /// A missing group counts as removed.
    ///
    /// # Errors
    ///
    /// If `groupdel` fails, e.g. because the group is some user's primary
    /// group.
    #[instrument(skip(self, cancel))]
    pub async fn delete(&self, cancel: &CancellationToken, gid: u32) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::Group, Operation::Delete, gid);
        let script = Script::new()
            .param("gid", gid)
            .check(EXISTS, GroupExit::NotFound)
            .step(
                Step::run(remap::<GroupExit>(r#"groupdel "$_current""#, &[]))
                    .capture("current", CURRENT_NAME),
            );
        call.run_delete::<GroupExit>(&self.session, cancel, script.into_command())
            .await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
    ) -> Result<GroupRecord, ResourceError> {
        let result = call
            .run::<GroupExit>(&self.session, cancel, script.into_command())
            .await?;
        GroupRecord::parse(&String::from_utf8_lossy(&result.stdout))
            .map_err(|error| call.malformed(&error))
    }
}

const EXISTS: &str = r#"getent group "$gid" >/dev/null"#;

const READBACK: &str = r#"getent group "$gid""#;

const CURRENT_NAME: &str = r#"getent group "$gid" | cut -d: -f1"#;
