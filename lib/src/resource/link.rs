use std::sync::Arc;

use bon::Builder;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::fs;
use super::fs::Attributes;
use super::Call;
use super::Operation;
use super::ResourceError;
use super::ResourceKind;
use crate::protocol::sentinel_table;
use crate::protocol::stat;
use crate::protocol::stat::FileStat;
use crate::protocol::ParseError;
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of symlink scripts.
    pub enum LinkExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        Exists = 16 => Meaning::Conflict(Conflict::Path),
        NotFound = 17 => Meaning::NotFound,
        DestinationExists = 18 => Meaning::Conflict(Conflict::Destination),
    }
}

#[derive(Debug, Clone, Builder)]
pub struct LinkSpec {
    #[builder(into)]
    pub path: Utf8PathBuf,
    /// What the link points to. Not required to exist.
    #[builder(into)]
    pub target: Utf8PathBuf,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, Builder)]
pub struct LinkUpdate {
    #[builder(into)]
    pub rename: Option<Utf8PathBuf>,
    #[builder(into)]
    pub target: Option<Utf8PathBuf>,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRecord {
    #[serde(flatten)]
    pub stat: FileStat,
    pub target: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct LinkClient {
    session: Arc<Session>,
}

impl LinkClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] unless `path` is a symlink.
    #[instrument(skip_all, fields(%path))]
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<LinkRecord, ResourceError> {
        let call = Call::new(ResourceKind::Link, Operation::Get, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::symlink("path"), LinkExit::NotFound)
            .readback(readback("path"));
        self.run(cancel, &call, script).await
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::AlreadyExists`] if anything occupies
    /// `path`.
    #[instrument(skip_all, fields(path = %spec.path))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        spec: LinkSpec,
    ) -> Result<LinkRecord, ResourceError> {
        let call = Call::new(ResourceKind::Link, Operation::Create, &spec.path);
        let attributes = Attributes {
            mode: None,
            owner: spec.owner.as_deref(),
            group: spec.group.as_deref(),
            no_dereference: true,
        };

        let script = attributes
            .bind(
                Script::new()
                    .param("path", &spec.path)
                    .param("target", &spec.target),
            )
            .check(fs::absent("path"), LinkExit::Exists)
            .step(Step::run(r#"ln -s -- "$target" "$path""#).undo(r#"rm -f -- "$path""#))
            .steps(attributes.steps("path", false))
            .readback(readback("path"));
        self.run(cancel, &call, script).await
    }

    /// Retargets, re-owns and renames the link in one step.
    ///
    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] unless `path` is a symlink,
    /// [`crate::resource::Cause::AlreadyExists`] if the rename destination
    /// is taken.
    #[instrument(skip_all, fields(%path))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
        update: LinkUpdate,
    ) -> Result<LinkRecord, ResourceError> {
        let call = Call::new(ResourceKind::Link, Operation::Update, path);
        let attributes = Attributes {
            mode: None,
            owner: update.owner.as_deref(),
            group: update.group.as_deref(),
            no_dereference: true,
        };

        let mut script = attributes
            .bind(Script::new().param("path", path))
            .check(fs::symlink("path"), LinkExit::NotFound);
        if let Some(target) = &update.target {
            // ln -sf replaces the link in place, which resets its ownership,
            // so retarget before the attribute steps
            script = script.param("target", target).step(
                Step::run(r#"ln -sfn -- "$target" "$path""#)
                    .capture("old_target", r#"readlink -- "$path""#)
                    .undo(r#"ln -sfn -- "$_old_target" "$path""#),
            );
        }
        let script = script.steps(attributes.steps("path", true));
        let (script, target) =
            fs::rename(script, update.rename.as_deref(), LinkExit::DestinationExists);

        self.run(cancel, &call, script.readback(readback(target)))
            .await
    }

    /// Removes the link itself, never what it points to. A missing link
    /// counts as removed.
    ///
    /// # Errors
    ///
    /// If removal fails.
    #[instrument(skip_all, fields(%path))]
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::Link, Operation::Delete, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::symlink("path"), LinkExit::NotFound)
            .step(Step::run(r#"rm -f -- "$path""#));
        call.run_delete::<LinkExit>(&self.session, cancel, script.into_command())
            .await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
    ) -> Result<LinkRecord, ResourceError> {
        let result = call
            .run::<LinkExit>(&self.session, cancel, script.into_command())
            .await?;
        parse(&String::from_utf8_lossy(&result.stdout)).map_err(|error| call.malformed(&error))
    }
}

/// Prints the stat line followed by the link target.
fn readback(var: &str) -> String {
    format!(r#"{} && readlink -- "${var}""#, stat::terse(var))
}

fn parse(output: &str) -> Result<LinkRecord, ParseError> {
    let mut lines = output.lines();
    let (Some(stat), Some(target), None) = (lines.next(), lines.next(), lines.next()) else {
        return Err(ParseError::Malformed(output.to_owned()));
    };
    Ok(LinkRecord {
        stat: stat::parse_terse(stat)?,
        target: target.into(),
    })
}
