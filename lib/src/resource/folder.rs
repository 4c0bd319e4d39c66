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
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of folder scripts.
    pub enum FolderExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        Exists = 16 => Meaning::Conflict(Conflict::Path),
        NotFound = 17 => Meaning::NotFound,
        DestinationExists = 18 => Meaning::Conflict(Conflict::Destination),
    }
}

#[derive(Debug, Clone, Builder)]
pub struct FolderSpec {
    #[builder(into)]
    pub path: Utf8PathBuf,
    pub mode: Option<u32>,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, Builder)]
pub struct FolderUpdate {
    #[builder(into)]
    pub rename: Option<Utf8PathBuf>,
    pub mode: Option<u32>,
    #[builder(into)]
    pub owner: Option<String>,
    #[builder(into)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderRecord {
    #[serde(flatten)]
    pub stat: FileStat,
}

#[derive(Debug, Clone)]
pub struct FolderClient {
    session: Arc<Session>,
}

impl FolderClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] unless `path` is a directory.
    #[instrument(skip_all, fields(%path))]
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<FolderRecord, ResourceError> {
        let call = Call::new(ResourceKind::Folder, Operation::Get, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::directory("path"), FolderExit::NotFound)
            .readback(stat::json("path"));
        self.run(cancel, &call, script, path).await
    }

    /// Creates the directory. Its parent must exist.
    ///
    /// # Errors
    ///
    /// [`crate::resource::Cause::AlreadyExists`] if anything occupies `path`.
    #[instrument(skip_all, fields(path = %spec.path))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        spec: FolderSpec,
    ) -> Result<FolderRecord, ResourceError> {
        let call = Call::new(ResourceKind::Folder, Operation::Create, &spec.path);
        let attributes = Attributes {
            mode: spec.mode,
            owner: spec.owner.as_deref(),
            group: spec.group.as_deref(),
            no_dereference: false,
        };

        let script = attributes
            .bind(Script::new().param("path", &spec.path))
            .check(fs::absent("path"), FolderExit::Exists)
            .step(Step::run(r#"mkdir -- "$path""#).undo(r#"rmdir -- "$path""#))
            .steps(attributes.steps("path", false))
            .readback(stat::json("path"));
        self.run(cancel, &call, script, &spec.path).await
    }

    /// # Errors
    ///
    /// [`crate::resource::Cause::NotFound`] unless `path` is a directory,
    /// [`crate::resource::Cause::AlreadyExists`] if the rename destination
    /// is taken.
    #[instrument(skip_all, fields(%path))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
        update: FolderUpdate,
    ) -> Result<FolderRecord, ResourceError> {
        let call = Call::new(ResourceKind::Folder, Operation::Update, path);
        let attributes = Attributes {
            mode: update.mode,
            owner: update.owner.as_deref(),
            group: update.group.as_deref(),
            no_dereference: false,
        };

        let script = attributes
            .bind(Script::new().param("path", path))
            .check(fs::directory("path"), FolderExit::NotFound)
            .steps(attributes.steps("path", true));
        let (script, target) =
            fs::rename(script, update.rename.as_deref(), FolderExit::DestinationExists);

        let final_path = update.rename.as_deref().unwrap_or(path);
        self.run(cancel, &call, script.readback(stat::json(target)), final_path)
            .await
    }

    /// Removes the directory, which must be empty. A missing directory
    /// counts as removed.
    ///
    /// # Errors
    ///
    /// If the directory is not empty or removal fails.
    #[instrument(skip_all, fields(%path))]
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        path: &Utf8Path,
    ) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::Folder, Operation::Delete, path);
        let script = Script::new()
            .param("path", path)
            .check(fs::directory("path"), FolderExit::NotFound)
            .step(Step::run(r#"rmdir -- "$path""#));
        call.run_delete::<FolderExit>(&self.session, cancel, script.into_command())
            .await
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
        path: &Utf8Path,
    ) -> Result<FolderRecord, ResourceError> {
        let result = call
            .run::<FolderExit>(&self.session, cancel, script.into_command())
            .await?;
        let output = String::from_utf8_lossy(&result.stdout);
        let stat = stat::parse_json(path, &output).map_err(|error| call.malformed(&error))?;
        Ok(FolderRecord { stat })
    }
}
