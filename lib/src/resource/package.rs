//! Package sets tracked in the apk world file.
//!
//! The world file lists every package the system should have, one per line,
//! optionally followed by a version constraint (`curl`, `musl=1.2.4-r2`,
//! `openssl>3`). Clients change only the entries they manage, then run the
//! apply command so the package manager converges on the new list.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;

use super::Call;
use super::Operation;
use super::ResourceError;
use super::ResourceKind;
use crate::protocol::sentinel_table;
use crate::protocol::ParseError;
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of package scripts.
    pub enum PackageExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        Changed = 18 => Meaning::Precondition("package list changed concurrently"),
    }
}

/// Package name to optional version constraint, operator included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PackageSet(pub BTreeMap<String, Option<String>>);

impl PackageSet {
    /// Parses world file content. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// If an entry has no name.
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let mut set = BTreeMap::new();
        for entry in content.split_whitespace() {
            let split = entry.find(['=', '<', '>', '~']).unwrap_or(entry.len());
            let (name, constraint) = entry.split_at(split);
            if name.is_empty() {
                return Err(ParseError::Malformed(entry.to_owned()));
            }
            set.insert(name.to_owned(), (!constraint.is_empty()).then(|| constraint.to_owned()));
        }
        Ok(Self(set))
    }

    /// One entry per line, sorted by name.
    #[must_use]
    pub fn render(&self) -> String {
        self.0
            .iter()
            .map(|(name, constraint)| format!("{name}{}\n", constraint.as_deref().unwrap_or_default()))
            .collect()
    }

    /// The entries of `self` whose names appear in `names`.
    #[must_use]
    pub fn restrict(&self, names: &PackageSet) -> PackageSet {
        PackageSet(
            self.0
                .iter()
                .filter(|(name, _)| names.0.contains_key(*name))
                .map(|(name, constraint)| (name.clone(), constraint.clone()))
                .collect(),
        )
    }

    /// Removes `previous` and adds `desired`, leaving other entries alone.
    #[must_use]
    pub fn replace(&self, previous: &PackageSet, desired: &PackageSet) -> PackageSet {
        let mut next = self.0.clone();
        for name in previous.0.keys() {
            next.remove(name);
        }
        next.extend(desired.0.iter().map(|(name, constraint)| (name.clone(), constraint.clone())));
        PackageSet(next)
    }
}

impl<N: Into<String>, C: Into<String>> FromIterator<(N, Option<C>)> for PackageSet {
    fn from_iter<I: IntoIterator<Item = (N, Option<C>)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, constraint)| (name.into(), constraint.map(Into::into)))
                .collect(),
        )
    }
}

/// Holds while the world file still has the content read before a change.
/// Command substitution drops trailing newlines on both sides.
const GUARD: &str = r#"[ "$(cat "$world" 2>/dev/null)" = "$(printf '%s' "$old")" ]"#;

/// Serializes every operation through one reader/writer lock, since the
/// world file is read, modified and written back.
///
/// Clones share the lock. Use one client, or clones of it, per host.
#[derive(Debug, Clone)]
pub struct PackageClient {
    session: Arc<Session>,
    world: Utf8PathBuf,
    apply: String,
    lock: Arc<RwLock<()>>,
}

impl PackageClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            world: "/etc/apk/world".into(),
            apply: "apk add".into(),
            lock: Arc::default(),
        }
    }

    /// Tracks packages in `world` and converges by running `apply`, a shell
    /// command.
    #[must_use]
    pub fn with_world(mut self, world: impl Into<Utf8PathBuf>, apply: impl Into<String>) -> Self {
        self.world = world.into();
        self.apply = apply.into();
        self
    }

    /// The entries of the world file named in `managed`.
    ///
    /// # Errors
    ///
    /// If the world file cannot be read or parsed.
    #[instrument(skip_all)]
    pub async fn get(&self, cancel: &CancellationToken, managed: &PackageSet) -> Result<PackageSet, ResourceError> {
        let _guard = self.lock.read().await;
        let call = Call::new(ResourceKind::Package, Operation::Get, &self.world);
        let (world, _) = self.read(cancel, &call).await?;
        Ok(world.restrict(managed))
    }

    /// Adds `desired` to the world file and applies it.
    ///
    /// # Errors
    ///
    /// If the world file cannot be read or written, or applying fails.
    #[instrument(skip_all)]
    pub async fn create(&self, cancel: &CancellationToken, desired: &PackageSet) -> Result<PackageSet, ResourceError> {
        let call = Call::new(ResourceKind::Package, Operation::Create, &self.world);
        self.change(cancel, &call, &PackageSet::default(), desired).await
    }

    /// Replaces the entries in `previous` with `desired` and applies it.
    ///
    /// # Errors
    ///
    /// If the world file cannot be read or written, or applying fails.
    #[instrument(skip_all)]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        previous: &PackageSet,
        desired: &PackageSet,
    ) -> Result<PackageSet, ResourceError> {
        let call = Call::new(ResourceKind::Package, Operation::Update, &self.world);
        self.change(cancel, &call, previous, desired).await
    }

    /// Drops the entries in `previous` and applies it.
    ///
    /// # Errors
    ///
    /// If the world file cannot be read or written, or applying fails.
    #[instrument(skip_all)]
    pub async fn delete(&self, cancel: &CancellationToken, previous: &PackageSet) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::Package, Operation::Delete, &self.world);
        self.change(cancel, &call, previous, &PackageSet::default())
            .await
            .map(drop)
    }

    async fn change(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        previous: &PackageSet,
        desired: &PackageSet,
    ) -> Result<PackageSet, ResourceError> {
        let _guard = self.lock.write().await;

        let (world, current) = self.read(cancel, call).await?;
        let next = world.replace(previous, desired);
        let rendered = next.render();
        if rendered == world.render() {
            debug!("package list unchanged, skipping apply");
            return Ok(next.restrict(desired));
        }

        // stdin carries the new list, `$old` guards against a writer that
        // bypassed this client and is what gets restored
        let script = Script::new()
            .param("world", &self.world)
            .param("old", &current)
            .check(GUARD, PackageExit::Changed)
            .step(
                Step::run(r#"cat > "$world""#)
                    .capture("existed", r#"if [ -e "$world" ]; then echo 1; fi"#)
                    .undo(r#"if [ -n "$_existed" ]; then printf '%s' "$old" > "$world"; else rm -f -- "$world"; fi"#),
            )
            .step(Step::run(&self.apply))
            .stdin(rendered.into_bytes());
        call.run::<PackageExit>(&self.session, cancel, script.into_command())
            .await?;

        Ok(next.restrict(desired))
    }

    /// The parsed world file and its raw content. A missing file is empty.
    async fn read(&self, cancel: &CancellationToken, call: &Call) -> Result<(PackageSet, String), ResourceError> {
        let script = Script::new()
            .param("world", &self.world)
            .readback(r#"if [ -e "$world" ]; then cat "$world"; fi"#);
        let result = call
            .run::<PackageExit>(&self.session, cancel, script.into_command())
            .await?;
        let content = String::from_utf8_lossy(&result.stdout).into_owned();
        let world = PackageSet::parse(&content).map_err(|error| call.malformed(&error))?;
        Ok((world, content))
    }
}
