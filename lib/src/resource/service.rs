//! systemd units.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;

use super::Call;
use super::Cause;
use super::Operation;
use super::ResourceError;
use super::ResourceKind;
use crate::protocol::props::Props;
use crate::protocol::sentinel_table;
use crate::protocol::ParseError;
use crate::protocol::Script;
use crate::protocol::Step;
use crate::session::ExecError;
use crate::session::Session;

sentinel_table! {
    /// Exit codes of service scripts.
    pub enum ServiceExit {
        Ok = 0 => Meaning::Success,
        Failed = 1 => Meaning::Failure,
        NotFound = 17 => Meaning::NotFound,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LoadState {
    Stub,
    Loaded,
    NotFound,
    BadSetting,
    Error,
    Merged,
    Masked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActiveState {
    Active,
    Reloading,
    Inactive,
    Failed,
    Activating,
    Deactivating,
    Maintenance,
    Refreshing,
}

impl ActiveState {
    /// Whether the unit is on its way to another state.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Activating | Self::Deactivating | Self::Reloading | Self::Refreshing
        )
    }
}

/// Desired state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct ServiceState {
    /// Started at boot.
    pub enabled: bool,
    /// Running now.
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Builder)]
pub struct ServiceUpdate {
    pub enabled: Option<bool>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub unit: String,
    pub load_state: LoadState,
    pub enabled: bool,
    pub unit_file_state: String,
    pub active_state: ActiveState,
    pub sub_state: String,
}

impl ServiceRecord {
    fn parse(output: &str) -> Result<Self, ParseError> {
        let props = Props::parse(output)?;
        let unit_file_state = props.get("UnitFileState")?;
        Ok(Self {
            unit: props.get("Id")?.to_owned(),
            load_state: props.parse_as("LoadState")?,
            enabled: unit_file_state.starts_with("enabled"),
            unit_file_state: unit_file_state.to_owned(),
            active_state: props.parse_as("ActiveState")?,
            sub_state: props.get("SubState")?.to_owned(),
        })
    }
}

/// Manages pre-existing units. Units are never installed or removed, only
/// enabled, started and their reverse.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    session: Arc<Session>,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl ServiceClient {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            poll_interval: Duration::from_secs(1),
            settle_timeout: Duration::from_secs(30),
        }
    }

    /// Polls every `interval` while the unit is transitioning, for at most
    /// `timeout`.
    #[must_use]
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.settle_timeout = timeout;
        self
    }

    /// Reads the unit, waiting for it to leave a transitional state.
    ///
    /// # Errors
    ///
    /// [`Cause::NotFound`] if systemd does not know `unit`, [`Cause::Timeout`]
    /// if it keeps transitioning.
    #[instrument(skip(self, cancel))]
    pub async fn get(&self, cancel: &CancellationToken, unit: &str) -> Result<ServiceRecord, ResourceError> {
        let call = Call::new(ResourceKind::Service, Operation::Get, unit);
        let script = known(unit).readback(READBACK);
        self.settle(cancel, &call, script, unit).await
    }

    /// Adopts an existing unit and brings it to `state`.
    ///
    /// # Errors
    ///
    /// [`Cause::NotFound`] if systemd does not know `unit`.
    #[instrument(skip(self, cancel))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        unit: &str,
        state: ServiceState,
    ) -> Result<ServiceRecord, ResourceError> {
        let call = Call::new(ResourceKind::Service, Operation::Create, unit);
        let script = known(unit)
            .step(enablement(state.enabled))
            .step(activity(state.active))
            .readback(READBACK);
        self.settle(cancel, &call, script, unit).await
    }

    /// # Errors
    ///
    /// [`Cause::NotFound`] if systemd does not know `unit`.
    #[instrument(skip(self, cancel))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        unit: &str,
        update: ServiceUpdate,
    ) -> Result<ServiceRecord, ResourceError> {
        let call = Call::new(ResourceKind::Service, Operation::Update, unit);
        let script = known(unit)
            .steps(update.enabled.map(enablement))
            .steps(update.active.map(activity))
            .readback(READBACK);
        self.settle(cancel, &call, script, unit).await
    }

    /// Stops and disables the unit. An unknown unit counts as done.
    ///
    /// # Errors
    ///
    /// If `systemctl` fails.
    #[instrument(skip(self, cancel))]
    pub async fn delete(&self, cancel: &CancellationToken, unit: &str) -> Result<(), ResourceError> {
        let call = Call::new(ResourceKind::Service, Operation::Delete, unit);
        let script = known(unit).step(activity(false)).step(enablement(false));
        call.run_delete::<ServiceExit>(&self.session, cancel, script.into_command())
            .await
    }

    /// Runs `script`, then re-reads the unit until it is no longer
    /// transitioning.
    async fn settle(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
        unit: &str,
    ) -> Result<ServiceRecord, ResourceError> {
        let deadline = Instant::now() + self.settle_timeout;
        let mut record = self.read(cancel, call, script).await?;

        while record.active_state.is_transitional() {
            if Instant::now() >= deadline {
                return Err(call.error(Cause::Timeout(self.settle_timeout)));
            }
            debug!(state = %record.active_state, sub = %record.sub_state, "unit transitioning");
            tokio::select! {
                () = cancel.cancelled() => return Err(call.error(Cause::Exec(ExecError::Cancelled))),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
            record = self
                .read(cancel, call, known(unit).readback(READBACK))
                .await?;
        }

        Ok(record)
    }

    async fn read(
        &self,
        cancel: &CancellationToken,
        call: &Call,
        script: Script,
    ) -> Result<ServiceRecord, ResourceError> {
        let result = call
            .run::<ServiceExit>(&self.session, cancel, script.into_command())
            .await?;
        ServiceRecord::parse(&String::from_utf8_lossy(&result.stdout))
            .map_err(|error| call.malformed(&error))
    }
}

const READBACK: &str =
    r#"systemctl show -p Id -p LoadState -p ActiveState -p SubState -p UnitFileState -- "$unit""#;

/// Binds `$unit` and fails with 17 unless systemd knows it.
fn known(unit: &str) -> Script {
    Script::new().param("unit", unit).check(
        r#"[ "$(systemctl show -p LoadState --value -- "$unit")" != not-found ]"#,
        ServiceExit::NotFound,
    )
}

fn enablement(enabled: bool) -> Step {
    let verb = if enabled { "enable" } else { "disable" };
    Step::run(format!(r#"systemctl {verb} -- "$unit""#))
        .capture(
            "was_enabled",
            r#"if systemctl is-enabled -q -- "$unit"; then echo enable; else echo disable; fi"#,
        )
        .undo(r#"systemctl "$_was_enabled" -- "$unit""#)
}

fn activity(active: bool) -> Step {
    let verb = if active { "start" } else { "stop" };
    Step::run(format!(r#"systemctl {verb} -- "$unit""#))
        .capture(
            "was_active",
            r#"if systemctl is-active -q -- "$unit"; then echo start; else echo stop; fi"#,
        )
        .undo(r#"systemctl "$_was_active" -- "$unit""#)
}
