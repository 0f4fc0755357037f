//! Controller settings loaded from the environment
//!
//! Loaded once at startup. A malformed value is a configuration error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Environment lookup
#[cfg_attr(test, automock)]
pub trait Env: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
pub struct OsEnv;

impl Env for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed set of variables
#[derive(Clone, Debug, Default)]
pub struct MapEnv(pub HashMap<String, String>);

impl MapEnv {
    /// Build from pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Environment keys
pub mod keys {
    /// Max VMs in an active disk-transfer phase per migration
    pub const MAX_VM_INFLIGHT: &str = "MAX_VM_INFLIGHT";
    /// Transient failures allowed per step
    pub const STEP_RETRY_BUDGET: &str = "STEP_RETRY_BUDGET";
    /// Base step retry backoff in seconds
    pub const STEP_RETRY_BACKOFF_SECONDS: &str = "STEP_RETRY_BACKOFF_SECONDS";
    /// Max step retry backoff in seconds
    pub const STEP_RETRY_BACKOFF_MAX_SECONDS: &str = "STEP_RETRY_BACKOFF_MAX_SECONDS";
    /// Warm precopy interval in minutes
    pub const PRECOPY_INTERVAL: &str = "PRECOPY_INTERVAL";
    /// Default cutover delay after a warm migration starts
    pub const CUTOVER_DEFAULT_DELAY_SECONDS: &str = "CUTOVER_DEFAULT_DELAY_SECONDS";
    /// Hook job retry limit
    pub const HOOK_RETRY: &str = "HOOK_RETRY";
    /// Populator worker restart limit
    pub const IMPORTER_RETRY: &str = "IMPORTER_RETRY";
    /// Per-call source adapter timeout
    pub const ADAPTER_CALL_TIMEOUT_SECONDS: &str = "ADAPTER_CALL_TIMEOUT_SECONDS";
    /// Disk transfer timeout in hours
    pub const DISK_TRANSFER_TIMEOUT_HOURS: &str = "DISK_TRANSFER_TIMEOUT_HOURS";
    /// Archive cleanup budget
    pub const ARCHIVE_WAIT_SECONDS: &str = "ARCHIVE_WAIT_SECONDS";
    /// Snapshot removal timeout in minutes
    pub const SNAPSHOT_REMOVAL_TIMEOUT_MINUTES: &str = "SNAPSHOT_REMOVAL_TIMEOUT_MINUTES";
    /// Spill file directory
    pub const WORKING_DIR: &str = "WORKING_DIR";
    /// Populator worker image
    pub const POPULATOR_IMAGE: &str = "POPULATOR_IMAGE";
    /// Guest conversion image
    pub const VIRT_V2V_IMAGE: &str = "VIRT_V2V_IMAGE";
    /// Hook image used when a hook names none
    pub const HOOK_DEFAULT_IMAGE: &str = "HOOK_DEFAULT_IMAGE";
}

/// Controller settings
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// K: max VMs in an active disk-transfer phase per migration
    pub max_vm_inflight: usize,
    /// Transient failures allowed per step before the VM fails
    pub step_retry_budget: u32,
    /// Base backoff between step retries
    pub step_retry_backoff: Duration,
    /// Backoff ceiling
    pub step_retry_backoff_max: Duration,
    /// Warm precopy interval
    pub precopy_interval: Duration,
    /// Cutover delay when a warm migration has none
    pub cutover_default_delay: Duration,
    /// Hook job retries
    pub hook_retry: u32,
    /// Populator worker restarts
    pub importer_retry: u32,
    /// Per-call adapter timeout
    pub adapter_call_timeout: Duration,
    /// Disk transfer timeout
    pub disk_transfer_timeout: Duration,
    /// Archive cleanup budget
    pub archive_wait: Duration,
    /// Snapshot removal timeout
    pub snapshot_removal_timeout: Duration,
    /// Spill file directory
    pub working_dir: PathBuf,
    /// Populator worker image
    pub populator_image: String,
    /// Guest conversion image
    pub virt_v2v_image: String,
    /// Default hook image
    pub hook_default_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_vm_inflight: 1,
            step_retry_budget: 3,
            step_retry_backoff: Duration::from_secs(5),
            step_retry_backoff_max: Duration::from_secs(300),
            precopy_interval: Duration::from_secs(60 * 60),
            cutover_default_delay: Duration::from_secs(3600),
            hook_retry: 3,
            importer_retry: 3,
            adapter_call_timeout: Duration::from_secs(30),
            disk_transfer_timeout: Duration::from_secs(24 * 3600),
            archive_wait: Duration::from_secs(60),
            snapshot_removal_timeout: Duration::from_secs(120 * 60),
            working_dir: std::env::temp_dir(),
            populator_image: "quay.io/kubev2v/populator:latest".to_string(),
            virt_v2v_image: "quay.io/kubev2v/forklift-virt-v2v:latest".to_string(),
            hook_default_image: "quay.io/kubev2v/hook-runner:latest".to_string(),
        }
    }
}

fn parse<T: FromStr>(env: &dyn Env, key: &str, default: T) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    match env.var(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| Error::configuration(key, format!("'{raw}': {e}"))),
    }
}

fn positive<T>(key: &str, value: T) -> Result<T, Error>
where
    T: PartialOrd + Default,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(Error::configuration(key, "must be greater than zero"))
    }
}

impl Settings {
    /// Load settings, falling back to defaults for unset keys
    pub fn load(env: &dyn Env) -> Result<Self, Error> {
        use keys::*;
        let d = Settings::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, Error> {
            parse(env, key, default.as_secs()).map(Duration::from_secs)
        };

        let max_vm_inflight = positive(
            MAX_VM_INFLIGHT,
            parse(env, MAX_VM_INFLIGHT, d.max_vm_inflight)?,
        )?;
        let step_retry_backoff = secs(STEP_RETRY_BACKOFF_SECONDS, d.step_retry_backoff)?;
        let step_retry_backoff_max =
            secs(STEP_RETRY_BACKOFF_MAX_SECONDS, d.step_retry_backoff_max)?;
        if step_retry_backoff_max < step_retry_backoff {
            return Err(Error::configuration(
                STEP_RETRY_BACKOFF_MAX_SECONDS,
                "must not be lower than STEP_RETRY_BACKOFF_SECONDS",
            ));
        }
        let precopy_minutes = positive(
            PRECOPY_INTERVAL,
            parse(env, PRECOPY_INTERVAL, d.precopy_interval.as_secs() / 60)?,
        )?;
        let transfer_hours = positive(
            DISK_TRANSFER_TIMEOUT_HOURS,
            parse(
                env,
                DISK_TRANSFER_TIMEOUT_HOURS,
                d.disk_transfer_timeout.as_secs() / 3600,
            )?,
        )?;
        let removal_minutes = parse(
            env,
            SNAPSHOT_REMOVAL_TIMEOUT_MINUTES,
            d.snapshot_removal_timeout.as_secs() / 60,
        )?;

        Ok(Self {
            max_vm_inflight,
            step_retry_budget: parse(env, STEP_RETRY_BUDGET, d.step_retry_budget)?,
            step_retry_backoff,
            step_retry_backoff_max,
            precopy_interval: Duration::from_secs(precopy_minutes * 60),
            cutover_default_delay: secs(CUTOVER_DEFAULT_DELAY_SECONDS, d.cutover_default_delay)?,
            hook_retry: parse(env, HOOK_RETRY, d.hook_retry)?,
            importer_retry: parse(env, IMPORTER_RETRY, d.importer_retry)?,
            adapter_call_timeout: secs(ADAPTER_CALL_TIMEOUT_SECONDS, d.adapter_call_timeout)?,
            disk_transfer_timeout: Duration::from_secs(transfer_hours * 3600),
            archive_wait: secs(ARCHIVE_WAIT_SECONDS, d.archive_wait)?,
            snapshot_removal_timeout: Duration::from_secs(removal_minutes * 60),
            working_dir: env.var(WORKING_DIR).map(PathBuf::from).unwrap_or(d.working_dir),
            populator_image: env.var(POPULATOR_IMAGE).unwrap_or(d.populator_image),
            virt_v2v_image: env.var(VIRT_V2V_IMAGE).unwrap_or(d.virt_v2v_image),
            hook_default_image: env.var(HOOK_DEFAULT_IMAGE).unwrap_or(d.hook_default_image),
        })
    }
}
