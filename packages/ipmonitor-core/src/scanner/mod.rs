//! Device status records and the probe capability.
//!
//! The scheduler only knows the [`Probe`] trait. [`PingProbe`] is the default
//! implementation and sweeps a segment with the system ping command.

mod ping;

pub use ping::PingProbe;

use crate::config::{SegmentId, SegmentTarget};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::time::Duration;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Create a Command that hides the console window on Windows.
pub(crate) fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Status token reported by a probe.
///
/// The set of tokens is open. Both `"on"` and `"online"` mean reachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceStatus(String);

impl DeviceStatus {
    pub const ONLINE: &'static str = "online";
    pub const OFFLINE: &'static str = "offline";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn online() -> Self {
        Self::new(Self::ONLINE)
    }

    pub fn offline() -> Self {
        Self::new(Self::OFFLINE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_online(&self) -> bool {
        matches!(self.0.as_str(), "on" | "online")
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub address: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_type: Option<String>,
}

impl DeviceRecord {
    pub fn new(address: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            address: address.into(),
            status,
            device_type: None,
        }
    }
}

/// Complete result of one sweep of one segment.
///
/// Never mutated once built; the status store swaps whole snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub segment: SegmentId,
    pub scanned_at: DateTime<Utc>,
    pub devices: Vec<DeviceRecord>,
}

impl Snapshot {
    pub fn new(segment: SegmentId, devices: Vec<DeviceRecord>) -> Self {
        Self {
            segment,
            scanned_at: Utc::now(),
            devices,
        }
    }

    /// Devices whose status counts as reachable
    pub fn online(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter().filter(|d| d.status.is_online())
    }

    pub fn online_count(&self) -> usize {
        self.online().count()
    }
}

/// Per-host probe tuning, taken from the scan configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub retry_attempts: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry_attempts: 2,
        }
    }
}

/// Reachability sweep over one segment's address range.
///
/// Timeouts and retries are the implementation's concern.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(
        &self,
        target: &SegmentTarget,
        settings: &ProbeSettings,
    ) -> Result<Vec<DeviceRecord>>;
}
