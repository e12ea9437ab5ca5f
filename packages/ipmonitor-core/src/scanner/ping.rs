//! Ping sweep using system ping command

use super::{hidden_command, DeviceRecord, DeviceStatus, Probe, ProbeSettings};
use crate::config::SegmentTarget;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Hosts pinged concurrently within one segment
const DEFAULT_BATCH_SIZE: usize = 50;

/// Sweeps every host address of a segment with the system `ping` command.
#[derive(Debug, Clone)]
pub struct PingProbe {
    batch_size: usize,
}

impl PingProbe {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn probe(
        &self,
        target: &SegmentTarget,
        settings: &ProbeSettings,
    ) -> Result<Vec<DeviceRecord>> {
        let hosts = host_addresses(target);
        tracing::debug!(
            "Pinging {} hosts in {} (timeout {:?}, {} retries)",
            hosts.len(),
            target.range(),
            settings.timeout,
            settings.retry_attempts
        );

        let mut records = Vec::with_capacity(hosts.len());
        for batch in hosts.chunks(self.batch_size) {
            let results =
                futures::future::join_all(batch.iter().map(|ip| ping_with_retries(*ip, settings)))
                    .await;

            for (ip, result) in batch.iter().zip(results) {
                let status = if result? {
                    DeviceStatus::online()
                } else {
                    DeviceStatus::offline()
                };
                records.push(DeviceRecord::new(ip.to_string(), status));
            }
        }

        Ok(records)
    }
}

/// Host addresses of the segment, skipping network and broadcast
fn host_addresses(target: &SegmentTarget) -> Vec<Ipv4Addr> {
    let network = target.network.network();
    let broadcast = target.network.broadcast();
    target
        .network
        .iter()
        .filter(|ip| *ip != network && *ip != broadcast)
        .collect()
}

async fn ping_with_retries(ip: Ipv4Addr, settings: &ProbeSettings) -> Result<bool> {
    for attempt in 0..=settings.retry_attempts {
        if ping_host(ip, settings.timeout).await? {
            if attempt > 0 {
                tracing::trace!("{} answered after {} retries", ip, attempt);
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Ping a single host once.
///
/// `Ok(false)` means no reply; `Err` means ping itself could not be run.
async fn ping_host(ip: Ipv4Addr, timeout: Duration) -> Result<bool> {
    let ip_owned = ip.to_string();
    let wait = timeout.as_secs().max(1);

    let task = tokio::task::spawn_blocking(move || -> Result<bool> {
        #[cfg(target_os = "windows")]
        let output = hidden_command("ping")
            .args(["-n", "1", "-w", &(wait * 1000).to_string(), &ip_owned])
            .output();

        #[cfg(target_os = "macos")]
        let output = hidden_command("ping")
            .args(["-c", "1", "-W", &(wait * 1000).to_string(), &ip_owned])
            .output();

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let output = hidden_command("ping")
            .args(["-c", "1", "-W", &wait.to_string(), &ip_owned])
            .output();

        let output = output.context("Failed to execute ping")?;

        #[cfg(target_os = "windows")]
        {
            let output_lower = String::from_utf8_lossy(&output.stdout).to_lowercase();
            if output_lower.contains("request timed out")
                || output_lower.contains("destination host unreachable")
                || output_lower.contains("transmit failed")
                || output_lower.contains("general failure")
            {
                return Ok(false);
            }
            if !output_lower.contains("reply from") {
                return Ok(false);
            }
        }

        Ok(output.status.success())
    });

    // The child process honours its own timeout; this bounds a wedged spawn.
    match tokio::time::timeout(Duration::from_secs(wait + 2), task).await {
        Ok(joined) => joined.context("Ping task panicked")?,
        Err(_) => Ok(false),
    }
}
