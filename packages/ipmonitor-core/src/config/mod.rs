//! Scan configuration.
//!
//! A [`ConfigFile`] is the raw TOML document as written by an operator. It is
//! validated once into an immutable [`ScanConfig`], which also carries the
//! resolved segment → address-range mapping so nothing downstream has to
//! format network prefixes on its own.

mod file;

pub use file::{
    check, generate_example_config, get_config_file_path, get_config_file_path_string,
    load_config, read_config_file, save_config_file, ConfigFile, ConfigReport, ConfigSource,
    LoadedConfig, NetworkSection, SchedulerSection, SegmentsSection, SystemSection,
};

use crate::error::{MonitorError, Result};
use crate::scanner::ProbeSettings;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Numeric VLAN tag
pub type SegmentId = u16;

pub const INTERVAL_BOUNDS: (i64, i64) = (5, 300);
pub const CONCURRENCY_BOUNDS: (i64, i64) = (1, 10);
pub const PROBE_TIMEOUT_BOUNDS: (i64, i64) = (1, 10);
pub const RETRY_BOUNDS: (i64, i64) = (0, 5);
pub const RESTART_GRACE_BOUNDS: (i64, i64) = (1, 60);

/// Interval used for an active segment with no explicit entry
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// A segment together with the address range it is probed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTarget {
    pub id: SegmentId,
    pub network: Ipv4Network,
}

impl SegmentTarget {
    /// Map a segment id onto `<a>.<b>.<id>.0/24`.
    pub fn new(prefix: [u8; 2], id: SegmentId) -> Result<Self> {
        let octet = u8::try_from(id).map_err(|_| {
            MonitorError::invalid(
                "segments.active",
                format!("segment {} does not fit in an IPv4 octet", id),
            )
        })?;
        let network = Ipv4Network::new(Ipv4Addr::new(prefix[0], prefix[1], octet, 0), 24)
            .map_err(|e| MonitorError::invalid("network.base_prefix", e.to_string()))?;
        Ok(Self { id, network })
    }

    /// Address range handed to the probe, e.g. `172.17.70.0/24`
    pub fn range(&self) -> String {
        self.network.to_string()
    }
}

/// Validated, immutable scan configuration.
///
/// A scheduler cycle holds one `Arc<ScanConfig>` for its whole duration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    prefix: [u8; 2],
    targets: Vec<SegmentTarget>,
    intervals: BTreeMap<SegmentId, u64>,
    descriptions: BTreeMap<SegmentId, String>,
    max_concurrent_scans: usize,
    probe_timeout: Duration,
    retry_attempts: u32,
    restart_grace: Duration,
}

impl ScanConfig {
    /// Validate a raw configuration document.
    ///
    /// Fails on the first out-of-bounds value; use [`check`] to collect all
    /// problems at once.
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let mut issues = Vec::new();
        let config = build(file, &mut issues);
        match (config, issues.into_iter().next()) {
            (_, Some(issue)) => Err(issue),
            (Some(config), None) => Ok(config),
            (None, None) => Err(MonitorError::invalid("config", "unusable configuration")),
        }
    }

    /// Same settings, sweeping only the given segments (active or not)
    pub fn restricted_to(&self, segments: &[SegmentId]) -> Result<ScanConfig> {
        let mut targets: Vec<SegmentTarget> = Vec::with_capacity(segments.len());
        for &id in segments {
            let target = SegmentTarget::new(self.prefix, id)?;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        Ok(ScanConfig {
            targets,
            ..self.clone()
        })
    }

    pub fn active_targets(&self) -> &[SegmentTarget] {
        &self.targets
    }

    pub fn active_segments(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.targets.iter().map(|t| t.id)
    }

    pub fn target(&self, segment: SegmentId) -> Option<&SegmentTarget> {
        self.targets.iter().find(|t| t.id == segment)
    }

    /// Configured interval for a segment, defaulting to 60s
    pub fn interval_for(&self, segment: SegmentId) -> Duration {
        Duration::from_secs(
            self.intervals
                .get(&segment)
                .copied()
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        )
    }

    pub fn max_concurrent_scans(&self) -> usize {
        self.max_concurrent_scans
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn restart_grace(&self) -> Duration {
        self.restart_grace
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout: self.probe_timeout,
            retry_attempts: self.retry_attempts,
        }
    }

    pub fn description(&self, segment: SegmentId) -> String {
        self.descriptions
            .get(&segment)
            .cloned()
            .unwrap_or_else(|| format!("VLAN {}", segment))
    }
}

fn bounded(field: &str, value: i64, (min, max): (i64, i64), issues: &mut Vec<MonitorError>) -> bool {
    if value < min || value > max {
        issues.push(MonitorError::invalid(
            field,
            format!("{} is outside [{}, {}]", value, min, max),
        ));
        return false;
    }
    true
}

fn parse_segment(field: &str, raw: &str, issues: &mut Vec<MonitorError>) -> Option<SegmentId> {
    match raw.trim().parse::<SegmentId>() {
        Ok(id) if id <= u8::MAX as SegmentId => Some(id),
        _ => {
            issues.push(MonitorError::invalid(
                field,
                format!("'{}' is not a segment id in [0, 255]", raw),
            ));
            None
        }
    }
}

fn parse_prefix(raw: &str, issues: &mut Vec<MonitorError>) -> Option<[u8; 2]> {
    let octets: Vec<&str> = raw.trim().trim_end_matches('.').split('.').collect();
    if let [a, b] = octets.as_slice() {
        if let (Ok(a), Ok(b)) = (a.parse::<u8>(), b.parse::<u8>()) {
            return Some([a, b]);
        }
    }
    issues.push(MonitorError::invalid(
        "network.base_prefix",
        format!("'{}' is not a two-octet prefix such as 172.17", raw),
    ));
    None
}

/// Validate every field, recording problems in `issues`.
///
/// Returns a config only when all fields parsed.
fn build(file: &ConfigFile, issues: &mut Vec<MonitorError>) -> Option<ScanConfig> {
    let network = &file.network;
    let prefix = parse_prefix(&network.base_prefix, issues);

    let concurrency_ok = bounded(
        "network.max_concurrent_scans",
        network.max_concurrent_scans,
        CONCURRENCY_BOUNDS,
        issues,
    );
    let timeout_ok = bounded(
        "network.probe_timeout",
        network.probe_timeout,
        PROBE_TIMEOUT_BOUNDS,
        issues,
    );
    let retries_ok = bounded(
        "network.retry_attempts",
        network.retry_attempts,
        RETRY_BOUNDS,
        issues,
    );
    let grace_ok = bounded(
        "scheduler.restart_grace_secs",
        file.scheduler.restart_grace_secs,
        RESTART_GRACE_BOUNDS,
        issues,
    );

    let mut intervals = BTreeMap::new();
    for (key, &secs) in &file.segments.intervals {
        let field = format!("segments.intervals.{}", key);
        let segment = parse_segment(&field, key, issues);
        if bounded(&field, secs, INTERVAL_BOUNDS, issues) {
            if let Some(segment) = segment {
                intervals.insert(segment, secs as u64);
            }
        }
    }

    let mut descriptions = BTreeMap::new();
    for (key, text) in &file.segments.descriptions {
        let field = format!("segments.descriptions.{}", key);
        if let Some(segment) = parse_segment(&field, key, issues) {
            descriptions.insert(segment, text.clone());
        }
    }

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for &raw in &file.segments.active {
        let id = match SegmentId::try_from(raw) {
            Ok(id) if id <= u8::MAX as SegmentId => id,
            _ => {
                issues.push(MonitorError::invalid(
                    "segments.active",
                    format!("{} is not a segment id in [0, 255]", raw),
                ));
                continue;
            }
        };
        if !seen.insert(id) {
            tracing::debug!("Ignoring duplicate active segment {}", id);
            continue;
        }
        if let Some(prefix) = prefix {
            match SegmentTarget::new(prefix, id) {
                Ok(target) => targets.push(target),
                Err(e) => issues.push(e),
            }
        }
    }

    let prefix = prefix?;
    if !(concurrency_ok && timeout_ok && retries_ok && grace_ok) {
        return None;
    }

    Some(ScanConfig {
        prefix,
        targets,
        intervals,
        descriptions,
        max_concurrent_scans: network.max_concurrent_scans as usize,
        probe_timeout: Duration::from_secs(network.probe_timeout as u64),
        retry_attempts: network.retry_attempts as u32,
        restart_grace: Duration::from_secs(file.scheduler.restart_grace_secs as u64),
    })
}

/// Read-only source of the current scan configuration.
pub trait ConfigProvider: Send + Sync {
    /// Point-in-time snapshot; later replacements never affect it
    fn current(&self) -> Arc<ScanConfig>;
}

/// In-memory provider whose value is swapped wholesale on change.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<Arc<ScanConfig>>,
}

impl SharedConfig {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn replace(&self, config: ScanConfig) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
        tracing::info!(
            "Configuration replaced: {} active segments",
            guard.active_targets().len()
        );
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> Arc<ScanConfig> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
