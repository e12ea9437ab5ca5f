//! IP Monitor Core Library
//!
//! Background reachability scanning of VLAN segments:
//! - Scan scheduler with cancellable inter-cycle sleep
//! - Bounded worker pool for per-segment probe jobs
//! - Status store holding the latest snapshot per segment
//! - Reconfiguration controller that swaps scheduler generations safely
//!
//! # Example
//!
//! ```no_run
//! use ipmonitor_core::{config, PingProbe, ReconfigurationController, ScanContext, StatusStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loaded = config::load_config(None)?;
//!     let provider = Arc::new(config::SharedConfig::new(
//!         config::ScanConfig::from_file(&loaded.file)?,
//!     ));
//!
//!     let controller = ReconfigurationController::new(ScanContext::new(
//!         provider,
//!         Arc::new(StatusStore::new()),
//!         Arc::new(PingProbe::new()),
//!     ));
//!     controller.start().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(120)).await;
//!     for (segment, snapshot) in controller.store().get_all() {
//!         println!("VLAN {}: {} online", segment, snapshot.online_count());
//!     }
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod pool;
pub mod scanner;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigProvider, ScanConfig, SegmentId, SegmentTarget, SharedConfig};
pub use controller::{ReconfigurationController, RestartOutcome};
pub use error::{MonitorError, Result};
pub use scanner::{DeviceRecord, DeviceStatus, PingProbe, Probe, ProbeSettings, Snapshot};
pub use scheduler::{CycleReport, Phase, RunState, ScanContext, Scheduler};
pub use store::{SegmentStatus, StatusStore};
