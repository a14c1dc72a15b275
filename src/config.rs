//! Driver configuration.
//!
//! Everything the driver needs to know is carried in a `FleetConfig` passed
//! into the entry points; the library reads no ambient or process-global
//! state. The defaults reproduce the constants the experiments have always
//! run with, so `FleetConfig::default()` is the common case.

use serde::{Deserialize, Serialize};

use crate::vm::VmTemplate;

/// The directory on each host where VM disk images live.
pub const DEFAULT_DISK_DIR: &str = "/tmp";

/// The on-disk format of the shared backing image.
pub const DEFAULT_BACKING_FMT: &str = "raw";

/// CPU overcommit factor: how many declared vcpus time-share one physical
/// core equivalent. An empirical testbed constant; see `PlacementConfig`.
pub const DEFAULT_CPU_OVERCOMMIT: u32 = 3;

/// Placement engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// CPU overcommit factor. A host offers `cpu_count * cpu_overcommit`
    /// vcpu-units of budget and each VM consumes `vcpus` units.
    pub cpu_overcommit: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        PlacementConfig {
            cpu_overcommit: DEFAULT_CPU_OVERCOMMIT,
        }
    }
}

/// Readiness poll tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Service port probed to decide that a VM has finished booting.
    pub port: u16,
    /// Maximum number of stalled rounds before giving up.
    pub max_rounds: usize,
    /// Seconds slept before each scan round, to let boot progress.
    pub interval_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            port: 22,
            max_rounds: 10,
            interval_secs: 20,
        }
    }
}

/// Configuration for one deployment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Defaults applied to descriptor fields the caller does not override.
    pub default_vm: VmTemplate,
    /// Directory on the hosts holding per-VM disk images.
    pub disk_dir: String,
    /// Format of the shared backing image.
    pub backing_file_fmt: String,
    pub placement: PlacementConfig,
    pub wait: WaitConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            default_vm: VmTemplate::default(),
            disk_dir: DEFAULT_DISK_DIR.into(),
            backing_file_fmt: DEFAULT_BACKING_FMT.into(),
            placement: PlacementConfig::default(),
            wait: WaitConfig::default(),
        }
    }
}
