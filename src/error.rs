//! Typed errors surfaced by the fleet driver.
//!
//! All public functions in this crate return `Result<_, failure::Error>`.
//! The fatal conditions a caller may want to react to programmatically are
//! raised as `FleetError` values, which can be recovered from a
//! `failure::Error` with `downcast_ref`, in the same way SSH errors are
//! recovered from command failures.

use failure_derive::Fail;

/// A fatal condition reported by the placement engine, lifecycle driver,
/// readiness poller, or IP/MAC pool.
///
/// Experiments hold exclusive reservations of shared hardware, so every
/// variant carries enough state to diagnose the failure without re-running.
#[derive(Debug, Clone, PartialEq, Eq, Fail)]
pub enum FleetError {
    /// No host in the candidate set can fit the next VM. Placement is
    /// atomic: when this is returned, no descriptor in the batch has been
    /// assigned a host.
    #[fail(
        display = "not enough resources: need {} MB RAM and {} vcpu-units \
                   but the host pool offers {} MB and {} units (at most {} \
                   VMs of this shape would fit)",
        required_ram_mb, required_cpu_units, available_ram_mb, available_cpu_units, max_vms
    )]
    CapacityExhausted {
        /// Total RAM the unplaced batch requires, in MB.
        required_ram_mb: u64,
        /// Total CPU budget the unplaced batch requires, in vcpu-units.
        required_cpu_units: u64,
        /// Total RAM offered by the candidate hosts, in MB.
        available_ram_mb: u64,
        /// Total CPU budget offered by the candidate hosts, in vcpu-units.
        available_cpu_units: u64,
        /// Maximum number of VMs shaped like the batch's first descriptor
        /// that the pool could support.
        max_vms: u64,
    },

    /// A lifecycle step's batched command reported failure on one or more
    /// hosts. The whole experiment combination is unusable; nothing after
    /// the failing step is attempted.
    #[fail(display = "{} step failed on host(s): {}", step, hosts)]
    RemoteCommandFailed {
        /// The lifecycle step that failed.
        step: &'static str,
        /// Comma-separated list of the hosts whose command failed.
        hosts: String,
    },

    /// The readiness poller exhausted its round budget with some VMs still
    /// unreachable.
    #[fail(display = "only {}/{} VMs came up before the poll budget ran out", ready, total)]
    ReadinessTimeout {
        /// Number of VMs that were reachable when the budget ran out.
        ready: usize,
        /// Number of VMs in the batch.
        total: usize,
    },

    /// The IP/MAC pool holds fewer pairs than the requested VM count.
    #[fail(display = "IP/MAC pool exhausted: {} pairs requested, {} available", requested, available)]
    PoolExhausted {
        /// Number of pairs the caller asked for.
        requested: usize,
        /// Number of pairs left in the pool.
        available: usize,
    },
}
