//! Fleet lifecycle and placement driver for VM benchmarking experiments.
//!
//! Experiments on a shared research testbed reserve a set of physical
//! hosts, turn them into virtualization hosts, and then need tens to
//! thousands of virtual machines defined, placed, booted and eventually
//! torn down — over and over, one parameter combination at a time. This
//! crate is the library those experiment scripts drive:
//!
//! - [`vm`] defines VM descriptors in bulk from a template, drawing network
//!   identity from an ordered [`pool`] of (ip, mac) pairs;
//! - [`placement`] distributes descriptors across hosts under RAM and CPU
//!   budget constraints, with round-robin, concentrated, random and
//!   fixed-count policies;
//! - [`commands`] renders each lifecycle operation as one batched shell
//!   command per host, so a thousand-VM step costs one connection per host
//!   rather than one per VM;
//! - [`lifecycle`] drives destroy → disks → install → start → wait-ready
//!   with strict fail-fast across hosts;
//! - [`readiness`] polls the started fleet for open service ports, with
//!   stall detection and targeted restart of VMs that never came up.
//!
//! Remote execution, host attribute lookup, and address allocation are
//! collaborator traits ([`remote::RemoteExec`], [`host::HostResources`]);
//! the bundled [`remote::SshExec`] implementation runs over SSH. Fatal
//! conditions are typed ([`error::FleetError`]) and can be recovered from
//! any returned `failure::Error` with `downcast_ref`. The library never
//! reads ambient configuration and never terminates the process.

#[macro_use]
mod macros;

pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod placement;
pub mod pool;
pub mod readiness;
pub mod remote;
pub mod vm;

pub use crate::config::{FleetConfig, PlacementConfig, WaitConfig};
pub use crate::error::FleetError;
pub use crate::host::{HostId, HostResources, RawCapacity};
pub use crate::lifecycle::{DeployState, VmDeployment};
pub use crate::placement::{
    collect_capacities, distribute_vms, distribute_vms_using, Distribution, HostCapacity,
};
pub use crate::pool::IpMacPool;
pub use crate::readiness::wait_vms_have_started;
pub use crate::remote::{CommandResult, RemoteExec, SshExec};
pub use crate::vm::{define_vms, show_vms, Field, VmDescriptor, VmSpec, VmState, VmTemplate};
