//! Distribution of VM descriptors across physical hosts.
//!
//! The engine is a greedy first-fit bin packer over two resource
//! dimensions, RAM and CPU budget. It is not optimal and never backtracks:
//! when no surviving host fits the next VM the whole placement fails, since
//! an experiment that cannot place all of its VMs is not worth starting.
//!
//! CPU budget is counted in vcpu-units. A host offers `cpu_count *
//! overcommit` units and a VM consumes `vcpus` units; with the default
//! overcommit of 3, three declared vcpus time-share one physical core
//! equivalent.

use std::collections::HashMap;

use failure::format_err;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::PlacementConfig;
use crate::error::FleetError;
use crate::host::{HostId, HostResources, RawCapacity};
use crate::vm::VmDescriptor;

/// How VMs are spread over the candidate hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Cycle through the hosts, one VM at a time. Deterministic given host
    /// order.
    RoundRobin,
    /// Fill one host to capacity before moving to the next.
    Concentrated,
    /// Like round-robin, but skip a random number of hosts between
    /// placements, to decorrelate colocation patterns.
    Random,
    /// Evenly divide the VMs across hosts by count, ignoring capacity.
    /// A non-divisible remainder is left unplaced, with a warning.
    FixedCountPerHost,
}

/// Resource accounting for one host during a single placement run.
///
/// Records are built by `collect_capacities`, mutated by each placement
/// decision, and discarded when placement completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub id: HostId,
    pub ram_mb_total: u64,
    pub cpu_count_total: u32,
    pub ram_mb_remaining: u64,
    pub cpu_units_remaining: u64,
}

impl HostCapacity {
    pub fn new(id: HostId, raw: RawCapacity, overcommit: u32) -> Self {
        HostCapacity {
            id,
            ram_mb_total: raw.ram_mb,
            cpu_count_total: raw.cpu_count,
            ram_mb_remaining: raw.ram_mb,
            cpu_units_remaining: u64::from(raw.cpu_count) * u64::from(overcommit),
        }
    }

    fn fits(&self, vm: &VmDescriptor) -> bool {
        vm.mem_mb <= self.ram_mb_remaining && u64::from(vm.vcpus) <= self.cpu_units_remaining
    }

    fn take(&mut self, vm: &VmDescriptor) {
        self.ram_mb_remaining -= vm.mem_mb;
        self.cpu_units_remaining -= u64::from(vm.vcpus);
    }
}

/// Seed capacity records for a host list.
///
/// All hosts of a cluster share the same hardware, so the resource lookup
/// is performed once per distinct cluster.
pub fn collect_capacities(
    hosts: &[HostId],
    resources: &impl HostResources,
    cfg: &PlacementConfig,
) -> Result<Vec<HostCapacity>, failure::Error> {
    let mut cluster_attr: HashMap<String, RawCapacity> = HashMap::new();

    hosts
        .iter()
        .map(|host| {
            let raw = match cluster_attr.get(host.cluster()) {
                Some(raw) => *raw,
                None => {
                    let raw = resources.host_capacity(host)?;
                    cluster_attr.insert(host.cluster().to_string(), raw);
                    raw
                }
            };
            Ok(HostCapacity::new(host.clone(), raw, cfg.cpu_overcommit))
        })
        .collect()
}

/// Maximum number of VMs of the given shape the host pool could support,
/// from the pool's remaining RAM and CPU budget. Reported alongside
/// capacity failures so the experiment can be resized without re-running.
pub fn max_supportable_vms(caps: &[HostCapacity], mem_mb: u64, vcpus: u32) -> u64 {
    let by_ram: u64 = caps.iter().map(|c| c.ram_mb_remaining / mem_mb.max(1)).sum();
    let by_cpu: u64 = caps
        .iter()
        .map(|c| c.cpu_units_remaining / u64::from(vcpus.max(1)))
        .sum();
    by_ram.min(by_cpu)
}

/// Assign every descriptor in `vms` a host under the given policy.
///
/// The random policy draws from `thread_rng`; use `distribute_vms_using`
/// with a seeded RNG when a run must be reproducible.
pub fn distribute_vms(
    vms: &mut [VmDescriptor],
    caps: &mut [HostCapacity],
    dist: Distribution,
) -> Result<(), failure::Error> {
    distribute_vms_using(vms, caps, dist, &mut rand::thread_rng())
}

/// Like `distribute_vms`, with an injectable RNG for the random policy.
///
/// Placement is atomic: either every descriptor ends up with a host (for
/// `FixedCountPerHost`, every descriptor up to the truncated count) or the
/// batch is left untouched and a `CapacityExhausted` error is returned.
/// Batches containing an already-placed descriptor are rejected; the
/// engine never overwrites a host assignment.
pub fn distribute_vms_using<R: Rng>(
    vms: &mut [VmDescriptor],
    caps: &mut [HostCapacity],
    dist: Distribution,
    rng: &mut R,
) -> Result<(), failure::Error> {
    if let Some(placed) = vms.iter().find(|vm| vm.host.is_some()) {
        return Err(format_err!(
            "VM {} is already placed on {}; placement never reassigns hosts",
            placed.id,
            placed.host.as_ref().unwrap()
        ));
    }
    if caps.is_empty() {
        return Err(format_err!("no candidate hosts to place on"));
    }

    if dist == Distribution::FixedCountPerHost {
        return distribute_fixed_count(vms, caps);
    }

    // Work on a scratch copy so a failed placement leaves both the batch
    // and the capacity records untouched.
    let mut scratch = caps.to_vec();

    // Indices of hosts still in the rotation, and the rotation position.
    let mut live: Vec<usize> = (0..scratch.len()).collect();
    let mut pos = 0;
    let mut assigned: Vec<usize> = Vec::with_capacity(vms.len());

    for vm in vms.iter() {
        loop {
            if live.is_empty() {
                return Err(FleetError::CapacityExhausted {
                    required_ram_mb: vms.iter().map(|vm| vm.mem_mb).sum(),
                    required_cpu_units: vms.iter().map(|vm| u64::from(vm.vcpus)).sum(),
                    available_ram_mb: caps.iter().map(|c| c.ram_mb_remaining).sum(),
                    available_cpu_units: caps.iter().map(|c| c.cpu_units_remaining).sum(),
                    max_vms: max_supportable_vms(caps, vms[0].mem_mb, vms[0].vcpus),
                }
                .into());
            }
            if scratch[live[pos]].fits(vm) {
                break;
            }
            // The host cannot fit the next VM: drop it from the rotation,
            // which then restarts at the head of the survivors.
            live.remove(pos);
            pos = 0;
        }

        let idx = live[pos];
        scratch[idx].take(vm);
        assigned.push(idx);

        match dist {
            Distribution::RoundRobin => pos = (pos + 1) % live.len(),
            Distribution::Concentrated => {}
            Distribution::Random => pos = (pos + rng.gen_range(0..=live.len())) % live.len(),
            Distribution::FixedCountPerHost => unreachable!(),
        }
    }

    caps.clone_from_slice(&scratch);
    for (vm, idx) in vms.iter_mut().zip(assigned) {
        vm.host = Some(caps[idx].id.clone());
    }

    debug!(
        "placed {} VMs: {}",
        vms.len(),
        vms.iter()
            .map(|vm| {
                let host = vm.host.as_ref().map(|h| h.shortname()).unwrap_or("-");
                format!("{}: {}", vm.id, host)
            })
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn distribute_fixed_count(
    vms: &mut [VmDescriptor],
    caps: &[HostCapacity],
) -> Result<(), failure::Error> {
    let n_by_host = vms.len() / caps.len();
    let placed = n_by_host * caps.len();
    if placed < vms.len() {
        warn!(
            "{} VMs do not divide evenly over {} hosts; leaving {} unplaced",
            vms.len(),
            caps.len(),
            vms.len() - placed
        );
    }

    for (i, vm) in vms.iter_mut().take(placed).enumerate() {
        vm.host = Some(caps[i / n_by_host].id.clone());
    }
    Ok(())
}
