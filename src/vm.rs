//! VM descriptors and the bulk descriptor factory.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use console::style;
use failure::format_err;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::host::HostId;
use crate::pool::IpMacPool;

/// Observed state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// Nothing is known about the VM yet.
    Unknown,
    /// The VM is defined but not reachable.
    Down,
    /// The VM answered on its service port.
    Up,
}

/// Everything the driver needs to know about one virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Unique name within the batch; also the libvirt domain name.
    pub id: String,
    /// The physical host the VM is placed on. `None` until placement; once
    /// assigned, only a migration may change it.
    pub host: Option<HostId>,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<String>,
    pub mem_mb: u64,
    pub vcpus: u32,
    /// `"auto"` or a comma-separated list of physical cores to pin to.
    pub cpuset: String,
    pub disk_gb: u64,
    /// Path (on the host) of the shared base image the VM disk derives from.
    pub backing_file: String,
    /// Make an independent full copy of the base image instead of a
    /// copy-on-write overlay, for workloads that must be write-isolated
    /// from the shared backing store.
    pub real_copy: bool,
    pub state: VmState,
}

/// Default values applied to any descriptor field the caller leaves alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub mem_mb: u64,
    pub vcpus: u32,
    pub cpuset: String,
    pub disk_gb: u64,
    pub backing_file: String,
    pub real_copy: bool,
    pub state: VmState,
}

impl Default for VmTemplate {
    fn default() -> Self {
        VmTemplate {
            mem_mb: 512,
            vcpus: 1,
            cpuset: "auto".into(),
            disk_gb: 10,
            backing_file: "/tmp/vm-base.img".into(),
            real_copy: false,
            state: VmState::Down,
        }
    }
}

/// A per-field override for the descriptor factory: either fall back to the
/// template, broadcast one value to the whole batch, or give one value per
/// VM (length must match the batch).
#[derive(Debug, Clone)]
pub enum Field<T> {
    Default,
    Uniform(T),
    PerVm(Vec<T>),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Default
    }
}

impl<T: Clone> Field<T> {
    fn resolve(&self, name: &str, n: usize, default: &T) -> Result<Vec<T>, failure::Error> {
        match self {
            Field::Default => Ok(vec![default.clone(); n]),
            Field::Uniform(v) => Ok(vec![v.clone(); n]),
            Field::PerVm(vs) => {
                if vs.len() != n {
                    return Err(format_err!(
                        "per-VM values for `{}` have length {} but the batch has {} VMs",
                        name,
                        vs.len(),
                        n
                    ));
                }
                Ok(vs.clone())
            }
        }
    }
}

/// Per-field overrides for `define_vms`. Any field left `Default` falls
/// back to the template.
#[derive(Debug, Clone, Default)]
pub struct VmSpec {
    pub mem_mb: Field<u64>,
    pub vcpus: Field<u32>,
    pub cpuset: Field<String>,
    pub disk_gb: Field<u64>,
    pub backing_file: Field<String>,
    pub real_copy: Field<bool>,
    pub state: Field<VmState>,
}

/// Build one descriptor per id, in id order.
///
/// `ip_mac` draws `ids.len()` pairs from the pool in order; passing `None`
/// leaves the network identity unset, which is enough for placement-only
/// dry runs. Descriptor construction has no other side effects.
pub fn define_vms(
    ids: &[&str],
    ip_mac: Option<&mut IpMacPool>,
    template: &VmTemplate,
    spec: &VmSpec,
) -> Result<Vec<VmDescriptor>, failure::Error> {
    let n = ids.len();

    {
        let distinct: HashSet<_> = ids.iter().collect();
        if distinct.len() != n {
            return Err(format_err!("VM ids are not unique within the batch"));
        }
    }

    let mem_mb = spec.mem_mb.resolve("mem_mb", n, &template.mem_mb)?;
    let vcpus = spec.vcpus.resolve("vcpus", n, &template.vcpus)?;
    let cpuset = spec.cpuset.resolve("cpuset", n, &template.cpuset)?;
    let disk_gb = spec.disk_gb.resolve("disk_gb", n, &template.disk_gb)?;
    let backing_file = spec.backing_file.resolve("backing_file", n, &template.backing_file)?;
    let real_copy = spec.real_copy.resolve("real_copy", n, &template.real_copy)?;
    let state = spec.state.resolve("state", n, &template.state)?;

    let pairs = match ip_mac {
        Some(pool) => pool.take(n)?.into_iter().map(|(ip, mac)| (Some(ip), Some(mac))).collect(),
        None => vec![(None, None); n],
    };

    let vms = ids
        .iter()
        .enumerate()
        .map(|(i, id)| VmDescriptor {
            id: id.to_string(),
            host: None,
            ip: pairs[i].0,
            mac: pairs[i].1.clone(),
            mem_mb: mem_mb[i],
            vcpus: vcpus[i],
            cpuset: cpuset[i].clone(),
            disk_gb: disk_gb[i],
            backing_file: backing_file[i].clone(),
            real_copy: real_copy[i],
            state: state[i],
        })
        .collect::<Vec<_>>();

    debug!(
        "defined {} VMs: {}",
        vms.len(),
        vms.iter().map(|vm| vm.id.as_str()).collect::<Vec<_>>().join(" ")
    );
    Ok(vms)
}

/// Log a one-line summary of a batch.
pub fn show_vms(vms: &[VmDescriptor]) {
    info!(
        "Virtual machines: {}",
        vms.iter()
            .map(|vm| format!(
                "{} ({}MB, {} cpu {}, {}GB)",
                style(&vm.id).cyan(),
                vm.mem_mb,
                vm.vcpus,
                vm.cpuset,
                vm.disk_gb
            ))
            .collect::<Vec<_>>()
            .join(", ")
    );
}

/// Render the per-host state of a batch, one host per line, VMs colored by
/// state (green up, red down, dim unknown).
pub fn state_summary(vms: &[VmDescriptor]) -> String {
    let mut by_host: indexmap::IndexMap<String, Vec<&VmDescriptor>> = indexmap::IndexMap::new();
    for vm in vms {
        let host = vm
            .host
            .as_ref()
            .map(|h| h.shortname().to_string())
            .unwrap_or_else(|| "unplaced".to_string());
        by_host.entry(host).or_insert_with(Vec::new).push(vm);
    }

    let mut out = String::new();
    for (host, host_vms) in &by_host {
        out.push('\n');
        out.push_str(&format!("{}: ", style(host).magenta()));
        for vm in host_vms {
            let styled = match vm.state {
                VmState::Up => style(&vm.id).green(),
                VmState::Down => style(&vm.id).red(),
                VmState::Unknown => style(&vm.id).dim(),
            };
            out.push_str(&format!("{} ", styled));
        }
    }
    out
}
