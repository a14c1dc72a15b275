//! Batched per-host command construction.
//!
//! Experiments place tens to thousands of VMs per host, so per-VM SSH
//! round-trips do not scale. Each builder renders exactly one composite
//! command per host: the per-VM fragments are collected in descriptor
//! order and joined once at build time, keyed by an insertion-ordered map
//! so the output is reproducible byte for byte. The builders are pure;
//! execution belongs to the lifecycle driver.

use failure::format_err;
use indexmap::IndexMap;

use crate::config::FleetConfig;
use crate::host::HostId;
use crate::vm::VmDescriptor;

/// The libvirt connection every hypervisor command goes through.
pub const VIRSH: &str = "virsh --connect qemu:///system";

/// Path of a VM's disk image on its host.
pub fn disk_path(cfg: &FleetConfig, vm: &VmDescriptor) -> String {
    dir!(&cfg.disk_dir, format!("{}.qcow2", vm.id))
}

fn group_fragments<F>(
    vms: &[VmDescriptor],
    mut fragment: F,
) -> Result<IndexMap<HostId, String>, failure::Error>
where
    F: FnMut(&VmDescriptor) -> Result<String, failure::Error>,
{
    let mut per_host: IndexMap<HostId, Vec<String>> = IndexMap::new();
    for vm in vms {
        let host = vm
            .host
            .as_ref()
            .ok_or_else(|| format_err!("VM {} has no host assigned", vm.id))?;
        per_host
            .entry(host.clone())
            .or_insert_with(Vec::new)
            .push(fragment(vm)?);
    }

    Ok(per_host
        .into_iter()
        .map(|(host, fragments)| (host, fragments.join(" ; ")))
        .collect())
}

/// One disk-creation command per host.
///
/// Copy-on-write VMs get a qcow2 overlay backed by the shared base image;
/// real-copy VMs get an independent full copy of it.
pub fn build_disk_commands(
    vms: &[VmDescriptor],
    cfg: &FleetConfig,
) -> Result<IndexMap<HostId, String>, failure::Error> {
    group_fragments(vms, |vm| {
        Ok(if vm.real_copy {
            format!("cp {} {}", vm.backing_file, disk_path(cfg, vm))
        } else {
            format!(
                "qemu-img create -f qcow2 -o backing_file={},backing_fmt={} {} {}G",
                vm.backing_file,
                cfg.backing_file_fmt,
                disk_path(cfg, vm),
                vm.disk_gb
            )
        })
    })
}

/// One installation command per host, registering each VM with the
/// hypervisor (network device, memory, disk, vcpus, pinning) without
/// starting it.
pub fn build_install_commands(
    vms: &[VmDescriptor],
    cfg: &FleetConfig,
) -> Result<IndexMap<HostId, String>, failure::Error> {
    group_fragments(vms, |vm| {
        let mac = vm
            .mac
            .as_ref()
            .ok_or_else(|| format_err!("VM {} has no MAC address assigned", vm.id))?;
        Ok(format!(
            "virt-install -d --import --connect qemu:///system --nographics \
             --noautoconsole --noreboot --name={} --network network=default,mac={} \
             --ram={} --disk path={},device=disk,bus=virtio,format=qcow2,size={},cache=none \
             --vcpus={} --cpuset={}",
            vm.id,
            mac,
            vm.mem_mb,
            disk_path(cfg, vm),
            vm.disk_gb,
            vm.vcpus,
            vm.cpuset
        ))
    })
}

/// One start command per host, powering on previously-installed VMs.
pub fn build_start_commands(
    vms: &[VmDescriptor],
) -> Result<IndexMap<HostId, String>, failure::Error> {
    group_fragments(vms, |vm| Ok(format!("{} start {}", VIRSH, vm.id)))
}

/// One destroy+undefine command per host, from the domain names found on
/// each host. Hosts with nothing defined are absent from the output.
pub fn build_destroy_commands(
    hosts_vms: &IndexMap<HostId, Vec<String>>,
) -> IndexMap<HostId, String> {
    hosts_vms
        .iter()
        .filter(|(_, names)| !names.is_empty())
        .map(|(host, names)| {
            let cmd = names
                .iter()
                .map(|name| format!("{} destroy {} ; {} undefine {}", VIRSH, name, VIRSH, name))
                .collect::<Vec<_>>()
                .join(" ; ");
            (host.clone(), cmd)
        })
        .collect()
}

/// Parse `virsh list [--all]` output into `(domain, state)` pairs.
///
/// The table looks like:
///
/// ```text
///  Id    Name    State
/// ----------------------
///  1     vm-0    running
///  -     vm-3    shut off
/// ```
pub fn parse_virsh_list(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("--"))
        .skip(1)
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let _id = tokens.next()?;
            let name = tokens.next()?;
            let state = tokens.collect::<Vec<_>>().join(" ");
            if state.is_empty() {
                None
            } else {
                Some((name.to_string(), state))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{define_vms, VmSpec, VmTemplate};

    fn placed_batch(n: usize) -> Vec<VmDescriptor> {
        let ids: Vec<String> = (0..n).map(|i| format!("vm-{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        let mut pool = crate::pool::IpMacPool::new(
            (0..n as u8)
                .map(|i| {
                    (
                        std::net::Ipv4Addr::new(10, 0, 0, i + 1),
                        format!("00:20:4e:00:00:{:02x}", i + 1),
                    )
                })
                .collect(),
        );
        let mut vms =
            define_vms(&id_refs, Some(&mut pool), &VmTemplate::default(), &VmSpec::default())
                .unwrap();
        // Alternate over two hosts so per-host batching is visible.
        for (i, vm) in vms.iter_mut().enumerate() {
            vm.host = Some(HostId::new(if i % 2 == 0 { "h1" } else { "h2" }));
        }
        vms
    }

    #[test]
    fn disk_commands_batch_per_host_in_descriptor_order() {
        let vms = placed_batch(4);
        let cmds = build_disk_commands(&vms, &FleetConfig::default()).unwrap();

        assert_eq!(cmds.len(), 2);
        let h1 = &cmds[&HostId::new("h1")];
        assert!(h1.contains("/tmp/vm-0.qcow2 10G"));
        assert!(h1.contains("/tmp/vm-2.qcow2 10G"));
        assert!(h1.find("vm-0.qcow2").unwrap() < h1.find("vm-2.qcow2").unwrap());
        assert!(h1.contains("backing_file=/tmp/vm-base.img,backing_fmt=raw"));
    }

    #[test]
    fn real_copy_uses_a_full_copy() {
        let mut vms = placed_batch(1);
        vms[0].real_copy = true;
        let cmds = build_disk_commands(&vms, &FleetConfig::default()).unwrap();

        let h1 = &cmds[&HostId::new("h1")];
        assert_eq!(h1, "cp /tmp/vm-base.img /tmp/vm-0.qcow2");
    }

    #[test]
    fn install_commands_carry_identity_and_pinning() {
        let mut vms = placed_batch(2);
        vms[1].cpuset = "0,2".into();
        let cmds = build_install_commands(&vms, &FleetConfig::default()).unwrap();

        let h1 = &cmds[&HostId::new("h1")];
        assert!(h1.contains("--name=vm-0"));
        assert!(h1.contains("mac=00:20:4e:00:00:01"));
        assert!(h1.contains("--ram=512"));
        assert!(h1.contains("--cpuset=auto"));
        let h2 = &cmds[&HostId::new("h2")];
        assert!(h2.contains("--cpuset=0,2"));
    }

    #[test]
    fn builders_are_deterministic() {
        let vms = placed_batch(6);
        let cfg = FleetConfig::default();
        assert_eq!(
            build_install_commands(&vms, &cfg).unwrap(),
            build_install_commands(&vms, &cfg).unwrap()
        );
        assert_eq!(build_start_commands(&vms).unwrap(), build_start_commands(&vms).unwrap());
    }

    #[test]
    fn unplaced_vm_is_an_error() {
        let mut vms = placed_batch(2);
        vms[1].host = None;
        assert!(build_start_commands(&vms).is_err());
    }

    #[test]
    fn missing_mac_is_an_error_at_install_time() {
        let mut vms = placed_batch(1);
        vms[0].mac = None;
        assert!(build_install_commands(&vms, &FleetConfig::default()).is_err());
    }

    #[test]
    fn destroy_skips_empty_hosts() {
        let mut hosts_vms = IndexMap::new();
        hosts_vms.insert(HostId::new("h1"), vec!["vm-0".to_string(), "vm-1".to_string()]);
        hosts_vms.insert(HostId::new("h2"), Vec::new());

        let cmds = build_destroy_commands(&hosts_vms);
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[&HostId::new("h1")],
            "virsh --connect qemu:///system destroy vm-0 ; \
             virsh --connect qemu:///system undefine vm-0 ; \
             virsh --connect qemu:///system destroy vm-1 ; \
             virsh --connect qemu:///system undefine vm-1"
        );
    }

    #[test]
    fn virsh_list_parses_names_and_states() {
        let stdout = " Id    Name                           State\n\
                      ----------------------------------------------------\n \
                      1     vm-0                           running\n \
                      -     vm-3                           shut off\n\n";
        let parsed = parse_virsh_list(stdout);
        assert_eq!(
            parsed,
            vec![
                ("vm-0".to_string(), "running".to_string()),
                ("vm-3".to_string(), "shut off".to_string())
            ]
        );
    }

    #[test]
    fn virsh_list_with_no_domains_is_empty() {
        let stdout = " Id    Name                           State\n\
                      ----------------------------------------------------\n\n";
        assert!(parse_virsh_list(stdout).is_empty());
    }
}
