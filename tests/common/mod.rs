//! A scripted remote executor for exercising the lifecycle driver and the
//! readiness poller without any network I/O.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use indexmap::IndexMap;

use vmfleet::{CommandResult, HostId, RemoteExec};

/// Records every command and file push, and answers `virsh list`,
/// `virsh list --all` and nmap scans from scripted state.
#[derive(Default)]
pub struct MockExec {
    /// Every command issued, in issue order, with its target host.
    pub log: RefCell<Vec<(HostId, String)>>,
    /// Every file push: (host, remote directory).
    pub puts: RefCell<Vec<(HostId, String)>>,
    /// Domain names reported by `virsh list --all`, per host. Destroy
    /// commands clear the host's entry.
    pub defined_vms: RefCell<HashMap<HostId, Vec<String>>>,
    /// Domain names reported by `virsh list`, per host.
    pub running_vms: RefCell<HashMap<HostId, Vec<String>>>,
    /// IPs any nmap scan reports with an open port.
    pub up_ips: RefCell<HashSet<Ipv4Addr>>,
    /// `(host, substring)` pairs: a command containing the substring fails
    /// on that host.
    pub fail_on: RefCell<Vec<(HostId, String)>>,
}

impl MockExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_on(&self, host: &str, names: &[&str]) {
        self.defined_vms
            .borrow_mut()
            .insert(HostId::new(host), names.iter().map(|s| s.to_string()).collect());
    }

    pub fn run_on(&self, host: &str, names: &[&str]) {
        self.running_vms
            .borrow_mut()
            .insert(HostId::new(host), names.iter().map(|s| s.to_string()).collect());
    }

    pub fn mark_up(&self, ip: Ipv4Addr) {
        self.up_ips.borrow_mut().insert(ip);
    }

    pub fn fail_when(&self, host: &str, substring: &str) {
        self.fail_on
            .borrow_mut()
            .push((HostId::new(host), substring.to_string()));
    }

    /// Commands containing `substring`, in issue order.
    pub fn issued(&self, substring: &str) -> Vec<(HostId, String)> {
        self.log
            .borrow()
            .iter()
            .filter(|(_, cmd)| cmd.contains(substring))
            .cloned()
            .collect()
    }

    fn respond(&self, host: &HostId, command: &str) -> CommandResult {
        if command.contains("list --all") {
            let defined = self.defined_vms.borrow();
            return CommandResult::ok(virsh_table(
                defined.get(host).map(|v| v.as_slice()).unwrap_or(&[]),
                "shut off",
            ));
        }
        if command.trim_end().ends_with("system list") {
            let running = self.running_vms.borrow();
            return CommandResult::ok(virsh_table(
                running.get(host).map(|v| v.as_slice()).unwrap_or(&[]),
                "running",
            ));
        }
        if command.contains("nmap") {
            let mut out = String::new();
            for ip in self.up_ips.borrow().iter() {
                out.push_str(&format!("Host: {} ()\tPorts: 22/open/tcp//ssh///\n", ip));
            }
            out.push_str("# Nmap done\n");
            return CommandResult::ok(out);
        }
        if command.contains(" destroy ") {
            self.defined_vms.borrow_mut().remove(host);
            self.running_vms.borrow_mut().remove(host);
            return CommandResult::ok("");
        }
        CommandResult::ok("")
    }
}

impl RemoteExec for MockExec {
    fn run_per_host(
        &self,
        cmds: &IndexMap<HostId, String>,
    ) -> Result<IndexMap<HostId, CommandResult>, failure::Error> {
        let mut results = IndexMap::new();
        for (host, command) in cmds {
            self.log.borrow_mut().push((host.clone(), command.clone()));

            let fails = self
                .fail_on
                .borrow()
                .iter()
                .any(|(h, s)| h == host && command.contains(s.as_str()));
            let result = if fails {
                CommandResult::failed()
            } else {
                self.respond(host, command)
            };
            results.insert(host.clone(), result);
        }
        Ok(results)
    }

    fn put_file(
        &self,
        hosts: &[HostId],
        _local: &Path,
        remote_dir: &str,
    ) -> Result<(), failure::Error> {
        for host in hosts {
            self.puts.borrow_mut().push((host.clone(), remote_dir.to_string()));
        }
        Ok(())
    }
}

/// Render domain names the way `virsh list` prints them.
pub fn virsh_table(names: &[String], state: &str) -> String {
    let mut out = String::from(" Id    Name                           State\n");
    out.push_str("----------------------------------------------------\n");
    for (i, name) in names.iter().enumerate() {
        out.push_str(&format!(" {:<5} {:<30} {}\n", i + 1, name, state));
    }
    out
}

/// A batch of placed VMs: `vm-<i>` with ip `10.0.0.<i+1>`, spread
/// round-robin over the hosts.
pub fn placed_batch(n: usize, hosts: &[&str]) -> Vec<vmfleet::VmDescriptor> {
    let ids: Vec<String> = (0..n).map(|i| format!("vm-{}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    let mut pool = vmfleet::IpMacPool::new(
        (0..n)
            .map(|i| {
                (
                    Ipv4Addr::new(10, 0, 0, (i + 1) as u8),
                    format!("00:20:4e:00:00:{:02x}", i + 1),
                )
            })
            .collect(),
    );
    let mut vms = vmfleet::define_vms(
        &id_refs,
        Some(&mut pool),
        &vmfleet::VmTemplate::default(),
        &vmfleet::VmSpec::default(),
    )
    .unwrap();
    for (i, vm) in vms.iter_mut().enumerate() {
        vm.host = Some(HostId::new(hosts[i % hosts.len()]));
    }
    vms
}

pub fn host_ids(names: &[&str]) -> Vec<HostId> {
    names.iter().map(|name| HostId::new(*name)).collect()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
