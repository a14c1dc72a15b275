//! Readiness polling for started VMs.
//!
//! An open service port is the proxy for "fully booted". Large batches
//! boot at uneven rates, so the poller is a convergence loop rather than a
//! fixed-count retry: progress between rounds resets nothing, stalled
//! progress triggers targeted remediation (restart of VMs the hypervisor
//! does not report as running), and only stalled rounds consume the round
//! budget. Readiness is monotone, so the loop is bounded regardless.
//!
//! The scan and the clock are injectable so the state machine is testable
//! without network I/O.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::offset::Local;
use failure::format_err;
use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::commands::{self, VIRSH};
use crate::config::WaitConfig;
use crate::error::FleetError;
use crate::host::HostId;
use crate::remote::RemoteExec;
use crate::vm::{VmDescriptor, VmState};

/// Sleep between scan rounds.
pub trait Clock {
    fn sleep(&mut self, interval: Duration);
}

/// The production clock.
pub struct WallClock;

impl Clock for WallClock {
    fn sleep(&mut self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

/// One scan round: which target IPs currently have the service port open.
pub trait Scan {
    fn scan(&mut self) -> Result<HashSet<Ipv4Addr>, failure::Error>;
}

/// Scans the target list with nmap, partitioned across the host set.
///
/// The full IP list is pushed to every host once at construction; each
/// round, every host scans its contiguous slice of the list, so the scan
/// parallelizes with the fleet size.
pub struct NmapScan<'e, E: RemoteExec> {
    exec: &'e E,
    port: u16,
    remote_file: String,
    /// Per host: 1-based inclusive line range of the pushed IP file.
    chunks: Vec<(HostId, usize, usize)>,
}

impl<'e, E: RemoteExec> NmapScan<'e, E> {
    pub fn new(
        exec: &'e E,
        hosts: &[HostId],
        vms: &[VmDescriptor],
        port: u16,
    ) -> Result<Self, failure::Error> {
        if hosts.is_empty() {
            return Err(format_err!("no hosts to scan from"));
        }
        let ips: Vec<Ipv4Addr> = vms.iter().filter_map(|vm| vm.ip).collect();
        if ips.len() != vms.len() {
            return Err(format_err!("some VMs have no IP address to scan"));
        }

        let name = format!("vmips-{}", Local::now().format("%Y%m%d-%H%M%S"));
        let local = std::env::temp_dir().join(&name);
        {
            let mut file = std::fs::File::create(&local)?;
            for ip in &ips {
                writeln!(file, "{}", ip)?;
            }
        }
        exec.put_file(hosts, &local, "/tmp")?;
        let _ = std::fs::remove_file(&local);

        let chunks = chunk_ranges(ips.len(), hosts.len())
            .into_iter()
            .zip(hosts.iter())
            .map(|((first, last), host)| (host.clone(), first, last))
            .collect();

        Ok(NmapScan {
            exec,
            port,
            remote_file: format!("/tmp/{}", name),
            chunks,
        })
    }
}

impl<'e, E: RemoteExec> Scan for NmapScan<'e, E> {
    fn scan(&mut self) -> Result<HashSet<Ipv4Addr>, failure::Error> {
        let cmds: IndexMap<HostId, String> = self
            .chunks
            .iter()
            .map(|(host, first, last)| {
                let cmd = format!(
                    "sed -n '{},{}p' {} | nmap -n -PN -iL - -p {} -oG -",
                    first, last, self.remote_file, self.port
                );
                (host.clone(), cmd)
            })
            .collect();

        let results = self.exec.run_per_host(&cmds)?;
        let mut up = HashSet::new();
        for (host, result) in &results {
            if !result.ok {
                // A transient scan failure on one host only delays that
                // slice; the next round scans it again.
                warn!("port scan failed on {}; retrying next round", host);
                continue;
            }
            up.extend(parse_nmap_greppable(&result.stdout));
        }
        Ok(up)
    }
}

/// Split `n` target lines into one contiguous 1-based inclusive range per
/// host. Hosts beyond the target count get no range.
fn chunk_ranges(n: usize, n_hosts: usize) -> Vec<(usize, usize)> {
    let per_host = (n + n_hosts - 1) / n_hosts;
    let mut ranges = Vec::new();
    let mut first = 1;
    while first <= n {
        let last = (first + per_host - 1).min(n);
        ranges.push((first, last));
        first = last + 1;
    }
    ranges
}

/// Extract the IPs with an open port from nmap's greppable (`-oG`) output.
pub fn parse_nmap_greppable(stdout: &str) -> HashSet<Ipv4Addr> {
    stdout
        .lines()
        .filter(|line| line.starts_with("Host:") && line.contains("/open/"))
        .filter_map(|line| line.split_whitespace().nth(1)?.parse().ok())
        .collect()
}

/// Poll until every VM in the batch is reachable.
///
/// Every reachable VM is marked `Up` as soon as a scan sees it. Returns
/// `Ok(())` once all are up; `ReadinessTimeout` with the ready/total count
/// once `cfg.max_rounds` rounds have passed without progress.
pub fn poll<S, C, E>(
    vms: &mut [VmDescriptor],
    scanner: &mut S,
    exec: &E,
    clock: &mut C,
    cfg: &WaitConfig,
) -> Result<(), failure::Error>
where
    S: Scan,
    C: Clock,
    E: RemoteExec,
{
    let total = vms.len();
    let mut prev_ready = ready_count(vms);
    let mut stalled_rounds = 0;

    while stalled_rounds < cfg.max_rounds {
        clock.sleep(Duration::from_secs(cfg.interval_secs));

        let up = scanner.scan()?;
        for vm in vms.iter_mut() {
            if vm.state != VmState::Up {
                if let Some(ip) = vm.ip {
                    if up.contains(&ip) {
                        vm.state = VmState::Up;
                    }
                }
            }
        }

        let ready = ready_count(vms);
        if ready == total {
            info!("all {} VMs have been started", total);
            return Ok(());
        }

        if ready == prev_ready {
            stalled_rounds += 1;
            debug!("no boot progress, stalled round {}", stalled_rounds);
            restart_unresponsive(vms, exec)?;
        } else {
            prev_ready = ready;
        }
        info!("{}: {}/{} VMs up", stalled_rounds, ready, total);
    }

    Err(FleetError::ReadinessTimeout {
        ready: ready_count(vms),
        total,
    }
    .into())
}

/// Build the nmap scanner and poll with the wall clock.
pub fn wait_vms_have_started<E: RemoteExec>(
    vms: &mut [VmDescriptor],
    hosts: &[HostId],
    exec: &E,
    cfg: &WaitConfig,
) -> Result<(), failure::Error> {
    let mut scanner = NmapScan::new(exec, hosts, vms, cfg.port)?;
    poll(vms, &mut scanner, exec, &mut WallClock, cfg)
}

/// Restart every still-down VM that its hypervisor does not list as
/// running. Recovers VMs that failed to boot on the first attempt, for
/// example under transient disk contention. Failures here are logged, not
/// fatal: the round budget is the only exit from the poll.
fn restart_unresponsive<E: RemoteExec>(
    vms: &[VmDescriptor],
    exec: &E,
) -> Result<(), failure::Error> {
    let down: Vec<&VmDescriptor> = vms
        .iter()
        .filter(|vm| vm.state != VmState::Up && vm.host.is_some())
        .collect();
    if down.is_empty() {
        return Ok(());
    }

    let mut hosts: Vec<HostId> = Vec::new();
    for vm in &down {
        let host = vm.host.clone().expect("filtered above");
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    let listed = exec.run_on_hosts(&format!("{} list", VIRSH), &hosts)?;
    let running: HashMap<&HostId, HashSet<String>> = listed
        .iter()
        .map(|(host, result)| {
            let names = commands::parse_virsh_list(&result.stdout)
                .into_iter()
                .filter(|(_, state)| state == "running")
                .map(|(name, _)| name)
                .collect();
            (host, names)
        })
        .collect();

    let to_restart: Vec<VmDescriptor> = down
        .iter()
        .filter(|vm| {
            let host = vm.host.as_ref().expect("filtered above");
            running.get(host).map_or(true, |names| !names.contains(&vm.id))
        })
        .map(|vm| (*vm).clone())
        .collect();
    if to_restart.is_empty() {
        return Ok(());
    }

    info!(
        "restarting {} VM(s) the hypervisor does not report running: {}",
        to_restart.len(),
        to_restart.iter().map(|vm| vm.id.as_str()).collect::<Vec<_>>().join(" ")
    );
    let cmds = commands::build_start_commands(&to_restart)?;
    for (host, result) in exec.run_per_host(&cmds)? {
        if !result.ok {
            warn!("restart command failed on {}", host);
        }
    }
    Ok(())
}

fn ready_count(vms: &[VmDescriptor]) -> usize {
    vms.iter().filter(|vm| vm.state == VmState::Up).count()
}
