//! The per-experiment VM lifecycle driver.
//!
//! One deployment is a strict sequence: destroy whatever a previous run
//! left behind, create disks, install, start, then wait for the fleet to
//! come up. Each step issues one batched command per host, in parallel
//! across hosts, and blocks until the slowest host finishes. Any host
//! failing any step fails the whole run immediately: a partially-deployed
//! fleet is useless for benchmarking.

use console::style;
use indexmap::IndexMap;
use log::{debug, info};

use crate::commands::{self, VIRSH};
use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::host::HostId;
use crate::readiness;
use crate::remote::RemoteExec;
use crate::vm::{state_summary, VmDescriptor};

/// Progress of one deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    /// Cleaning up leftovers from previous runs.
    Destroying,
    /// Per-VM disk images exist on every host.
    DisksReady,
    /// Every VM is registered with its hypervisor.
    Installed,
    /// Every VM has been powered on.
    Started,
    /// Every VM answered on its service port. Terminal success.
    ConvergedReady,
    /// A step failed on at least one host. Terminal.
    Failed,
}

/// Drives the lifecycle of one VM batch over a fixed host set.
pub struct VmDeployment<'e, E: RemoteExec> {
    exec: &'e E,
    hosts: Vec<HostId>,
    cfg: FleetConfig,
    state: DeployState,
}

impl<'e, E: RemoteExec> VmDeployment<'e, E> {
    pub fn new(exec: &'e E, hosts: &[HostId], cfg: FleetConfig) -> Self {
        VmDeployment {
            exec,
            hosts: hosts.to_vec(),
            cfg,
            state: DeployState::Destroying,
        }
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    pub fn config(&self) -> &FleetConfig {
        &self.cfg
    }

    /// Run the whole sequence: destroy leftovers, create disks, install,
    /// start, wait for convergence.
    pub fn deploy(&mut self, vms: &mut [VmDescriptor]) -> Result<(), failure::Error> {
        self.destroy_existing()?;
        self.create_disks(vms)?;
        self.install(vms)?;
        self.start(vms)?;
        self.wait_started(vms)?;
        info!("deployed virtual machines:{}", state_summary(vms));
        Ok(())
    }

    /// Force-stop and undefine every VM currently defined on the hosts,
    /// including shut-off ones, and clear stale disk images, so the run
    /// starts from a clean slate. Idempotent: with nothing defined, no
    /// destroy command is issued and nothing errors.
    pub fn destroy_existing(&mut self) -> Result<(), failure::Error> {
        self.state = DeployState::Destroying;
        print_step("DESTROYING EXISTING VMS");

        let listed = self
            .exec
            .run_on_hosts(&format!("{} list --all", VIRSH), &self.hosts)?;
        self.check_step("destroy", &listed)?;

        let mut hosts_vms: IndexMap<HostId, Vec<String>> = IndexMap::new();
        for (host, result) in &listed {
            let names: Vec<String> = commands::parse_virsh_list(&result.stdout)
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            hosts_vms.insert(host.clone(), names);
        }

        let cmds = commands::build_destroy_commands(&hosts_vms);
        if cmds.is_empty() {
            debug!("no VMs defined on any host");
        } else {
            let results = self.exec.run_per_host(&cmds)?;
            self.check_step("destroy", &results)?;
        }

        let rm = format!("rm -f {}/*.qcow2", self.cfg.disk_dir);
        let results = self.exec.run_on_hosts(&rm, &self.hosts)?;
        self.check_step("destroy", &results)
    }

    /// Create every VM's disk image on its host.
    pub fn create_disks(&mut self, vms: &[VmDescriptor]) -> Result<(), failure::Error> {
        print_step("CREATING DISKS");
        let cmds = commands::build_disk_commands(vms, &self.cfg)?;
        let results = self.exec.run_per_host(&cmds)?;
        self.check_step("disks", &results)?;
        self.state = DeployState::DisksReady;
        Ok(())
    }

    /// Register every VM with its hypervisor, without starting it.
    pub fn install(&mut self, vms: &[VmDescriptor]) -> Result<(), failure::Error> {
        print_step("INSTALLING VMS");
        let cmds = commands::build_install_commands(vms, &self.cfg)?;
        for (host, _) in &cmds {
            info!(
                "- {} VM(s) on {}",
                vms.iter().filter(|vm| vm.host.as_ref() == Some(host)).count(),
                style(host.shortname()).magenta()
            );
        }
        let results = self.exec.run_per_host(&cmds)?;
        self.check_step("install", &results)?;
        self.state = DeployState::Installed;
        Ok(())
    }

    /// Power on every VM.
    pub fn start(&mut self, vms: &[VmDescriptor]) -> Result<(), failure::Error> {
        print_step("STARTING VMS");
        let cmds = commands::build_start_commands(vms)?;
        let results = self.exec.run_per_host(&cmds)?;
        self.check_step("start", &results)?;
        self.state = DeployState::Started;
        Ok(())
    }

    /// Wait for every VM to answer on its service port.
    pub fn wait_started(&mut self, vms: &mut [VmDescriptor]) -> Result<(), failure::Error> {
        print_step("WAITING FOR VMS TO BOOT");
        match readiness::wait_vms_have_started(vms, &self.hosts, self.exec, &self.cfg.wait) {
            Ok(()) => {
                self.state = DeployState::ConvergedReady;
                Ok(())
            }
            Err(err) => {
                self.state = DeployState::Failed;
                Err(err)
            }
        }
    }

    /// Boot VMs in waves of one per cpuset, waiting for each wave to come
    /// up before starting the next. For boot-time measurements, where
    /// simultaneously booting several VMs pinned to the same cores would
    /// skew the numbers.
    pub fn boot_by_core(&mut self, vms: &mut [VmDescriptor]) -> Result<(), failure::Error> {
        let mut by_cpuset: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, vm) in vms.iter().enumerate() {
            by_cpuset
                .entry(vm.cpuset.clone())
                .or_insert_with(Vec::new)
                .push(i);
        }

        let total = vms.len();
        let mut booted = 0;
        loop {
            let wave: Vec<usize> = by_cpuset
                .values_mut()
                .filter_map(|queue| if queue.is_empty() { None } else { Some(queue.remove(0)) })
                .collect();
            if wave.is_empty() {
                break;
            }

            let mut wave_vms: Vec<VmDescriptor> = wave.iter().map(|&i| vms[i].clone()).collect();
            info!(
                "starting VM(s) {}",
                wave_vms.iter().map(|vm| vm.id.as_str()).collect::<Vec<_>>().join(" ")
            );
            self.start(&wave_vms)?;
            match readiness::wait_vms_have_started(&mut wave_vms, &self.hosts, self.exec, &self.cfg.wait)
            {
                Ok(()) => {}
                Err(err) => {
                    self.state = DeployState::Failed;
                    return Err(err);
                }
            }

            for (&i, wave_vm) in wave.iter().zip(&wave_vms) {
                vms[i].state = wave_vm.state;
            }
            booted += wave.len();
            info!("{}", style(format!("{}/{} booted", booted, total)).cyan());
        }

        self.state = DeployState::ConvergedReady;
        Ok(())
    }

    /// Fail the run if any host's command reported failure, naming the
    /// step and every failed host.
    fn check_step(
        &mut self,
        step: &'static str,
        results: &IndexMap<HostId, crate::remote::CommandResult>,
    ) -> Result<(), failure::Error> {
        let failed: Vec<&HostId> = results
            .iter()
            .filter(|(_, result)| !result.ok)
            .map(|(host, _)| host)
            .collect();
        if failed.is_empty() {
            return Ok(());
        }

        self.state = DeployState::Failed;
        Err(FleetError::RemoteCommandFailed {
            step,
            hosts: failed.iter().map(|host| host.to_string()).collect::<Vec<_>>().join(", "),
        }
        .into())
    }
}

fn print_step(desc: &str) {
    info!("{}", style(format!(" {} ", desc)).red().bold());
}
