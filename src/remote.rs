//! Remote command execution across the host set.
//!
//! All side effects of the driver go through the `RemoteExec` trait, so the
//! lifecycle and readiness state machines can be exercised against scripted
//! executors in tests. The production implementation keeps one SSH shell
//! per host and fans a step's batched commands out on spawned background
//! shells, joining them all before returning; concurrency lives here and
//! nowhere else.

use std::collections::HashMap;
use std::path::Path;

use failure::format_err;
use indexmap::IndexMap;
use log::{debug, info, warn};
use spurs::{cmd, Execute, SshShell};

use crate::host::HostId;

/// Outcome of one host's batched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub ok: bool,
    pub stdout: String,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandResult {
            ok: true,
            stdout: stdout.into(),
        }
    }

    pub fn failed() -> Self {
        CommandResult {
            ok: false,
            stdout: String::new(),
        }
    }
}

/// Remote execution over a set of hosts.
///
/// Commands run concurrently across hosts and the call blocks until every
/// host has finished; within one host a command string runs as submitted.
/// A host-level failure is reported in its `CommandResult`, not as an
/// `Err`: callers decide which steps are fatal.
pub trait RemoteExec {
    /// Run a distinct command per host, in parallel across hosts.
    fn run_per_host(
        &self,
        cmds: &IndexMap<HostId, String>,
    ) -> Result<IndexMap<HostId, CommandResult>, failure::Error>;

    /// Run the same command on every host, in parallel.
    fn run_on_hosts(
        &self,
        command: &str,
        hosts: &[HostId],
    ) -> Result<IndexMap<HostId, CommandResult>, failure::Error> {
        let cmds: IndexMap<HostId, String> = hosts
            .iter()
            .map(|host| (host.clone(), command.to_string()))
            .collect();
        self.run_per_host(&cmds)
    }

    /// Push a local file to a directory on every host.
    fn put_file(
        &self,
        hosts: &[HostId],
        local: &Path,
        remote_dir: &str,
    ) -> Result<(), failure::Error>;
}

/// SSH-backed executor with one persistent shell per host.
pub struct SshExec {
    username: String,
    shells: HashMap<HostId, SshShell>,
}

impl SshExec {
    /// Open a shell to every host. Hosts may carry an explicit SSH port
    /// (`name:2222`); everything else defaults to 22.
    pub fn connect(username: &str, hosts: &[HostId]) -> Result<Self, failure::Error> {
        let mut shells = HashMap::new();
        for host in hosts {
            let (addr, port) = host.addr();
            let (ip, port) = spurs_util::get_host_ip(format!("{}:{}", addr, port));
            let shell = SshShell::with_default_key(username, (ip, port))?;
            shells.insert(host.clone(), shell);
        }
        info!("connected to {} host(s)", shells.len());

        Ok(SshExec {
            username: username.to_string(),
            shells,
        })
    }

    fn shell(&self, host: &HostId) -> Result<&SshShell, failure::Error> {
        self.shells
            .get(host)
            .ok_or_else(|| format_err!("no connection to host {}", host))
    }
}

impl RemoteExec for SshExec {
    fn run_per_host(
        &self,
        cmds: &IndexMap<HostId, String>,
    ) -> Result<IndexMap<HostId, CommandResult>, failure::Error> {
        // Fan out: each host's command runs on a spawned background shell.
        // The spawned shell must stay alive until its handle is joined.
        let mut handles = Vec::with_capacity(cmds.len());
        for (host, command) in cmds {
            debug!("{}: {}", host.shortname(), command);
            let (shell, handle) = self.shell(host)?.spawn(cmd!("{}", command))?;
            handles.push((host.clone(), shell, handle));
        }

        // Fan in: wait for the slowest host.
        let mut results = IndexMap::new();
        for (host, _shell, handle) in handles {
            let result = match handle.join() {
                Ok(output) => CommandResult::ok(output.stdout),
                Err(err) => {
                    warn!("command failed on {}: {}", host, err);
                    CommandResult::failed()
                }
            };
            results.insert(host, result);
        }
        Ok(results)
    }

    fn put_file(
        &self,
        hosts: &[HostId],
        local: &Path,
        remote_dir: &str,
    ) -> Result<(), failure::Error> {
        for host in hosts {
            let (addr, port) = host.addr();
            let status = std::process::Command::new("scp")
                .arg("-P")
                .arg(port.to_string())
                .arg("-o")
                .arg("StrictHostKeyChecking=no")
                .arg(local)
                .arg(format!("{}@{}:{}/", self.username, addr, remote_dir))
                .status()?;
            if !status.success() {
                return Err(format_err!("scp of {:?} to {} failed: {}", local, host, status));
            }
        }
        Ok(())
    }
}
