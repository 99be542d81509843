//! In-memory transport used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::TransportError;
use super::forward::ForwardSpec;
use super::identity::{NODE_COMMAND, OS_COMMAND};
use super::probe::PROBE_COMMAND;
use super::transport::{ForwardProcess, Transport};

#[derive(Default)]
struct HostBehavior {
    unreachable: bool,
    probe_delay: Duration,
    responses: HashMap<String, String>,
    failing: HashSet<String>,
}

/// Shared view of one spawned mock forward.
#[derive(Default)]
pub(crate) struct ProcessState {
    pub exited: AtomicBool,
    pub terminated: AtomicBool,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }
}

struct MockProcess {
    state: Arc<ProcessState>,
}

#[async_trait]
impl ForwardProcess for MockProcess {
    fn try_exit_status(&mut self) -> Option<String> {
        self.state
            .exited
            .load(Ordering::SeqCst)
            .then(|| "exit status: 255".to_string())
    }

    async fn terminate(&mut self) {
        self.state.terminated.store(true, Ordering::SeqCst);
    }
}

/// Scriptable [`Transport`]. Hosts are reachable and answer identity
/// commands as a generic Linux machine unless told otherwise.
#[derive(Default)]
pub(crate) struct MockTransport {
    hosts: Mutex<HashMap<String, HostBehavior>>,
    probes: Mutex<HashMap<String, usize>>,
    processes: Mutex<Vec<(ForwardSpec, Arc<ProcessState>)>>,
    cancels: Mutex<Vec<ForwardSpec>>,
    fail_spawn: AtomicBool,
    fail_cancel: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_host<R>(&self, host: &str, f: impl FnOnce(&mut HostBehavior) -> R) -> R {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(host.to_string()).or_default())
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.with_host(host, |h| h.unreachable = !reachable);
    }

    pub fn set_probe_delay(&self, host: &str, delay: Duration) {
        self.with_host(host, |h| h.probe_delay = delay);
    }

    pub fn set_response(&self, host: &str, command: &str, output: &str) {
        self.with_host(host, |h| {
            h.responses.insert(command.to_string(), output.to_string());
        });
    }

    pub fn fail_command(&self, host: &str, command: &str) {
        self.with_host(host, |h| {
            h.failing.insert(command.to_string());
        });
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub fn probe_count(&self, host: &str) -> usize {
        self.probes.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn spawn_count(&self, forward: &ForwardSpec) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, _)| f == forward)
            .count()
    }

    /// Most recently spawned process for `forward`
    pub fn last_process(&self, forward: &ForwardSpec) -> Option<Arc<ProcessState>> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(f, _)| f == forward)
            .map(|(_, state)| state.clone())
    }

    pub fn running_processes(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state.is_running())
            .count()
    }

    pub fn cancels(&self) -> Vec<ForwardSpec> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn run_remote_command(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let (unreachable, delay, failing, response) = self.with_host(host, |h| {
            (
                h.unreachable,
                h.probe_delay,
                h.failing.contains(command),
                h.responses.get(command).cloned(),
            )
        });

        if command == PROBE_COMMAND {
            *self
                .probes
                .lock()
                .unwrap()
                .entry(host.to_string())
                .or_default() += 1;
            if !delay.is_zero()
                && tokio::time::timeout(timeout, tokio::time::sleep(delay))
                    .await
                    .is_err()
            {
                return Err(TransportError::Timeout(timeout));
            }
        }

        if unreachable {
            return Err(TransportError::NonZeroExit {
                code: Some(255),
                stderr: format!("ssh: connect to host {} port 22: No route to host", host),
            });
        }
        if failing {
            return Err(TransportError::NonZeroExit {
                code: Some(1),
                stderr: format!("{}: command failed", command),
            });
        }

        Ok(match response {
            Some(output) => output,
            None if command == OS_COMMAND => "Linux\n".to_string(),
            None if command == NODE_COMMAND => format!("{}-node\n", host),
            None => String::new(),
        })
    }

    fn spawn_forward(
        &self,
        forward: &ForwardSpec,
    ) -> Result<Box<dyn ForwardProcess>, TransportError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ssh not found",
            )));
        }
        let state = Arc::new(ProcessState::default());
        self.processes
            .lock()
            .unwrap()
            .push((forward.clone(), state.clone()));
        Ok(Box::new(MockProcess { state }))
    }

    async fn cancel_forward(&self, forward: &ForwardSpec) -> Result<(), TransportError> {
        self.cancels.lock().unwrap().push(forward.clone());
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(TransportError::NonZeroExit {
                code: Some(255),
                stderr: "Control socket connect: No such file or directory".to_string(),
            });
        }
        Ok(())
    }
}
