use crate::{
    checks,
    config::{Config, SyncMode},
    control::{self, PortMapping},
    error::{PortwrapError, classify},
    gate::StartGate,
    namespace::{Exit, IsolationOptions, NamespaceHandle, NamespaceLauncher},
    netstack::{NetStackHandle, NetStackLauncher, NetStackOptions},
    registry::CleanupRegistry,
    template::CommandTemplate,
    utils::display_argv,
};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::{path::Path, sync::Arc, time::Duration};

/// Progress of one invocation. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Init,
    NamespaceStarted,
    PidKnown,
    NetstackStarted,
    ForwardInstalled,
    NamespaceUnblocked,
    Running,
    Terminating,
    Done,
}

#[derive(Debug)]
pub struct Orchestrator {
    mapping: PortMapping,
    command: Vec<String>,
    sync: SyncMode,
    settle: Duration,
    namespace: NamespaceLauncher,
    netstack: NetStackLauncher,
    registry: Arc<CleanupRegistry>,
    state: State,
}

impl Orchestrator {
    /// Validates the environment and prepares an invocation from the CLI.
    pub fn new(config: &Config, registry: Arc<CleanupRegistry>) -> Result<Self> {
        let template = config.template();
        if template.is_empty() {
            return Err(PortwrapError::Argument("no command given".into()).into());
        }

        checks::require_namespaces(config.namespace.unshare_user)?;

        let bwrap = resolve(&config.tools.bwrap, "namespace tool")
            .map_err(|error| PortwrapError::namespace(format!("{error:#}")))?;
        let slirp4netns = resolve(&config.tools.slirp4netns, "network stack")?;

        let namespace = NamespaceLauncher::new(IsolationOptions {
            program: bwrap,
            unshare_user: config.namespace.unshare_user,
            info_timeout: config.timing.info_timeout,
        });
        let netstack = NetStackLauncher::new(NetStackOptions::new(
            slirp4netns,
            config.timing.startup_timeout,
        ));
        let mapping = PortMapping::new(config.ports.host_port, config.ports.guest_port);

        Ok(Self::with_launchers(
            mapping,
            &template,
            config.sync_mode(),
            config.timing.settle,
            namespace,
            netstack,
            registry,
        ))
    }

    pub fn with_launchers(
        mapping: PortMapping,
        template: &CommandTemplate,
        sync: SyncMode,
        settle: Duration,
        namespace: NamespaceLauncher,
        netstack: NetStackLauncher,
        registry: Arc<CleanupRegistry>,
    ) -> Self {
        Self {
            mapping,
            command: template.render(mapping.guest_port),
            sync,
            settle,
            namespace,
            netstack,
            registry,
            state: State::Init,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Runs the command to completion and returns how it exited.
    ///
    /// Every path out of here has stopped the network stack and the
    /// namespace launcher.
    pub fn run(&mut self) -> Result<Exit> {
        if self.state != State::Init {
            return Err(anyhow!("Invocation already ran"));
        }

        info!(
            "Forwarding host port {} to guest port {} for: {}",
            self.mapping.host_port,
            self.mapping.guest_port,
            display_argv(&self.command)
        );

        let (mut gate, gate_end) = match self.sync {
            SyncMode::Gated => {
                let (gate, end) = StartGate::new()?;
                (Some(gate), Some(end))
            }
            SyncMode::Ungated => {
                warn!("Running ungated: the command may start before its port is forwarded");
                (None, None)
            }
        };

        let mut namespace = self
            .namespace
            .spawn(&self.command, gate_end)
            .map_err(|error| self.interrupted_or(error))?;
        self.registry.register_namespace(namespace.pid());
        self.transition(State::NamespaceStarted);

        let netstack = match self.configure(&mut namespace, gate.as_mut()) {
            Ok(netstack) => netstack,
            Err(error) => {
                self.transition(State::Terminating);
                // The namespace must be dead before the gate closes, as EOF
                // would let the command start.
                self.stop_namespace(&namespace);
                drop(gate);
                self.transition(State::Done);
                return Err(self.interrupted_or(error));
            }
        };

        self.transition(State::Running);
        let exit = self.supervise(&namespace);

        self.transition(State::Terminating);
        self.stop_netstack(netstack);
        if exit.is_err() {
            self.stop_namespace(&namespace);
        }
        drop(gate);
        self.transition(State::Done);

        if let Some(signal) = self.registry.interrupted() {
            return Err(PortwrapError::Interrupted { signal }.into());
        }

        let exit = exit?;
        info!("Namespaced command exited with code {}", exit.code());
        Ok(exit)
    }

    /// Everything between namespace creation and letting the command run.
    fn configure(
        &mut self,
        namespace: &mut NamespaceHandle,
        gate: Option<&mut StartGate>,
    ) -> Result<NetStackHandle> {
        let registry = Arc::clone(&self.registry);

        let info = namespace
            .await_report(self.namespace.info_timeout(), || registry.interrupted())
            .context("Failed to learn the namespaced command's pid")?;
        self.transition(State::PidKnown);

        let mut netstack = self.netstack.spawn(Pid::from_raw(info.child_pid))?;
        self.registry.register_netstack(netstack.pid());

        if let Err(error) = self.install_forward(&mut netstack, gate) {
            self.stop_netstack(netstack);
            return Err(error);
        }

        Ok(netstack)
    }

    fn install_forward(
        &mut self,
        netstack: &mut NetStackHandle,
        gate: Option<&mut StartGate>,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);

        netstack
            .wait_ready(self.netstack.options(), || registry.interrupted())
            .context("Network stack did not become ready")?;
        self.transition(State::NetstackStarted);
        debug_assert!(netstack.is_ready());

        control::send_forward(netstack.socket(), self.mapping, self.settle)
            .context("Failed to install port forward")?;
        self.transition(State::ForwardInstalled);

        if let Some(gate) = gate {
            gate.release()?;
            debug_assert!(gate.is_released());
            self.transition(State::NamespaceUnblocked);
        }

        Ok(())
    }

    /// Waits for the namespace launcher, which exits with the command.
    fn supervise(&self, namespace: &NamespaceHandle) -> Result<Exit> {
        if let Some(child) = namespace.child_pid() {
            debug!("Supervising namespaced command {child}");
        }

        namespace.wait_exited()?;
        self.registry.unregister_namespace();
        namespace.wait()
    }

    fn stop_netstack(&self, mut netstack: NetStackHandle) {
        self.registry.unregister_netstack();
        debug!("Stopping network stack {}", netstack.pid());

        if let Err(error) = netstack.terminate() {
            warn!("Failed to stop network stack: {error:#}");
        }
    }

    fn stop_namespace(&self, namespace: &NamespaceHandle) {
        self.registry.unregister_namespace();
        debug!("Stopping namespace launcher {}", namespace.pid());

        if let Err(error) = namespace.terminate() {
            warn!("Failed to stop namespace launcher: {error:#}");
        }
    }

    /// An interrupt explains whatever failure it caused.
    fn interrupted_or(&self, error: anyhow::Error) -> anyhow::Error {
        match self.registry.interrupted() {
            Some(signal) if !matches!(classify(&error), Some(PortwrapError::Interrupted { .. })) => {
                debug!("Failure after interrupt: {error:#}");
                PortwrapError::Interrupted { signal }.into()
            }
            _ => error,
        }
    }

    fn transition(&mut self, next: State) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        info!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

fn resolve(tool: &Path, role: &str) -> Result<std::path::PathBuf> {
    checks::resolve_tool(tool)
        .ok_or_else(|| anyhow!("{role} {} not found or not executable", tool.display()))
}
