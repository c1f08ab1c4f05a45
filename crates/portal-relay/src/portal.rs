//! Portal lifecycle
//!
//! [`Portal`] owns every component of a running relay and drives the ordered
//! start sequence:
//!
//! 1. resolve the host gateway (abort on failure, nothing touched yet)
//! 2. install bootstrap bypass routes (best effort)
//! 3. create the virtual interface
//! 4. connect and start the anchor
//! 5. fetch the assigned CIDR
//! 6. activate the interface (address, firewall, NAT, forwarding)
//! 7. spawn the forwarding loops
//! 8. start the status server (failure is logged only)
//!
//! Components are recorded as soon as they exist, so [`Portal::stop`] can
//! unwind whatever a failed start left behind. `stop` runs its teardown
//! exactly once no matter how many callers race on it; every caller returns
//! only after that teardown has finished.

use crate::anchor::{Anchor, AnchorConnector, AnchorParams};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::device::{DeviceFactory, VirtualInterface, DEFAULT_INTERFACE_NAME, DEFAULT_MTU};
use crate::error::{PortalError, Result};
use crate::forwarding::{spawn_loops, ForwardingPolicy};
use crate::gateway::GatewayResolver;
use crate::routes::{
    AssignedAddress, HostResolver, RouteConfigurator, SystemResolver, DEFAULT_BYPASS_HOSTS,
};
use crate::status::{build_router, StatusServer};
use axum::http::Uri;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a [`Portal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Created,
    /// Start in progress, or start failed and only `stop` remains valid
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortalState::Created => "created",
            PortalState::Starting => "starting",
            PortalState::Running => "running",
            PortalState::Stopping => "stopping",
            PortalState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Host-side settings of a portal
#[derive(Debug, Clone)]
pub struct PortalSettings {
    /// Name of the virtual interface to create
    pub interface_name: String,
    pub mtu: usize,
    /// Address the status server binds to
    pub status_bind: SocketAddr,
    /// Hostnames routed around the tunnel
    pub bypass_hosts: Vec<String>,
    pub forwarding: ForwardingPolicy,
    /// Directory holding the status page template; `None` uses the embedded one
    pub template_dir: Option<PathBuf>,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            mtu: DEFAULT_MTU,
            status_bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            bypass_hosts: DEFAULT_BYPASS_HOSTS.iter().map(|h| h.to_string()).collect(),
            forwarding: ForwardingPolicy::default(),
            template_dir: None,
        }
    }
}

/// Per-run parameters passed to [`Portal::start`]
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub anchor: AnchorParams,
    /// Expected host uplink; the discovered default route takes precedence
    pub host_interface: String,
    /// Advertise this portal to the overlay
    pub public: bool,
}

#[derive(Default)]
struct Components {
    routes: Option<Arc<RouteConfigurator>>,
    device: Option<Arc<dyn VirtualInterface>>,
    anchor: Option<Arc<dyn Anchor>>,
    tasks: Vec<JoinHandle<()>>,
    status: Option<StatusServer>,
}

/// Edge relay between a virtual interface and an anchor
pub struct Portal {
    settings: PortalSettings,
    connector: Arc<dyn AnchorConnector>,
    devices: Arc<dyn DeviceFactory>,
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn HostResolver>,
    state: StdMutex<PortalState>,
    components: Mutex<Components>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    /// Set once teardown has completed; held for its whole duration
    stop_guard: Mutex<bool>,
}

impl Portal {
    /// Create a portal using the host's command runner and resolver
    pub fn new(
        settings: PortalSettings,
        connector: Arc<dyn AnchorConnector>,
        devices: Arc<dyn DeviceFactory>,
    ) -> Self {
        Self {
            settings,
            connector,
            devices,
            runner: Arc::new(SystemCommandRunner),
            resolver: Arc::new(SystemResolver),
            state: StdMutex::new(PortalState::Created),
            components: Mutex::new(Components::default()),
            shutdown: CancellationToken::new(),
            fatal: CancellationToken::new(),
            stop_guard: Mutex::new(false),
        }
    }

    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn settings(&self) -> &PortalSettings {
        &self.settings
    }

    pub fn state(&self) -> PortalState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PortalState::Stopped)
    }

    /// Cancelled when a forwarding loop fails or the anchor stops on its own
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Address the status server is listening on, once started
    pub async fn status_addr(&self) -> Option<SocketAddr> {
        self.components
            .lock()
            .await
            .status
            .as_ref()
            .map(StatusServer::local_addr)
    }

    fn set_state(&self, next: PortalState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn begin_start(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PortalError::InvalidState("state lock poisoned".to_string()))?;
        if *state != PortalState::Created {
            return Err(PortalError::InvalidState(format!(
                "cannot start a portal that is {}",
                state
            )));
        }
        *state = PortalState::Starting;
        Ok(())
    }

    /// Bootstrap hosts plus the host of the guardian endpoint
    fn bypass_hosts(&self, endpoint: &str) -> Vec<String> {
        let mut hosts = self.settings.bypass_hosts.clone();
        let endpoint_host = endpoint
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string));

        if let Some(host) = endpoint_host {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    /// Bring the portal up. On error, call [`stop`](Self::stop) to release
    /// whatever was already set up.
    pub async fn start(&self, params: &StartParams) -> Result<()> {
        self.begin_start()?;
        self.bring_up(params).await
    }

    async fn bring_up(&self, params: &StartParams) -> Result<()> {
        let mut components = self.components.lock().await;
        // A stop that ran before the lock was taken has nothing to unwind
        // later, so nothing may be installed after it.
        if self.shutdown.is_cancelled() {
            return Err(PortalError::InvalidState(
                "portal was stopped before start completed".to_string(),
            ));
        }

        let host = GatewayResolver::new(self.runner.as_ref()).resolve().await?;
        if !params.host_interface.is_empty() && params.host_interface != host.egress_interface() {
            warn!(
                configured = %params.host_interface,
                discovered = %host.egress_interface(),
                "Default route uses a different host interface"
            );
        }

        let routes = Arc::new(RouteConfigurator::new(
            self.runner.clone(),
            host,
            self.settings.interface_name.clone(),
        ));
        components.routes = Some(routes.clone());

        let hosts = self.bypass_hosts(&params.anchor.endpoint);
        routes
            .install_bypass_routes(&hosts, self.resolver.as_ref())
            .await;

        let device = self
            .devices
            .create(&self.settings.interface_name, self.settings.mtu)
            .await?;
        components.device = Some(device.clone());

        let anchor = self.connector.connect(true, params.public)?;
        components.anchor = Some(anchor.clone());
        anchor.start(&params.anchor).await?;

        let cidr = anchor.cidr().await?;
        let address = AssignedAddress::from_cidr(&cidr)?;
        routes.activate(&address).await?;

        components.tasks = spawn_loops(
            anchor.clone(),
            device,
            self.settings.forwarding,
            self.shutdown.clone(),
            self.fatal.clone(),
        );
        components.tasks.push(self.watch_anchor(anchor.clone()));

        let router = build_router(anchor, self.settings.template_dir.clone());
        match StatusServer::start(self.settings.status_bind, router).await {
            Ok(server) => components.status = Some(server),
            Err(e) => error!(error = %e, "Failed to start status server"),
        }

        self.set_state(PortalState::Running);
        info!(
            interface = %self.settings.interface_name,
            address = %address,
            "Portal started"
        );
        Ok(())
    }

    /// Raise the fatal signal if the anchor finishes before `stop`
    fn watch_anchor(&self, anchor: Arc<dyn Anchor>) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        let fatal = self.fatal.clone();
        let done = anchor.done();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = done.cancelled() => {
                    error!("Anchor stopped unexpectedly");
                    fatal.cancel();
                }
            }
        })
    }

    /// Tear the portal down: cancel the loops, stop the anchor, release host
    /// network state, close the interface and stop the status server.
    ///
    /// Safe to call in any state and from many tasks at once.
    pub async fn stop(&self) {
        let mut stopped = self.stop_guard.lock().await;
        if *stopped {
            return;
        }
        self.set_state(PortalState::Stopping);

        self.shutdown.cancel();
        let mut components = self.components.lock().await;

        if let Some(anchor) = components.anchor.take() {
            anchor.stop().await;
        }

        if let Some(routes) = components.routes.take() {
            routes.clean_up().await;
        }

        if let Some(device) = components.device.take() {
            if let Err(e) = device.close().await {
                warn!(error = %e, "Failed to close virtual interface");
            }
        }

        if let Some(status) = components.status.take() {
            status.shutdown().await;
        }

        for task in components.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Portal task ended abnormally");
            }
        }

        *stopped = true;
        self.set_state(PortalState::Stopped);
        info!("Portal stopped");
    }
}
