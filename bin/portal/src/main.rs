//! veilnet-portal -- joins this host to a VeilNet overlay as a portal.
//!
//! Configuration is read from `config.yaml` (or `--config`), then
//! `VEILNET_*` environment variables and flags. The portal runs until
//! SIGINT/SIGTERM or until forwarding fails for good, then tears down the
//! host network changes within `shutdown_timeout_secs`.

mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cli::Cli;
use config::{ConfigSource, PortalConfig};
use portal_observability::init_logging;
use portal_relay::{
    status, MemoryAnchor, MemoryAnchorConnector, Portal, StartParams, TunDeviceFactory,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, source) = config::load(cli.config.as_deref());
    config.apply_overrides(&cli);

    // Hold the guard for the life of the process so file logs are flushed
    let _log_guard = match init_logging(&config.logging_config(cli.verbose))
        .context("Failed to initialize logging")
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Loaded config file"),
        ConfigSource::NotFound(path) => warn!(
            path = %path.display(),
            "Config file not found, using environment variables and defaults"
        ),
        ConfigSource::Invalid(path, reason) => error!(
            path = %path.display(),
            error = %reason,
            "Error reading config file, using environment variables and defaults"
        ),
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(run(config));
    rt.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Portal exited with error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: PortalConfig) -> Result<()> {
    let anchor = MemoryAnchor::new(&config.anchor_cidr)
        .context("Invalid anchor_cidr")?
        .with_mode(true, config.public)
        .with_history_limit(config.anchor_history);
    let connector = Arc::new(MemoryAnchorConnector::new(Arc::new(anchor)));

    let portal = Arc::new(Portal::new(
        config.settings(status::executable_dir()),
        connector,
        Arc::new(TunDeviceFactory),
    ));

    info!(
        anchor = %config.anchor_name,
        domain = %config.domain_name,
        region = %config.region,
        public = config.public,
        "Starting portal"
    );

    let outcome = supervise(
        &portal,
        config.start_params(),
        wait_for_shutdown(portal.fatal_signal()),
    )
    .await;
    stop_with_timeout(&portal, config.shutdown_timeout()).await;

    match outcome? {
        ShutdownReason::Signal => Ok(()),
        ShutdownReason::Fatal => anyhow::bail!("Packet forwarding failed"),
    }
}

/// Start the portal and wait for `shutdown`, which is already listening
/// while start is still in progress. The caller stops the portal afterwards;
/// that stop waits for an in-flight start and unwinds everything it did.
async fn supervise(
    portal: &Arc<Portal>,
    params: StartParams,
    shutdown: impl Future<Output = Result<ShutdownReason>>,
) -> Result<ShutdownReason> {
    let starting = {
        let portal = portal.clone();
        tokio::spawn(async move { portal.start(&params).await })
    };
    tokio::pin!(shutdown);

    tokio::select! {
        started = starting => {
            if let Err(e) = started.context("Portal start task failed")? {
                error!(error = %e, "Failed to start portal");
                return Err(e).context("Failed to start portal");
            }
            shutdown.await
        }
        reason = &mut shutdown => {
            warn!("Shutdown requested during startup");
            reason
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Signal,
    Fatal,
}

/// Wait for SIGINT, SIGTERM, or the portal reporting a fatal error
async fn wait_for_shutdown(fatal: CancellationToken) -> Result<ShutdownReason> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received shutdown signal, shutting down...");
            Ok(ShutdownReason::Signal)
        }
        result = terminate => {
            result?;
            info!("Received shutdown signal, shutting down...");
            Ok(ShutdownReason::Signal)
        }
        _ = fatal.cancelled() => {
            error!("Portal failed, shutting down...");
            Ok(ShutdownReason::Fatal)
        }
    }
}

/// Stop the portal, giving up after `timeout`
async fn stop_with_timeout(portal: &Arc<Portal>, timeout: Duration) -> bool {
    let stopping = portal.clone();
    match tokio::time::timeout(timeout, async move { stopping.stop().await }).await {
        Ok(()) => {
            info!("Cleanup completed successfully");
            true
        }
        Err(_) => {
            error!(timeout_secs = timeout.as_secs(), "Cleanup timeout, forcing exit");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use portal_relay::{
        AnchorParams, CommandOutput, CommandRunner, MemoryDeviceFactory, MemoryInterface,
        PortalSettings, PortalState, RecordingRunner, StaticResolver,
    };
    use std::net::Ipv4Addr;
    use tokio::sync::Notify;

    const ROUTE_TABLE: &str = "default via 192.168.1.1 dev eth0 proto dhcp\n";

    /// Holds the gateway lookup until released, so start can be caught midway
    struct GatedRunner {
        inner: RecordingRunner,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl CommandRunner for GatedRunner {
        async fn output(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
            if program == "ip" && args.starts_with(&["route", "show"]) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.output(program, args).await
        }
    }

    fn test_portal(runner: Arc<dyn CommandRunner>) -> Arc<Portal> {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let settings = PortalSettings {
            status_bind: "127.0.0.1:0".parse().unwrap(),
            bypass_hosts: vec!["stun.example.net".to_string()],
            ..Default::default()
        };
        Arc::new(
            Portal::new(
                settings,
                Arc::new(MemoryAnchorConnector::new(anchor)),
                Arc::new(MemoryDeviceFactory::new(Arc::new(MemoryInterface::new(
                    "veilnet", 1500,
                )))),
            )
            .with_command_runner(runner)
            .with_resolver(Arc::new(
                StaticResolver::new()
                    .with_host("stun.example.net", &[Ipv4Addr::new(203, 0, 113, 7)])
                    .with_host("guardian.example.net", &[Ipv4Addr::new(203, 0, 113, 8)]),
            )),
        )
    }

    fn params() -> StartParams {
        StartParams {
            anchor: AnchorParams {
                endpoint: "https://guardian.example.net".to_string(),
                token: "token".to_string(),
                name: "edge-1".to_string(),
                domain: "corp.veilnet".to_string(),
                region: "eu-west".to_string(),
            },
            host_interface: "eth0".to_string(),
            public: true,
        }
    }

    #[tokio::test]
    async fn test_fatal_signal_ends_wait() {
        let fatal = CancellationToken::new();
        fatal.cancel();

        let reason = wait_for_shutdown(fatal).await.unwrap();
        assert_eq!(reason, ShutdownReason::Fatal);
    }

    #[tokio::test]
    async fn test_stop_with_timeout_tears_down() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ip route show default", CommandOutput::ok(ROUTE_TABLE));
        let portal = test_portal(runner);

        portal.start(&params()).await.unwrap();
        assert_eq!(portal.state(), PortalState::Running);

        assert!(stop_with_timeout(&portal, Duration::from_secs(5)).await);
        assert_eq!(portal.state(), PortalState::Stopped);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("ip route show default", CommandOutput::ok(""));
        let portal = test_portal(runner);

        let err = supervise(&portal, params(), std::future::pending::<Result<ShutdownReason>>())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to start portal"));

        assert!(stop_with_timeout(&portal, Duration::from_secs(5)).await);
        assert_eq!(portal.state(), PortalState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_during_startup_unwinds_everything() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let inner = RecordingRunner::new();
        inner.respond("ip route show default", CommandOutput::ok(ROUTE_TABLE));
        let runner = Arc::new(GatedRunner {
            inner,
            entered: entered.clone(),
            release: release.clone(),
        });
        let portal = test_portal(runner.clone());

        let signal = {
            let entered = entered.clone();
            async move {
                entered.notified().await;
                Ok(ShutdownReason::Signal)
            }
        };
        let reason = supervise(&portal, params(), signal).await.unwrap();
        assert_eq!(reason, ShutdownReason::Signal);
        assert_eq!(portal.state(), PortalState::Starting);

        let stopping = {
            let portal = portal.clone();
            tokio::spawn(async move { stop_with_timeout(&portal, Duration::from_secs(5)).await })
        };
        release.notify_one();

        assert!(stopping.await.unwrap());
        assert_eq!(portal.state(), PortalState::Stopped);
        assert!(!runner.inner.calls_matching("iptables -A").is_empty());
        assert_eq!(
            runner.inner.calls_matching("iptables -D").len(),
            runner.inner.calls_matching("iptables -A").len()
        );
        assert!(!runner.inner.calls_matching("iptables -t nat -D").is_empty());
    }
}
