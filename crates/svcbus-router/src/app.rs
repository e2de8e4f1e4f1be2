//! Router application: one server connection backed by the service registry

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use svcbus_core::{AdmissionDefault, AppContext, SvcbusConfig, TracingSink, WaitTimeout};
use svcbus_runtime::{ConnectionState, RouterServiceRegistry, ServerOptions, ServiceServerConnection};

use crate::cli::Cli;
use crate::error::{Result, RouterError};

/// Owner thread of the router
pub const ROUTER_THREAD: &str = "svcbus-router";

pub struct RouterApp {
    context: Arc<AppContext>,
    services: Arc<RouterServiceRegistry>,
    server: ServiceServerConnection,
}

impl RouterApp {
    /// Spawn the server owner thread; nothing listens until `start`
    pub fn new(config: SvcbusConfig) -> Result<Self> {
        config.validate()?;
        let context = AppContext::init(config, Arc::new(TracingSink::default()));
        let services = Arc::new(RouterServiceRegistry::new());

        let ready = WaitTimeout::After(context.config().connection.thread_ready_timeout());
        let options = ServerOptions::new(services.clone(), context.log_scope(ROUTER_THREAD))
            .with_ready_timeout(ready);
        let server = ServiceServerConnection::spawn(
            ROUTER_THREAD,
            &context.config().router,
            options,
            context.registry(),
        )?;

        Ok(Self {
            context,
            services,
            server,
        })
    }

    /// Open the listener and wait until it accepts peers
    pub fn start(&self) -> Result<SocketAddr> {
        let timeout_ms = self.context.config().connection.thread_ready_timeout_ms;
        self.server.start_service();
        if !self
            .server
            .wait_state(ConnectionState::Started, WaitTimeout::from_millis(timeout_ms))
        {
            return Err(RouterError::StartTimeout(timeout_ms));
        }

        let address = self
            .server
            .local_addr()
            .context("listener reported started without an address")?;
        info!(%address, "Router started");
        Ok(address)
    }

    pub fn server(&self) -> &ServiceServerConnection {
        &self.server
    }

    pub fn services(&self) -> &Arc<RouterServiceRegistry> {
        &self.services
    }

    pub fn shutdown(&self) {
        if !self.server.exit_service() {
            warn!("Router owner thread did not exit in time");
        }
        self.context.shutdown();
        info!(
            sent = self.server.bytes_sent(),
            received = self.server.bytes_received(),
            "Router stopped"
        );
    }
}

/// Configuration file named on the command line (defaults otherwise) with
/// the listener flags applied on top
pub fn router_config(cli: &Cli) -> Result<SvcbusConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path, "Loading router configuration");
            SvcbusConfig::load_from_file(path)?
        }
        None => SvcbusConfig::default(),
    };

    let router = &mut config.router;
    if let Some(host) = &cli.host {
        router.listen_host = host.clone();
    }
    if let Some(port) = cli.port {
        router.listen_port = port;
    }
    if let Some(first_cookie) = cli.first_cookie {
        router.first_cookie = first_cookie;
    }
    if cli.reject_by_default {
        router.admission.default = AdmissionDefault::Reject;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from(["svcbus-router", "--host", "127.0.0.1", "--port", "0"]);
        let config = router_config(&cli).unwrap();
        assert_eq!(config.router.listen_address(), "127.0.0.1:0");
        assert_eq!(config.router.admission.default, AdmissionDefault::Accept);
    }

    #[test]
    fn test_flags_override_config_file() {
        let path = std::env::temp_dir().join(format!("svcbus-router-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[router]\nlisten_host = \"127.0.0.1\"\nlisten_port = 9100\nfirst_cookie = 500\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "svcbus-router",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9200",
            "--reject-by-default",
        ]);
        let config = router_config(&cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.router.listen_address(), "127.0.0.1:9200");
        assert_eq!(config.router.first_cookie, 500);
        assert_eq!(config.router.admission.default, AdmissionDefault::Reject);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["svcbus-router", "--config", "/nonexistent/svcbus.toml"]);
        assert!(router_config(&cli).is_err());
    }

    #[test]
    fn test_start_and_shutdown() {
        let app = RouterApp::new(SvcbusConfig::testing()).unwrap();
        let address = app.start().unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(app.server().peer_count(), 0);
        assert!(app.services().services().is_empty());

        app.shutdown();
        assert_eq!(app.server().state(), ConnectionState::Stopped);
    }
}
