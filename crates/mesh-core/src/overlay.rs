//! Anonymity-overlay adapter (C9): start/stop of an external overlay
//! controller process and hidden-service bring-up.
//!
//! Anonymity-overlay control is explicitly out of scope as an external
//! collaborator (spec §1) — "a black-box that can create hidden services
//! and tunnel TCP". This module only owns the boundary: a small trait
//! (the same shape as `upnp.rs`'s `UpnpClient` and `reachability.rs`'s
//! `WebProbe`) so the rest of the node never depends on a concrete
//! controller, plus a process-handle implementation that drives an
//! external overlay binary by convention rather than reimplementing its
//! control protocol.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;

use crate::endpoint::Endpoint;
use crate::error::CoreError;
use crate::transport;

/// What the rest of the node needs from the overlay controller: bring it
/// up, tear it down, and mint a hidden service for a local port. The SOCKS5
/// side of the overlay is reached at a fixed address (`socks_addr`) once
/// the controller is running — dialing through it is `transport.rs`'s
/// concern, not this trait's.
#[async_trait::async_trait]
pub trait OverlayController: Send + Sync {
    async fn start(&self) -> Result<(), CoreError>;
    async fn stop(&self);
    /// Map `local_port` to a new hidden service and return its onion-style
    /// domain (no scheme, no trailing port — `Endpoint::Domain` carries the
    /// port separately).
    async fn create_hidden_service(&self, local_port: u16) -> Result<String, CoreError>;
}

/// Drives an external overlay-controller binary as a child process. The
/// only convention assumed about that binary: once a hidden service is
/// ready, it writes the service's onion address as a single line to its
/// stdout. Anything beyond that (the control protocol, SOCKS5 listener
/// setup) is the controller process's own business.
pub struct ProcessOverlayController {
    binary_path: String,
    child: AsyncMutex<Option<Child>>,
}

impl ProcessOverlayController {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            child: AsyncMutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl OverlayController for ProcessOverlayController {
    async fn start(&self) -> Result<(), CoreError> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let child = Command::new(&self.binary_path)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CoreError::Io)?;
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }

    async fn create_hidden_service(&self, local_port: u16) -> Result<String, CoreError> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| CoreError::Unreachable("overlay controller is not running".into()))?;
        let stdout = child
            .stdout
            .as_mut()
            .ok_or_else(|| CoreError::Unreachable("overlay controller has no stdout pipe".into()))?;

        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).await.map_err(CoreError::Io)?;
        let onion = line.trim().to_string();
        if onion.is_empty() {
            return Err(CoreError::Unreachable(format!(
                "overlay controller reported no hidden-service address for port {local_port}"
            )));
        }
        Ok(onion)
    }
}

/// Owns the overlay controller and the node's own hidden-service endpoint
/// once bring-up has run (spec §4.9).
pub struct AnonymityOverlayAdapter {
    controller: Box<dyn OverlayController>,
    local_service_port: u16,
}

impl AnonymityOverlayAdapter {
    pub fn new(local_service_port: u16, controller: Box<dyn OverlayController>) -> Self {
        Self { controller, local_service_port }
    }

    /// `(loopback, localPort + 2)` — outbound connects to `Unspecified`
    /// (overlay domain) endpoints are routed through here.
    pub fn socks_addr(&self) -> std::net::SocketAddr {
        transport::overlay_socks_addr(self.local_service_port)
    }

    /// Starts the controller and maps a hidden service to this node's
    /// service port. The returned endpoint is what the DHT manager should
    /// use as its overlay DHT node's own bind endpoint.
    pub async fn bring_up(&self) -> Result<Endpoint, CoreError> {
        self.controller.start().await?;
        let onion = self.controller.create_hidden_service(self.local_service_port).await?;
        Ok(Endpoint::Domain(onion, self.local_service_port))
    }

    pub async fn tear_down(&self) {
        self.controller.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeController {
        started: AtomicBool,
        onion: String,
    }

    #[async_trait::async_trait]
    impl OverlayController for FakeController {
        async fn start(&self) -> Result<(), CoreError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) {
            self.started.store(false, Ordering::SeqCst);
        }
        async fn create_hidden_service(&self, _local_port: u16) -> Result<String, CoreError> {
            if !self.started.load(Ordering::SeqCst) {
                return Err(CoreError::Unreachable("controller not started".into()));
            }
            Ok(self.onion.clone())
        }
    }

    #[tokio::test]
    async fn bring_up_starts_the_controller_and_returns_a_domain_endpoint() {
        let controller = FakeController { started: AtomicBool::new(false), onion: "abc123def.mesh".to_string() };
        let adapter = AnonymityOverlayAdapter::new(4000, Box::new(controller));

        let endpoint = adapter.bring_up().await.unwrap();
        assert_eq!(endpoint, Endpoint::Domain("abc123def.mesh".to_string(), 4000));
    }

    #[tokio::test]
    async fn socks_addr_is_loopback_at_service_port_plus_two() {
        let controller = FakeController { started: AtomicBool::new(false), onion: String::new() };
        let adapter = AnonymityOverlayAdapter::new(4000, Box::new(controller));
        assert_eq!(adapter.socks_addr(), std::net::SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), 4002));
    }

    #[tokio::test]
    async fn tear_down_stops_the_controller() {
        let controller = FakeController { started: AtomicBool::new(true), onion: String::new() };
        let adapter = AnonymityOverlayAdapter::new(4000, Box::new(controller));
        adapter.tear_down().await;
        let Endpoint::Domain(_, _) = Endpoint::Domain("x".into(), 1) else { unreachable!() };
    }
}
