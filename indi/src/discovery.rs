//! INDI server discovery
//!
//! Finds servers on the local host or advertised over mDNS and lists the
//! devices they expose, classified by role.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::client::IndiClient;
use crate::config::IndiClientConfig;
use crate::store::DeviceRole;
use crate::IndiServer;

/// mDNS service type INDI servers advertise
pub const INDI_MDNS_SERVICE: &str = "_indi._tcp.local.";

/// How long a probe waits for definitions after connecting
pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_millis(1500);

const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// A reachable server and the devices it reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredServer {
    pub server: IndiServer,
    pub devices: Vec<DiscoveredDevice>,
}

/// Device seen while probing a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub roles: Vec<DeviceRole>,
    pub properties: Vec<String>,
}

impl DiscoveredDevice {
    pub fn primary_role(&self) -> Option<DeviceRole> {
        self.roles.first().copied()
    }
}

/// Probe the default port on this machine
pub async fn discover_localhost() -> Option<DiscoveredServer> {
    probe_server(&IndiServer::with_default_port("127.0.0.1"), DEFAULT_SETTLE_TIME).await
}

/// Connect to a server, wait `settle` for definitions, and report its devices.
///
/// Returns `None` if nothing is listening or the connection fails.
pub async fn probe_server(server: &IndiServer, settle: Duration) -> Option<DiscoveredServer> {
    if !port_open(server).await {
        tracing::debug!("No INDI server listening at {}", server);
        return None;
    }

    let config = IndiClientConfig {
        connection_timeout_secs: 5,
        ..Default::default()
    };
    let client = IndiClient::with_config(server.clone(), config);
    if let Err(e) = client.try_connect().await {
        tracing::debug!("INDI probe of {} failed: {}", server, e);
        return None;
    }

    tokio::time::sleep(settle).await;

    let devices = client
        .devices()
        .into_iter()
        .map(|device| DiscoveredDevice {
            name: device.name().to_string(),
            roles: device.roles(),
            properties: device
                .property_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
        .collect::<Vec<_>>();

    client.disconnect().await;
    tracing::info!("INDI server {} reported {} device(s)", server, devices.len());

    Some(DiscoveredServer {
        server: server.clone(),
        devices,
    })
}

/// Browse mDNS for advertised INDI servers and probe each one found
///
/// ```no_run
/// use std::time::Duration;
/// # async fn example() {
/// let servers = astrocontrol_indi::discover_mdns(Duration::from_secs(5)).await;
/// for found in servers {
///     println!("Found INDI server at {}", found.server);
/// }
/// # }
/// ```
pub async fn discover_mdns(timeout: Duration) -> Vec<DiscoveredServer> {
    let mut discovered = Vec::new();

    let mdns = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("Failed to create mDNS daemon: {}. mDNS discovery unavailable.", e);
            return discovered;
        }
    };

    let receiver = match mdns.browse(INDI_MDNS_SERVICE) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Failed to browse mDNS services: {}. mDNS discovery unavailable.", e);
            return discovered;
        }
    };

    tracing::info!("Searching for INDI servers via mDNS for {:?}...", timeout);

    let start = Instant::now();
    let mut seen = HashSet::new();

    while let Some(remaining) = timeout.checked_sub(start.elapsed()) {
        let next = tokio::task::spawn_blocking({
            let receiver = receiver.clone();
            move || receiver.recv_timeout(remaining)
        })
        .await;

        let event = match next {
            Ok(Ok(event)) => event,
            // Search window elapsed
            Ok(Err(_)) => break,
            Err(e) => {
                tracing::warn!("mDNS task error: {}", e);
                break;
            }
        };

        match event {
            ServiceEvent::ServiceResolved(info) => {
                let port = info.get_port();
                let Some(addr) = info.get_addresses().iter().next() else {
                    continue;
                };
                let server = IndiServer::new(addr.to_string(), port);
                if !seen.insert(server.clone()) {
                    continue;
                }

                tracing::info!("Found INDI server via mDNS: {} ({})", info.get_fullname(), server);
                match probe_server(&server, DEFAULT_SETTLE_TIME).await {
                    Some(found) => discovered.push(found),
                    // Advertised but not answering; still worth listing
                    None => discovered.push(DiscoveredServer {
                        server,
                        devices: Vec::new(),
                    }),
                }
            }
            ServiceEvent::ServiceFound(ty, fullname) => {
                tracing::debug!("mDNS service found: {} ({})", fullname, ty);
            }
            _ => {}
        }
    }

    if let Err(e) = mdns.shutdown() {
        tracing::warn!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("mDNS discovery complete. Found {} INDI server(s).", discovered.len());
    discovered
}

async fn port_open(server: &IndiServer) -> bool {
    matches!(
        tokio::time::timeout(PORT_CHECK_TIMEOUT, TcpStream::connect(server.address())).await,
        Ok(Ok(_))
    )
}
