use std::net::ToSocketAddrs;

use log::{debug, info};

/// The device's link to the outside world.
pub trait NetworkLink {
    /// Start association. Completion is observed through `is_connected`.
    fn begin(&mut self, ssid: &str, password: &str);

    fn is_connected(&mut self) -> bool;

    /// Addresses worth logging once the link is up.
    fn describe(&self) -> String {
        String::new()
    }
}

/// Link managed by the host OS; considered up once the broker resolves.
pub struct HostNetwork {
    probe_host: String,
    probe_port: u16,
    resolved: Vec<String>,
}

impl HostNetwork {
    pub fn new(probe_host: &str, probe_port: u16) -> Self {
        HostNetwork {
            probe_host: probe_host.to_string(),
            probe_port,
            resolved: Vec::new(),
        }
    }
}

impl NetworkLink for HostNetwork {
    fn begin(&mut self, ssid: &str, _password: &str) {
        info!("Association with {} is handled by the host", ssid);
    }

    fn is_connected(&mut self) -> bool {
        match (self.probe_host.as_str(), self.probe_port).to_socket_addrs() {
            Ok(addrs) => {
                self.resolved = addrs.map(|a| a.ip().to_string()).collect();
                !self.resolved.is_empty()
            }
            Err(e) => {
                debug!("Cannot resolve {}: {}", self.probe_host, e);
                self.resolved.clear();
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("{} -> {}", self.probe_host, self.resolved.join(", "))
    }
}
