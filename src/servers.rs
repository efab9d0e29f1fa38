//! Server catalogue types.
//!
//! The catalogue itself is maintained and refreshed by the surrounding
//! daemon; the tunnel engine only consumes it when probing candidate
//! connection parameters. Shapes mirror the directory service JSON.

use serde::{Deserialize, Serialize};

/// One physical endpoint within a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    /// Routable public IP, as text.
    pub host: String,
    /// WireGuard public key, base64.
    pub public_key: String,
}

/// A logical server (gateway identity) with one or more hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Gateway identifier, e.g. `at-vie.wg.veilport.net`.
    pub gateway: String,
    pub country: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub hosts: Vec<HostInfo>,
}

impl ServerInfo {
    pub fn has_host(&self, hostname: &str) -> bool {
        self.hosts.iter().any(|h| h.hostname == hostname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortType {
    Udp,
    Tcp,
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortType::Udp => write!(f, "UDP"),
            PortType::Tcp => write!(f, "TCP"),
        }
    }
}

/// Inclusive range of allowed custom ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// A catalogue port entry: either a concrete port or an allowed range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default)]
    pub range: Option<PortRange>,
}

impl PortInfo {
    pub fn udp(port: u16) -> Self {
        PortInfo {
            port,
            port_type: PortType::Udp,
            range: None,
        }
    }

    pub fn tcp(port: u16) -> Self {
        PortInfo {
            port,
            port_type: PortType::Tcp,
            range: None,
        }
    }
}

/// A concrete (port, protocol) pair; key of the port-reachability results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortData {
    pub port: u16,
    pub protocol: PortType,
}

/// Port configuration section of the catalogue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default)]
    pub wireguard: Vec<PortInfo>,
    #[serde(default)]
    pub openvpn: Vec<PortInfo>,
}

/// The server directory as consumed by the tunnel engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersCatalogue {
    #[serde(default)]
    pub wireguard_servers: Vec<ServerInfo>,
    #[serde(default)]
    pub ports: PortsConfig,
}

impl ServersCatalogue {
    /// Server owning the given host name, if any.
    pub fn server_by_hostname(&self, hostname: &str) -> Option<&ServerInfo> {
        self.wireguard_servers.iter().find(|s| s.has_host(hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_deserializes() {
        let json = r#"{
            "wireguard_servers": [{
                "gateway": "at-vie.wg.veilport.net",
                "country": "Austria",
                "city": "Vienna",
                "latitude": 48.21,
                "longitude": 16.37,
                "hosts": [{
                    "hostname": "at-vie1.veilport.net",
                    "host": "203.0.113.7",
                    "public_key": "aaaa"
                }]
            }],
            "ports": {
                "wireguard": [
                    {"port": 51820, "type": "UDP"},
                    {"type": "UDP", "range": {"min": 5500, "max": 19999}}
                ],
                "openvpn": [{"port": 443, "type": "TCP"}]
            }
        }"#;

        let cat: ServersCatalogue = serde_json::from_str(json).unwrap();
        assert_eq!(cat.wireguard_servers.len(), 1);
        assert!(cat.server_by_hostname("at-vie1.veilport.net").is_some());
        assert!(cat.server_by_hostname("unknown").is_none());
        assert_eq!(cat.ports.wireguard[1].range.unwrap().min, 5500);
        assert_eq!(cat.ports.openvpn[0].port_type, PortType::Tcp);
    }
}
