//! Port-reachability probing.
//!
//! Complements the handshake walk in the parent module with a cheaper
//! question: which of the configured ports can this network reach at all?
//! TCP ports are answered with plain connect attempts against one host of
//! the selected server, up to ten probes in flight at a time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::servers::{HostInfo, PortData, PortInfo, PortType, ServerInfo};
use crate::vpn::{VpnError, VpnResult};

use super::ConnectivityTester;

const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const MAX_CONCURRENT_PROBES: usize = 10;

/// Client geolocation provider: given a timeout in milliseconds, returns
/// the client's (latitude, longitude) when known.
pub type GeoLookupFn = dyn Fn(u64) -> Option<(f64, f64)> + Send + Sync;

impl ConnectivityTester {
    /// Probe reachability of the configured ports (plus validated custom
    /// ones). A port maps to `true` when any probe against it succeeded.
    ///
    /// TODO: when `geolookup` reports the client position, probe the server
    /// nearest to the client but in another country instead of the
    /// selected/random one.
    pub fn test_ports(
        &self,
        custom_ports: &[PortData],
        _geolookup: Option<&GeoLookupFn>,
    ) -> VpnResult<HashMap<PortData, bool>> {
        if self.servers.wireguard_servers.is_empty() {
            return Err(VpnError::Config("server catalogue is empty".to_string()));
        }

        let server = self.probe_server();
        let Some(host) = random_host(server) else {
            return Err(VpnError::Config(format!(
                "server {} has no hosts",
                server.gateway
            )));
        };

        let results: Arc<Mutex<HashMap<PortData, bool>>> = Arc::new(Mutex::new(HashMap::new()));

        let tcp_ports: Vec<PortData> = applicable_ports(&self.servers.ports.openvpn, custom_ports)
            .into_iter()
            .filter(|p| p.protocol == PortType::Tcp)
            .collect();
        self.test_tcp_ports(host, &tcp_ports, &results)?;

        // TODO: probe the WireGuard UDP ports with handshake attempts
        // through the test device.

        let map = results.lock().clone();
        log::info!("ports test result: {:?}", map);
        Ok(map)
    }

    fn test_tcp_ports(
        &self,
        host: &HostInfo,
        ports: &[PortData],
        results: &Arc<Mutex<HashMap<PortData, bool>>>,
    ) -> VpnResult<()> {
        if ports.is_empty() {
            return Ok(());
        }

        log::info!(
            "testing TCP ports (destination: {} [{}])",
            host.hostname,
            host.host
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| VpnError::Resource(format!("failed to start probe runtime: {}", e)))?;

        let host_ip = host.host.clone();
        runtime.block_on(async {
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
            let mut tasks = Vec::new();

            for port in ports.iter().copied() {
                let Ok(addr) = format!("{}:{}", host_ip, port.port).parse::<SocketAddr>() else {
                    merge_result(results, port, false);
                    continue;
                };

                let semaphore = Arc::clone(&semaphore);
                let results = Arc::clone(results);
                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let ok = matches!(
                        timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
                        Ok(Ok(_))
                    );
                    merge_result(&results, port, ok);
                }));
            }

            for task in tasks {
                let _ = task.await;
            }
        });
        Ok(())
    }

    /// Server to probe against: the currently selected one, or a random
    /// one when nothing is selected.
    fn probe_server(&self) -> &ServerInfo {
        if let Some(server) = self
            .current
            .as_ref()
            .and_then(|c| self.servers.server_by_hostname(&c.hostname))
        {
            return server;
        }
        let servers = &self.servers.wireguard_servers;
        &servers[rand::thread_rng().gen_range(0..servers.len())]
    }
}

fn random_host(server: &ServerInfo) -> Option<&HostInfo> {
    if server.hosts.is_empty() {
        return None;
    }
    Some(&server.hosts[rand::thread_rng().gen_range(0..server.hosts.len())])
}

/// Record a probe result; an already-reachable port stays reachable.
fn merge_result(results: &Mutex<HashMap<PortData, bool>>, port: PortData, ok: bool) {
    let mut map = results.lock();
    if map.get(&port).copied().unwrap_or(false) {
        return;
    }
    map.insert(port, ok);
}

/// Concrete catalogue ports plus those custom ports that fall into an
/// allowed range of the matching protocol.
fn applicable_ports(catalogue: &[PortInfo], custom: &[PortData]) -> Vec<PortData> {
    let mut out: Vec<PortData> = catalogue
        .iter()
        .filter(|p| p.port > 0)
        .map(|p| PortData {
            port: p.port,
            protocol: p.port_type,
        })
        .collect();

    let ranges: Vec<&PortInfo> = catalogue.iter().filter(|p| p.range.is_some()).collect();
    for cp in custom {
        let allowed = ranges.iter().any(|r| {
            r.port_type == cp.protocol
                && r.range
                    .map(|range| cp.port >= range.min && cp.port <= range.max)
                    .unwrap_or(false)
        });
        if allowed && !out.contains(cp) {
            out.push(*cp);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntest::CurrentSelection;
    use crate::platform::mock::mock_shim;
    use crate::servers::{PortRange, PortsConfig, ServersCatalogue};
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn catalogue_ports() -> Vec<PortInfo> {
        vec![
            PortInfo::tcp(443),
            PortInfo::udp(53),
            PortInfo {
                port: 0,
                port_type: PortType::Tcp,
                range: Some(PortRange { min: 20000, max: 29999 }),
            },
        ]
    }

    #[test]
    fn custom_ports_validated_against_ranges() {
        let custom = [
            PortData { port: 25000, protocol: PortType::Tcp },
            PortData { port: 30001, protocol: PortType::Tcp },
            PortData { port: 25000, protocol: PortType::Udp },
        ];
        let ports = applicable_ports(&catalogue_ports(), &custom);
        assert!(ports.contains(&PortData { port: 443, protocol: PortType::Tcp }));
        assert!(ports.contains(&PortData { port: 25000, protocol: PortType::Tcp }));
        assert!(!ports.contains(&PortData { port: 30001, protocol: PortType::Tcp }));
        assert!(!ports.contains(&PortData { port: 25000, protocol: PortType::Udp }));
    }

    #[test]
    fn reachable_result_is_sticky() {
        let results = Mutex::new(HashMap::new());
        let port = PortData { port: 443, protocol: PortType::Tcp };
        merge_result(&results, port, true);
        merge_result(&results, port, false);
        assert_eq!(results.lock().get(&port), Some(&true));
    }

    #[test]
    fn probes_real_loopback_listener() {
        // One listening port, one freshly freed (closed) port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap().port()
        };

        let (shim, _, _) = mock_shim();
        let catalogue = ServersCatalogue {
            wireguard_servers: vec![ServerInfo {
                gateway: "lo.wg".to_string(),
                country: "L".to_string(),
                city: "Loopback".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                hosts: vec![HostInfo {
                    hostname: "lo1".to_string(),
                    host: "127.0.0.1".to_string(),
                    public_key: STANDARD.encode([9u8; 32]),
                }],
            }],
            ports: PortsConfig {
                wireguard: Vec::new(),
                openvpn: vec![PortInfo::tcp(open_port), PortInfo::tcp(closed_port)],
            },
        };

        let key = STANDARD.encode([3u8; 32]);
        let tester = ConnectivityTester::new(shim, catalogue, &key, "10.8.0.3".parse().unwrap())
            .with_current(CurrentSelection {
                hostname: "lo1".to_string(),
                port: 51820,
            });

        let map = tester.test_ports(&[], None).unwrap();
        assert_eq!(
            map.get(&PortData { port: open_port, protocol: PortType::Tcp }),
            Some(&true)
        );
        assert_eq!(
            map.get(&PortData { port: closed_port, protocol: PortType::Tcp }),
            Some(&false)
        );
    }
}
