//! Connectivity tester.
//!
//! When the configured connection parameters stop working (typically a
//! blocked port or protocol), the tester walks candidate
//! (server, host, port) combinations through a throw-away WireGuard device
//! and reports the first one whose handshake completes.
//!
//! Candidate order matters: servers sorted by great-circle distance to the
//! user's currently selected server, the currently selected port first.
//! Only the nearest server is probed by default: a handshake failure there
//! most likely means a port or protocol block, so changing ports is more
//! promising than changing servers. `ProbePolicy` can widen the walk.

mod ports;
mod wg;

pub use ports::GeoLookupFn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::geo;
use crate::platform::Shim;
use crate::servers::{HostInfo, PortInfo, PortType, ServerInfo, ServersCatalogue};
use crate::vpn::{VpnError, VpnResult};

/// Hard per-candidate handshake budget. A reachable server answers well
/// within this; waiting longer only slows the walk down.
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Progress event published before each probe.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub server: ServerInfo,
    pub host: HostInfo,
    pub port: PortInfo,
}

/// A working candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct GoodConnectionInfo {
    pub gateway: String,
    pub host_name: String,
    pub port: u16,
    pub port_type: PortType,
}

/// What the user is currently connected to (or trying to connect to).
#[derive(Debug, Clone)]
pub struct CurrentSelection {
    pub hostname: String,
    pub port: u16,
}

/// Width of the candidate walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbePolicy {
    /// Probe every server instead of only the nearest one.
    pub try_all_servers: bool,
}

pub struct ConnectivityTester {
    shim: Shim,
    servers: ServersCatalogue,
    current: Option<CurrentSelection>,
    private_key: String,
    local_ip: std::net::Ipv4Addr,
    policy: ProbePolicy,
    stop: Arc<AtomicBool>,
}

impl ConnectivityTester {
    pub fn new(
        shim: Shim,
        servers: ServersCatalogue,
        private_key: &str,
        local_ip: std::net::Ipv4Addr,
    ) -> Self {
        ConnectivityTester {
            shim,
            servers,
            current: None,
            private_key: private_key.to_string(),
            local_ip,
            policy: ProbePolicy::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_current(mut self, current: CurrentSelection) -> Self {
        self.current = Some(current);
        self
    }

    pub fn with_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cooperatively halt a running walk.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Walk the candidates and return the first one that completes a
    /// handshake. Publishes a [`StatusEvent`] before every probe; events
    /// are dropped rather than blocking when the channel is full.
    pub fn test(&self, status_tx: &Sender<StatusEvent>) -> VpnResult<GoodConnectionInfo> {
        if self.servers.wireguard_servers.is_empty() {
            return Err(VpnError::Config("server catalogue is empty".to_string()));
        }
        self.stop.store(false, Ordering::SeqCst);

        let tunnel = wg::TestTunnel::init(&self.shim, &self.private_key, self.local_ip, &self.stop)?;

        let servers = self.sort_servers_by_distance();
        let ports = self.sorted_ports();

        for server in &servers {
            for host in &server.hosts {
                for port in &ports {
                    if port.port == 0 {
                        continue;
                    }
                    if self.stop.load(Ordering::SeqCst) {
                        return Err(VpnError::Cancelled);
                    }

                    let _ = status_tx.try_send(StatusEvent {
                        server: server.clone(),
                        host: host.clone(),
                        port: port.clone(),
                    });

                    match tunnel.probe(host, port.port, PROBE_TIMEOUT, &self.stop) {
                        Ok(()) => {
                            return Ok(GoodConnectionInfo {
                                gateway: server.gateway.clone(),
                                host_name: host.hostname.clone(),
                                port: port.port,
                                port_type: port.port_type,
                            });
                        }
                        Err(VpnError::Cancelled) => return Err(VpnError::Cancelled),
                        Err(e) => {
                            log::debug!(
                                "probe {}:{} failed: {}",
                                host.hostname,
                                port.port,
                                e
                            );
                        }
                    }
                }
            }

            // A handshake failure at the nearest server most likely means a
            // port/protocol block, not an outage; trying further servers is
            // rarely productive.
            if !self.policy.try_all_servers {
                break;
            }
        }

        Err(VpnError::Timeout(
            "no good connection parameters found".to_string(),
        ))
    }

    /// Servers ordered by distance to the currently selected one;
    /// catalogue order when the selection is unknown.
    fn sort_servers_by_distance(&self) -> Vec<ServerInfo> {
        let mut servers = self.servers.wireguard_servers.clone();

        let Some(base) = self
            .current
            .as_ref()
            .and_then(|c| self.servers.server_by_hostname(&c.hostname))
        else {
            return servers;
        };

        let (lat, lon) = (base.latitude, base.longitude);
        servers.sort_by(|a, b| {
            let da = geo::distance_km(lat, lon, a.latitude, a.longitude);
            let db = geo::distance_km(lat, lon, b.latitude, b.longitude);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        servers
    }

    /// Catalogue ports with the currently selected port promoted to the
    /// front. Entries without a concrete port (ranges) are skipped.
    fn sorted_ports(&self) -> Vec<PortInfo> {
        let mut out = Vec::new();
        if let Some(current) = &self.current {
            if current.port != 0 {
                out.push(PortInfo::udp(current.port));
            }
        }
        for port in &self.servers.ports.wireguard {
            if port.port != 0 && !out.iter().any(|p| p.port == port.port) {
                out.push(port.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{mock_shim, MockPlatform, RecordingRunner};
    use crate::platform::ExecOutput;
    use crate::servers::PortsConfig;
    use crate::vpn::lifecycle::SESSION_TEST_LOCK;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn host(name: &str, ip: &str) -> HostInfo {
        HostInfo {
            hostname: name.to_string(),
            host: ip.to_string(),
            public_key: STANDARD.encode([9u8; 32]),
        }
    }

    fn server(gateway: &str, city: &str, lat: f64, lon: f64, hosts: Vec<HostInfo>) -> ServerInfo {
        ServerInfo {
            gateway: gateway.to_string(),
            country: "X".to_string(),
            city: city.to_string(),
            latitude: lat,
            longitude: lon,
            hosts,
        }
    }

    fn catalogue() -> ServersCatalogue {
        ServersCatalogue {
            wireguard_servers: vec![
                server(
                    "fr-par.wg",
                    "Paris",
                    48.8566,
                    2.3522,
                    vec![host("fr-par1", "203.0.113.31")],
                ),
                server(
                    "at-vie.wg",
                    "Vienna",
                    48.2082,
                    16.3738,
                    vec![host("at-vie1", "203.0.113.11")],
                ),
                server(
                    "sk-bts.wg",
                    "Bratislava",
                    48.1486,
                    17.1077,
                    vec![host("sk-bts1", "203.0.113.21")],
                ),
            ],
            ports: PortsConfig {
                wireguard: vec![
                    PortInfo::udp(51820),
                    PortInfo::udp(2049),
                    // Range entry: no concrete port, must be skipped.
                    PortInfo {
                        port: 0,
                        port_type: PortType::Udp,
                        range: Some(crate::servers::PortRange { min: 5500, max: 19999 }),
                    },
                ],
                openvpn: Vec::new(),
            },
        }
    }

    fn tester(shim: &Shim) -> ConnectivityTester {
        let key = STANDARD.encode([3u8; 32]);
        ConnectivityTester::new(
            shim.clone(),
            catalogue(),
            &key,
            "10.8.0.3".parse().unwrap(),
        )
        .with_current(CurrentSelection {
            hostname: "at-vie1".to_string(),
            port: 51820,
        })
    }

    fn probing_shim() -> (Shim, Arc<RecordingRunner>, Arc<MockPlatform>) {
        let (shim, runner, platform) = mock_shim();
        runner.set_spawn_stdout(vec!["UAPI listener started".to_string()]);
        (shim, runner, platform)
    }

    #[test]
    fn servers_sorted_by_distance_to_current() {
        let (shim, _, _) = mock_shim();
        let sorted = tester(&shim).sort_servers_by_distance();
        let cities: Vec<&str> = sorted.iter().map(|s| s.city.as_str()).collect();
        assert_eq!(cities, vec!["Vienna", "Bratislava", "Paris"]);
    }

    #[test]
    fn unknown_selection_keeps_catalogue_order() {
        let (shim, _, _) = mock_shim();
        let t = tester(&shim).with_current(CurrentSelection {
            hostname: "nowhere".to_string(),
            port: 51820,
        });
        let cities: Vec<String> = t
            .sort_servers_by_distance()
            .into_iter()
            .map(|s| s.city)
            .collect();
        assert_eq!(cities, vec!["Paris", "Vienna", "Bratislava"]);
    }

    #[test]
    fn current_port_probed_first_ranges_skipped() {
        let (shim, _, _) = mock_shim();
        let t = tester(&shim).with_current(CurrentSelection {
            hostname: "at-vie1".to_string(),
            port: 2049,
        });
        let ports: Vec<u16> = t.sorted_ports().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![2049, 51820]);
    }

    #[test]
    fn success_on_second_port_emits_two_events() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (shim, runner, _) = probing_shim();

        // The device is configured once for the dummy remote and once per
        // probe; let the handshake appear only after the second probe's
        // peer push (third setconf overall).
        runner.set_responder(|history, call| {
            if !call.contains("latest-handshakes") {
                return None;
            }
            let pushes = history.iter().filter(|c| c.contains("setconf")).count();
            let stdout = if pushes >= 3 { "pk\t1712000000\n" } else { "pk\t0\n" };
            Some(ExecOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        });

        let t = tester(&shim);
        let (tx, rx) = crossbeam_channel::bounded(16);
        let good = t.test(&tx).unwrap();
        drop(tx);

        assert_eq!(
            good,
            GoodConnectionInfo {
                gateway: "at-vie.wg".to_string(),
                host_name: "at-vie1".to_string(),
                port: 2049,
                port_type: PortType::Udp,
            }
        );

        let events: Vec<StatusEvent> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].port.port, 51820);
        assert_eq!(events[1].port.port, 2049);
        assert!(events.iter().all(|e| e.host.hostname == "at-vie1"));

        // The test device is gone and nothing OS-wide was touched.
        assert!(runner.spawned_children()[0].is_exited());
        assert!(runner.calls_matching("route -n add").is_empty());
        assert!(runner.calls_matching("-up_set_dns").is_empty());
    }

    #[test]
    fn only_nearest_server_is_probed() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (shim, runner, _) = probing_shim();
        runner.respond_stdout("latest-handshakes", "pk\t0\n");

        let t = tester(&shim);
        let (tx, rx) = crossbeam_channel::bounded(64);
        let err = t.test(&tx).unwrap_err();
        drop(tx);
        assert!(matches!(err, VpnError::Timeout(_)));

        let events: Vec<StatusEvent> = rx.iter().collect();
        // Two usable ports on the single nearest server's single host.
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.server.city == "Vienna"));
    }

    #[test]
    fn stop_between_probes_cancels() {
        let _serial = SESSION_TEST_LOCK.lock();
        let (shim, runner, _) = probing_shim();
        runner.respond_stdout("latest-handshakes", "pk\t0\n");

        let t = Arc::new(tester(&shim));
        let (tx, _rx) = crossbeam_channel::bounded(16);

        let t2 = Arc::clone(&t);
        let handle = std::thread::spawn(move || t2.test(&tx));
        std::thread::sleep(Duration::from_millis(80));
        t.stop();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Cancelled));
        assert!(runner.spawned_children()[0].is_exited());
    }

    #[test]
    fn empty_catalogue_is_config_error() {
        let (shim, _, _) = mock_shim();
        let key = STANDARD.encode([3u8; 32]);
        let t = ConnectivityTester::new(
            shim,
            ServersCatalogue::default(),
            &key,
            "10.8.0.3".parse().unwrap(),
        );
        let (tx, _rx) = crossbeam_channel::bounded(1);
        assert!(matches!(t.test(&tx), Err(VpnError::Config(_))));
    }
}
