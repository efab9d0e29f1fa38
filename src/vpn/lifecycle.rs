//! Tunnel lifecycle.
//!
//! Composes the device controller, the route manager and the DNS manager
//! into the connect / pause / resume / disconnect state machine. The
//! `connect` call is synchronous: it returns only when the tunnel is gone
//! again, publishing state transitions on a channel along the way.
//!
//! Pause is modelled as "tear the tunnel down but keep the call alive":
//! `pause` kills the WireGuard process, `connect` unwinds routes and DNS,
//! publishes PAUSED and blocks until `resume` (or `disconnect`) arrives.
//! On resume it returns [`VpnError::ReconnectionRequired`], telling the
//! owning service to run the whole connect sequence again.
//!
//! Every privileged mutation registers its inverse on a cleanup stack
//! before the next step begins; any exit path unwinds in reverse order,
//! and cleanup errors never mask the primary error.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::dns::DnsManager;
use crate::platform::Shim;
use crate::vpn::device::{self, TunnelDevice};
use crate::vpn::params::ConnectionParameters;
use crate::vpn::routes::RouteManager;
use crate::vpn::{CleanupStack, State, StateInfo, VpnError, VpnResult};

/// Delay between connectivity re-checks while waiting for a usable network.
const NO_CONNECTIVITY_RETRY: Duration = Duration::from_secs(5);
/// Granularity of cancellable sleeps.
const POLL_SLICE: Duration = Duration::from_millis(50);
/// Budget for the WireGuard process to report its control socket.
const INIT_READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default budget for the first handshake of a real connection.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Kind of the process-wide tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Real,
    Test,
}

static ACTIVE_SESSION: Mutex<Option<SessionKind>> = Mutex::new(None);

/// Exclusive right to run a tunnel session in this process. Test sessions
/// and real sessions are mutually exclusive.
pub(crate) struct SessionPermit;

impl SessionPermit {
    fn acquire(kind: SessionKind) -> VpnResult<SessionPermit> {
        let mut guard = ACTIVE_SESSION.lock();
        if let Some(active) = *guard {
            return Err(VpnError::Resource(format!(
                "another tunnel session is active ({:?})",
                active
            )));
        }
        *guard = Some(kind);
        Ok(SessionPermit)
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        *ACTIVE_SESSION.lock() = None;
    }
}

pub(crate) fn acquire_test_session() -> VpnResult<SessionPermit> {
    SessionPermit::acquire(SessionKind::Test)
}

/// Unit tests creating sessions must not overlap (the session slot is
/// process-wide); they serialise on this lock.
#[cfg(test)]
pub(crate) static SESSION_TEST_LOCK: Mutex<()> = Mutex::new(());

/// State shared between the connect flow and the control operations.
struct SessionShared {
    going_to_stop: AtomicBool,
    paused: AtomicBool,
    resume_tx: Sender<()>,
    resume_rx: Receiver<()>,
    /// Termination handle of the running WireGuard process, when any.
    device_killer: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    routes: Mutex<RouteManager>,
    handshake_time: Mutex<Option<u64>>,
}

/// One tunnel connection attempt.
pub struct Tunnel {
    shim: Shim,
    dns: Arc<DnsManager>,
    params: ConnectionParameters,
    is_test: bool,
    handshake_timeout: Duration,
    shared: Arc<SessionShared>,
}

impl Tunnel {
    pub fn new(shim: Shim, dns: Arc<DnsManager>, params: ConnectionParameters) -> VpnResult<Self> {
        params.validate()?;
        let (resume_tx, resume_rx) = bounded(1);
        Ok(Tunnel {
            shared: Arc::new(SessionShared {
                going_to_stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                resume_tx,
                resume_rx,
                device_killer: Mutex::new(None),
                routes: Mutex::new(RouteManager::new(shim.clone())),
                handshake_time: Mutex::new(None),
            }),
            shim,
            dns,
            params,
            is_test: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Tag this session as connectivity-test only: no handshake wait, no
    /// routing or DNS side effects.
    pub fn mark_as_test_connection(&mut self) {
        self.is_test = true;
    }

    pub fn set_handshake_timeout(&mut self, timeout: Duration) {
        self.handshake_timeout = timeout;
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Unix timestamp of the first observed handshake, once any.
    pub fn handshake_time(&self) -> Option<u64> {
        *self.shared.handshake_time.lock()
    }

    /// Tunnel-local address of the requested family. Resolver mutations
    /// must target an interface address of the same family.
    pub fn local_ip_for_family(&self, ipv6: bool) -> VpnResult<IpAddr> {
        if ipv6 {
            self.params
                .client_local_ipv6
                .map(IpAddr::V6)
                .ok_or_else(|| {
                    VpnError::Config("the tunnel has no IPv6 address".to_string())
                })
        } else {
            Ok(IpAddr::V4(self.params.client_local_ip))
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn stopping(&self) -> bool {
        self.shared.going_to_stop.load(Ordering::SeqCst)
    }

    /// Establish the tunnel and block until it is torn down again.
    ///
    /// State transitions are published on `state_tx`. A clean disconnect
    /// resolves to `Ok`; a pause/resume cycle resolves to
    /// [`VpnError::ReconnectionRequired`].
    pub fn connect(&self, state_tx: &Sender<StateInfo>) -> VpnResult<()> {
        let kind = if self.is_test {
            SessionKind::Test
        } else {
            SessionKind::Real
        };
        let _permit = SessionPermit::acquire(kind)?;

        // Drop any stale resume token from a previous pause cycle.
        while self.shared.resume_rx.try_recv().is_ok() {}

        let result = match self.connect_inner(state_tx) {
            // A requested stop is a clean shutdown, not a failure.
            Err(VpnError::Cancelled) => Ok(()),
            other => other,
        };

        if self.is_paused() && !self.stopping() {
            // The connection was stopped by pause(): hold the call until the
            // owner resumes (or disconnects), then ask it to reconnect.
            let _ = state_tx.send(StateInfo::new(State::Paused));
            let _ = self.shared.resume_rx.recv();
            if !self.stopping() {
                return Err(VpnError::ReconnectionRequired);
            }
        }

        result
    }

    fn connect_inner(&self, state_tx: &Sender<StateInfo>) -> VpnResult<()> {
        let shared = &self.shared;
        shared.paused.store(false, Ordering::SeqCst);
        *shared.handshake_time.lock() = None;

        // Trying to connect with no connectivity (WiFi off?): wait until a
        // primary interface and a default route exist.
        while !self.stopping() && !self.network_is_ready() {
            log::info!("no connectivity, waiting 5 sec to retry...");
            let _ = state_tx.send(StateInfo::with_message(State::Reconnecting, "No connectivity"));
            self.cancellable_sleep(NO_CONNECTIVITY_RETRY);
        }
        if self.stopping() {
            return Err(VpnError::Cancelled);
        }

        let default_route = shared.routes.lock().capture_default()?;
        log::info!(
            "default route: {} via {}",
            default_route.gateway,
            default_route.interface
        );

        let iface = device::allocate_interface(&self.shim)?;

        let mut cleanup = CleanupStack::new();

        let mut dev = TunnelDevice::start(&self.shim, &iface)?;
        *shared.device_killer.lock() = Some(dev.killer());
        {
            let killer = dev.killer();
            let shared = Arc::clone(shared);
            cleanup.push("stop wireguard process", move || {
                killer();
                *shared.device_killer.lock() = None;
            });
        }

        dev.wait_ready(INIT_READY_TIMEOUT, &shared.going_to_stop)?;

        // The system resolver must learn about an IPv6 nameserver before
        // the interface comes up.
        if let Some(ipv6) = self.params.client_local_ipv6 {
            if let Err(e) = self.dns.init_ipv6_resolver(ipv6, &iface) {
                log::error!("failed to initialize IPv6 DNS resolver: {}", e);
            }
        }

        if self.stopping() {
            return Err(VpnError::Cancelled);
        }
        dev.configure(&self.params)?;

        if !self.is_test {
            let ts = dev.wait_for_first_handshake(
                self.handshake_timeout,
                Some(&shared.going_to_stop),
            )?;
            *shared.handshake_time.lock() = Some(ts);

            if self.stopping() {
                return Err(VpnError::Cancelled);
            }
            {
                let shared = Arc::clone(&self.shared);
                cleanup.push("restore routing table", move || {
                    shared.routes.lock().remove();
                });
            }
            shared.routes.lock().install(&self.params, &default_route)?;

            if self.stopping() {
                return Err(VpnError::Cancelled);
            }
            let dns_settings = self.params.effective_dns();
            let local_ip = self.local_ip_for_family(dns_settings.is_ipv6())?;
            {
                let dns = Arc::clone(&self.dns);
                cleanup.push("restore DNS", move || {
                    if let Err(e) = dns.delete_manual(Some(local_ip)) {
                        log::error!("failed to restore DNS: {}", e);
                    }
                });
            }
            self.dns.set_manual(&dns_settings, Some(local_ip))?;
        }

        log::info!("connected to {}", self.params.endpoint());
        let _ = state_tx.send(StateInfo::with_message(
            State::Connected,
            self.params.endpoint().to_string(),
        ));

        // Block for the whole lifetime of the tunnel: the process exits on
        // disconnect/pause, or unexpectedly on its own failure.
        let code = dev.wait_exit()?;
        if !self.stopping() && !self.is_paused() {
            return Err(VpnError::Os(format!(
                "WireGuard process terminated unexpectedly (status {})",
                code
            )));
        }
        Ok(())
        // `cleanup` unwinds here on every path: DNS, routes, process.
    }

    /// Request a full stop. Idempotent; unblocks a paused connect too.
    pub fn disconnect(&self) -> VpnResult<()> {
        log::info!("stopping");
        self.shared.going_to_stop.store(true, Ordering::SeqCst);
        let _ = self.shared.resume_tx.try_send(());
        self.kill_device();
        Ok(())
    }

    /// Suspend the tunnel, keeping the connect call alive until resume.
    pub fn pause(&self) -> VpnResult<()> {
        if self.is_test {
            return Err(VpnError::Config(
                "a test connection cannot be paused".to_string(),
            ));
        }
        log::info!("pausing");
        self.shared.paused.store(true, Ordering::SeqCst);
        self.kill_device();
        Ok(())
    }

    /// Wake a paused connect call; it returns `ReconnectionRequired`.
    pub fn resume(&self) -> VpnResult<()> {
        self.shared.paused.store(false, Ordering::SeqCst);
        let _ = self.shared.resume_tx.try_send(());
        Ok(())
    }

    /// React to a default-route change; reinstalls the tunnel routes when
    /// the gateway actually moved.
    pub fn on_routing_changed(&self) -> VpnResult<()> {
        if self.stopping() || self.is_test {
            return Ok(());
        }
        let mut routes = self.shared.routes.lock();
        if !routes.is_installed() {
            return Ok(());
        }
        routes.reconcile_on_default_change(&self.params)?;
        Ok(())
    }

    fn kill_device(&self) {
        if let Some(killer) = self.shared.device_killer.lock().clone() {
            killer();
        }
    }

    fn network_is_ready(&self) -> bool {
        self.shim.platform.is_primary_interface_up()
            && self.shim.platform.default_route().is_ok()
    }

    fn cancellable_sleep(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() && !self.stopping() {
            let slice = remaining.min(POLL_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsSettings;
    use crate::platform::mock::{mock_shim, MockPlatform, RecordingRunner};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use crossbeam_channel::unbounded;

    use super::SESSION_TEST_LOCK as SERIAL;

    fn ready_shim() -> (Shim, Arc<RecordingRunner>, Arc<MockPlatform>) {
        let (shim, runner, platform) = mock_shim();
        runner.set_spawn_stdout(vec!["UAPI listener started".to_string()]);
        runner.respond_stdout("latest-handshakes", "pk\t1712000000\n");
        (shim, runner, platform)
    }

    fn test_params() -> ConnectionParameters {
        let key = STANDARD.encode([1u8; 32]);
        let mut params = ConnectionParameters::new(
            "203.0.113.5".parse().unwrap(),
            &key,
            "172.16.0.1".parse().unwrap(),
            51820,
            0,
        )
        .unwrap();
        params.set_credentials(&key, "10.8.0.3".parse().unwrap()).unwrap();
        // Documentation-range resolver: never inside a local test network.
        params.dns = Some(DnsSettings::plain("198.51.100.53".parse().unwrap()));
        params
    }

    fn make_tunnel(shim: &Shim) -> Arc<Tunnel> {
        let dns = Arc::new(DnsManager::with_script(shim.clone()));
        Arc::new(Tunnel::new(shim.clone(), dns, test_params()).unwrap())
    }

    fn spawn_connect(
        tunnel: &Arc<Tunnel>,
    ) -> (Receiver<StateInfo>, std::thread::JoinHandle<VpnResult<()>>) {
        let (tx, rx) = unbounded();
        let tunnel = Arc::clone(tunnel);
        let handle = std::thread::spawn(move || tunnel.connect(&tx));
        (rx, handle)
    }

    fn wait_for_state(rx: &Receiver<StateInfo>, state: State) -> StateInfo {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .expect("state wait timed out");
            let info = rx.recv_timeout(remaining).expect("state channel closed");
            if info.state == state {
                return info;
            }
        }
    }

    fn call_index(runner: &RecordingRunner, needle: &str) -> usize {
        runner
            .calls()
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("no call containing '{}'", needle))
    }

    #[test]
    fn happy_connect_then_disconnect_restores_everything() {
        let _serial = SERIAL.lock();
        let (shim, runner, _) = ready_shim();
        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);

        let connected = wait_for_state(&rx, State::Connected);
        assert_eq!(connected.message.as_deref(), Some("203.0.113.5:51820"));
        assert!(tunnel.handshake_time().is_some());

        // Forward order: process, addresses, peer config, routes, DNS.
        let spawn_idx = call_index(&runner, "spawn /opt/veilport/wireguard/wireguard-go -f utun1");
        let addr_idx = call_index(&runner, "ipconfig set utun1 MANUAL 10.8.0.3");
        let conf_idx = call_index(&runner, "setconf utun1");
        let route_idx = call_index(&runner, "add default 172.16.0.1");
        let dns_idx = call_index(&runner, "-up_set_dns 198.51.100.53");
        assert!(spawn_idx < addr_idx && addr_idx < conf_idx);
        assert!(conf_idx < route_idx && route_idx < dns_idx);

        tunnel.disconnect().unwrap();
        handle.join().unwrap().unwrap();

        // Reverse order on teardown: DNS before routes.
        let down_idx = call_index(&runner, "dns.sh -down");
        let route_del_idx = call_index(&runner, "delete -inet -net 128.0.0.0");
        assert!(dns_idx < down_idx && down_idx < route_del_idx);
        assert!(runner.spawned_children()[0].is_exited());
    }

    #[test]
    fn handshake_timeout_unwinds_without_routes_or_dns() {
        let _serial = SERIAL.lock();
        let (shim, runner, _) = mock_shim();
        runner.set_spawn_stdout(vec!["UAPI listener started".to_string()]);
        runner.respond_stdout("latest-handshakes", "pk\t0\n");

        let dns = Arc::new(DnsManager::with_script(shim.clone()));
        let mut tunnel = Tunnel::new(shim.clone(), dns, test_params()).unwrap();
        tunnel.set_handshake_timeout(Duration::from_millis(100));
        let tunnel = Arc::new(tunnel);

        let (_rx, handle) = spawn_connect(&tunnel);
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Timeout(_)));

        assert!(runner.calls_matching("route -n add").is_empty());
        assert!(runner.calls_matching("-up_set_dns").is_empty());
        assert!(runner.spawned_children()[0].is_exited());
    }

    #[test]
    fn disconnect_while_waiting_for_connectivity() {
        let _serial = SERIAL.lock();
        let (shim, runner, platform) = ready_shim();
        platform.set_primary_interface_up(false);

        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Reconnecting);

        tunnel.disconnect().unwrap();
        handle.join().unwrap().unwrap();

        // Nothing was spawned and nothing was mutated.
        assert!(runner.calls_matching("spawn").is_empty());
        assert!(runner.calls_matching("route -n add").is_empty());
    }

    #[test]
    fn pause_tears_down_and_resume_requests_reconnection() {
        let _serial = SERIAL.lock();
        let (shim, runner, _) = ready_shim();
        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Connected);

        tunnel.pause().unwrap();
        wait_for_state(&rx, State::Paused);
        assert!(tunnel.is_paused());
        assert!(!runner.calls_matching("dns.sh -down").is_empty());
        assert!(!runner.calls_matching("delete -inet -net 128.0.0.0").is_empty());

        tunnel.resume().unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::ReconnectionRequired));
    }

    #[test]
    fn gateway_change_reinstalls_routes_while_connected() {
        let _serial = SERIAL.lock();
        let (shim, runner, platform) = ready_shim();
        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Connected);

        // The installed default now points at the tunnel gateway.
        platform.set_default_gateway("172.16.0.1".parse().unwrap());
        let before = runner.calls().len();
        tunnel.on_routing_changed().unwrap();
        assert_eq!(runner.calls().len(), before, "no gateway change, no mutation");

        platform.set_default_gateway("192.168.7.1".parse().unwrap());
        tunnel.on_routing_changed().unwrap();
        assert!(runner
            .calls()
            .contains(&"/sbin/route -n add default 192.168.7.1 -ifscope en0".to_string()));

        // Still connected: no further state events were published.
        assert!(rx.try_recv().is_err());

        tunnel.disconnect().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_connection_skips_handshake_routes_and_dns() {
        let _serial = SERIAL.lock();
        let (shim, runner, _) = ready_shim();
        let dns = Arc::new(DnsManager::with_script(shim.clone()));
        let mut tunnel = Tunnel::new(shim.clone(), dns, test_params()).unwrap();
        tunnel.mark_as_test_connection();
        let tunnel = Arc::new(tunnel);

        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Connected);

        assert!(runner.calls_matching("latest-handshakes").is_empty());
        assert!(runner.calls_matching("route -n add").is_empty());
        assert!(runner.calls_matching("-up_set_dns").is_empty());
        // The device itself was configured.
        assert_eq!(runner.calls_matching("setconf utun1").len(), 1);

        tunnel.disconnect().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn only_one_session_per_process() {
        let _serial = SERIAL.lock();
        let (shim, _, _) = ready_shim();
        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Connected);

        let (shim2, _, _) = ready_shim();
        let second = make_tunnel(&shim2);
        let (tx2, _rx2) = unbounded();
        assert!(matches!(
            second.connect(&tx2),
            Err(VpnError::Resource(_))
        ));

        tunnel.disconnect().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn unexpected_process_exit_is_reported() {
        let _serial = SERIAL.lock();
        let (shim, runner, _) = ready_shim();
        let tunnel = make_tunnel(&shim);
        let (rx, handle) = spawn_connect(&tunnel);
        wait_for_state(&rx, State::Connected);

        runner.spawned_children()[0].exit(3);
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Os(_)));

        // Cleanup still ran.
        assert!(!runner.calls_matching("dns.sh -down").is_empty());
    }
}
