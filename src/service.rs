//! Service-facing API.
//!
//! Thin facade the rest of the daemon talks to: synchronous `connect`
//! (blocks until the tunnel is gone), disconnect/pause/resume, manual DNS,
//! routing-change notifications and the connectivity test driver. State
//! events flow to the caller over a channel; connectivity-test progress is
//! delivered to an event receiver implemented by the daemon.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::conntest::{ConnectivityTester, CurrentSelection, GoodConnectionInfo, ProbePolicy, StatusEvent};
use crate::dns::{DnsManager, DnsSettings, EncryptionAbilities};
use crate::platform::Shim;
use crate::servers::ServersCatalogue;
use crate::vpn::lifecycle::Tunnel;
use crate::vpn::params::ConnectionParameters;
use crate::vpn::routes::DefaultRouteWatcher;
use crate::vpn::{State, StateInfo, VpnError, VpnResult};

/// How often the default route is re-read while watching for changes.
const ROUTE_WATCH_INTERVAL: Duration = Duration::from_secs(3);
/// Status events beyond this are dropped in favour of liveness.
const STATUS_CHANNEL_CAPACITY: usize = 16;

/// Receiver of connectivity-test progress, implemented by the daemon.
pub trait ConnTestEvents: Send + Sync {
    fn on_connection_test_status(&self, status: &StatusEvent);
    fn on_connection_test_result(&self, result: VpnResult<GoodConnectionInfo>);
}

/// The tunnel engine's front door.
pub struct VpnService {
    shim: Shim,
    dns: Arc<DnsManager>,
    tunnel: Mutex<Option<Arc<Tunnel>>>,
    tester: Arc<Mutex<Option<Arc<ConnectivityTester>>>>,
    route_watcher: Mutex<Option<DefaultRouteWatcher>>,
}

impl VpnService {
    pub fn new(shim: Shim) -> Self {
        let dns = Arc::new(DnsManager::with_script(shim.clone()));
        VpnService {
            shim,
            dns,
            tunnel: Mutex::new(None),
            tester: Arc::new(Mutex::new(None)),
            route_watcher: Mutex::new(None),
        }
    }

    pub fn dns(&self) -> &Arc<DnsManager> {
        &self.dns
    }

    pub fn get_dns_encryption_abilities(&self) -> EncryptionAbilities {
        self.dns.get_encryption_abilities()
    }

    /// Establish a tunnel and block until it is disconnected.
    ///
    /// Returns [`VpnError::ReconnectionRequired`] after a pause/resume
    /// cycle; the caller is expected to call `connect` again.
    pub fn connect(
        &self,
        params: ConnectionParameters,
        state_tx: Sender<StateInfo>,
    ) -> VpnResult<()> {
        {
            let mut slot = self.tunnel.lock();
            if slot.is_some() {
                return Err(VpnError::Resource("connection already in progress".to_string()));
            }
            let _ = state_tx.send(StateInfo::new(State::Connecting));
            let tunnel = Arc::new(Tunnel::new(self.shim.clone(), self.dns.clone(), params)?);
            *slot = Some(tunnel);
        }

        let tunnel = self.tunnel.lock().clone().expect("tunnel slot just filled");
        let result = tunnel.connect(&state_tx);
        *self.tunnel.lock() = None;

        match &result {
            Ok(()) => {
                let _ = state_tx.send(StateInfo::new(State::Disconnected));
            }
            // The owner reconnects immediately; not a disconnect.
            Err(VpnError::ReconnectionRequired) => {}
            Err(e) => {
                let _ = state_tx.send(StateInfo::with_message(State::Disconnected, e.to_string()));
            }
        }
        result
    }

    /// Idempotent: succeeds when no tunnel is up.
    pub fn disconnect(&self) -> VpnResult<()> {
        match self.tunnel.lock().clone() {
            Some(tunnel) => tunnel.disconnect(),
            None => Ok(()),
        }
    }

    pub fn pause(&self) -> VpnResult<()> {
        match self.tunnel.lock().clone() {
            Some(tunnel) => tunnel.pause(),
            None => Err(VpnError::Resource("no active connection".to_string())),
        }
    }

    pub fn resume(&self) -> VpnResult<()> {
        match self.tunnel.lock().clone() {
            Some(tunnel) => tunnel.resume(),
            None => Err(VpnError::Resource("no active connection".to_string())),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.tunnel
            .lock()
            .as_ref()
            .map(|t| t.is_paused())
            .unwrap_or(false)
    }

    pub fn set_manual_dns(&self, settings: &DnsSettings) -> VpnResult<()> {
        let iface_ip = match self.tunnel.lock().clone() {
            Some(tunnel) => Some(tunnel.local_ip_for_family(settings.is_ipv6())?),
            None => None,
        };
        self.dns.set_manual(settings, iface_ip)
    }

    pub fn reset_manual_dns(&self) -> VpnResult<()> {
        self.dns.delete_manual(self.tunnel_local_ip())
    }

    /// Forwarded by the daemon's network monitor on any routing change.
    pub fn on_routing_changed(&self) -> VpnResult<()> {
        match self.tunnel.lock().clone() {
            Some(tunnel) => tunnel.on_routing_changed(),
            None => Ok(()),
        }
    }

    /// Start the built-in default-route watcher, feeding
    /// [`VpnService::on_routing_changed`].
    pub fn spawn_route_watcher(service: &Arc<VpnService>) {
        let weak = Arc::downgrade(service);
        let watcher =
            DefaultRouteWatcher::spawn(service.shim.clone(), ROUTE_WATCH_INTERVAL, move |route| {
                log::info!("default route changed (gateway {})", route.gateway);
                if let Some(service) = weak.upgrade() {
                    if let Err(e) = service.on_routing_changed() {
                        log::error!("failed to reconcile routes: {}", e);
                    }
                }
            });
        *service.route_watcher.lock() = Some(watcher);
    }

    pub fn stop_route_watcher(&self) {
        if let Some(mut watcher) = self.route_watcher.lock().take() {
            watcher.stop();
        }
    }

    /// Launch a connectivity test in the background. Any running test is
    /// stopped first, and a live tunnel is disconnected: the probes need
    /// the unmodified network.
    pub fn connection_test_start(
        &self,
        servers: ServersCatalogue,
        private_key: &str,
        local_ip: Ipv4Addr,
        current: Option<CurrentSelection>,
        policy: ProbePolicy,
        events: Arc<dyn ConnTestEvents>,
    ) -> VpnResult<()> {
        self.connection_test_stop();
        if let Err(e) = self.disconnect() {
            log::error!("failed to disconnect before connectivity test: {}", e);
        }

        let mut tester = ConnectivityTester::new(self.shim.clone(), servers, private_key, local_ip)
            .with_policy(policy);
        if let Some(current) = current {
            tester = tester.with_current(current);
        }
        let tester = Arc::new(tester);
        *self.tester.lock() = Some(Arc::clone(&tester));

        let (status_tx, status_rx) = bounded::<StatusEvent>(STATUS_CHANNEL_CAPACITY);

        let forward_events = Arc::clone(&events);
        std::thread::spawn(move || {
            for status in status_rx {
                log::info!(
                    "connection test: server: {} ({}) host={} ({}:{} {})...",
                    status.server.country,
                    status.server.city,
                    status.host.hostname,
                    status.host.host,
                    status.port.port,
                    status.port.port_type,
                );
                forward_events.on_connection_test_status(&status);
            }
        });

        let slot = Arc::clone(&self.tester);
        std::thread::spawn(move || {
            let result = tester.test(&status_tx);
            drop(status_tx);
            match &result {
                Ok(good) => log::info!("connection test success: {:?}", good),
                Err(e) => log::info!("connection test failed: {}", e),
            }
            events.on_connection_test_result(result);
            *slot.lock() = None;
        });

        Ok(())
    }

    /// Cooperatively stop a running connectivity test, if any.
    pub fn connection_test_stop(&self) {
        if let Some(tester) = self.tester.lock().as_ref() {
            tester.stop();
        }
    }

    fn tunnel_local_ip(&self) -> Option<IpAddr> {
        self.tunnel
            .lock()
            .as_ref()
            .map(|t| IpAddr::V4(t.params().client_local_ip))
    }
}
