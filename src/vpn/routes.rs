//! Routing-table mutations for the tunnel.
//!
//! Installs the routes that pull traffic into the tunnel and pins the VPN
//! server itself to the original gateway so that the encrypted packets can
//! still escape. Two redirection styles exist (see
//! [`RoutingStyle`](crate::platform::RoutingStyle)):
//!
//! - `ReplaceDefault`: scope the original `default` to its interface, then
//!   install a new `default` via the tunnel gateway. Keeps OS services that
//!   bind directly to the primary interface working.
//!   Note: a standalone scoped `default` stops routing, so teardown must
//!   re-add the plain original default before deleting the scoped one.
//! - `HalfDefault`: add `0/1` (and `128.0.0.0/1`) beside the untouched
//!   original default; more specific routes win.
//!
//! Every installed route is recorded before the OS call is issued, so
//! teardown removes exactly what was installed. Partial failure triggers a
//! full reverse-order rollback.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::platform::{exec_checked, DefaultRoute, RoutingStyle, Shim};
use crate::vpn::params::ConnectionParameters;
use crate::vpn::{VpnError, VpnResult};

/// One routing-table mutation together with everything its removal needs.
#[derive(Debug, Clone)]
enum InstalledRoute {
    /// The `ReplaceDefault` three-step dance.
    ScopedDefaultPair {
        original: DefaultRoute,
        tunnel_gateway: IpAddr,
    },
    /// `0/1` via the tunnel gateway.
    HalfDefault { tunnel_gateway: IpAddr },
    /// VPN server public IP pinned to the original gateway.
    HostPin { host: IpAddr },
    /// `128.0.0.0/1` via the tunnel gateway.
    UpperHalf { tunnel_gateway: IpAddr },
    /// `::/1` plus `8000::/1` via the tunnel IPv6 gateway.
    V6Halves { tunnel_gateway: Ipv6Addr },
}

/// The exact set of routes this process installed, in installation order.
#[derive(Debug, Default)]
pub struct RouteSet {
    entries: Vec<InstalledRoute>,
    /// Whether the `ReplaceDefault` style was applied successfully.
    pub default_route_updated: bool,
}

impl RouteSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owner of the routing-table state for one tunnel session.
pub struct RouteManager {
    shim: Shim,
    captured: Option<DefaultRoute>,
    installed: Option<RouteSet>,
}

impl RouteManager {
    pub fn new(shim: Shim) -> Self {
        RouteManager {
            shim,
            captured: None,
            installed: None,
        }
    }

    /// Read the current system default route. Fails only when none exists.
    pub fn capture_default(&self) -> VpnResult<DefaultRoute> {
        self.shim.platform.default_route()
    }

    pub fn captured(&self) -> Option<&DefaultRoute> {
        self.captured.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }

    pub fn default_route_updated(&self) -> bool {
        self.installed
            .as_ref()
            .map(|s| s.default_route_updated)
            .unwrap_or(false)
    }

    /// Install the tunnel routes. On partial failure everything already
    /// installed is rolled back in reverse order and the error is returned.
    pub fn install(
        &mut self,
        params: &ConnectionParameters,
        default_route: &DefaultRoute,
    ) -> VpnResult<()> {
        if self.installed.is_some() {
            return Err(VpnError::Resource("routes are already installed".to_string()));
        }
        if params.host_ip.is_loopback() {
            return Err(VpnError::Config(
                "unable to use a loopback address as the VPN server IP".to_string(),
            ));
        }

        log::info!("modifying routing table...");
        self.captured = Some(default_route.clone());

        let mut set = RouteSet::default();
        let tunnel_gateway = params.tunnel_gateway();

        let result = (|| -> VpnResult<()> {
            // Default-route redirection first.
            match self.shim.platform.routing_style() {
                RoutingStyle::ReplaceDefault => {
                    set.entries.push(InstalledRoute::ScopedDefaultPair {
                        original: default_route.clone(),
                        tunnel_gateway,
                    });
                    match self.replace_default(default_route, tunnel_gateway) {
                        Ok(()) => set.default_route_updated = true,
                        Err(e) => {
                            // Revert the dance and fall back to the 0/1 style.
                            log::error!("failed to update the default route: {}", e);
                            self.remove_entry(set.entries.pop().unwrap());
                            set.entries.push(InstalledRoute::HalfDefault { tunnel_gateway });
                            self.add_half_default(tunnel_gateway)?;
                        }
                    }
                }
                RoutingStyle::HalfDefault => {
                    set.entries.push(InstalledRoute::HalfDefault { tunnel_gateway });
                    self.add_half_default(tunnel_gateway)?;
                }
            }

            // Pin the VPN server to the original gateway so the encrypted
            // packets can still leave through the physical interface.
            set.entries.push(InstalledRoute::HostPin { host: params.host_ip });
            self.add_host_pin(params.host_ip, default_route.gateway)?;

            set.entries.push(InstalledRoute::UpperHalf { tunnel_gateway });
            self.add_upper_half(tunnel_gateway)?;

            if let Some(gw6) = params.host_local_ipv6 {
                // ::/0 expressed as two /1 networks: more specific routes win
                // and the original IPv6 default stays untouched.
                set.entries.push(InstalledRoute::V6Halves { tunnel_gateway: gw6 });
                self.add_v6_halves(gw6)?;
            }

            Ok(())
        })();

        match result {
            Ok(()) => {
                self.installed = Some(set);
                Ok(())
            }
            Err(e) => {
                log::error!("route installation failed, rolling back: {}", e);
                for entry in set.entries.drain(..).rev() {
                    self.remove_entry(entry);
                }
                self.captured = None;
                Err(e)
            }
        }
    }

    /// Remove every installed route, most recent first. Failures are logged
    /// and never interrupt the remaining removals.
    pub fn remove(&mut self) {
        let Some(mut set) = self.installed.take() else {
            return;
        };
        log::info!("restoring routing table...");
        for entry in set.entries.drain(..).rev() {
            self.remove_entry(entry);
        }
        self.captured = None;
    }

    /// React to a default-route change reported by the watcher. Returns
    /// whether the routes were re-installed.
    pub fn reconcile_on_default_change(
        &mut self,
        params: &ConnectionParameters,
    ) -> VpnResult<bool> {
        let observed = self.shim.platform.default_route()?;

        let expected = if self.default_route_updated() {
            // The system default currently points at the tunnel gateway.
            params.tunnel_gateway()
        } else {
            match &self.captured {
                Some(captured) => captured.gateway,
                None => return Ok(false),
            }
        };

        if observed.gateway == expected {
            return Ok(false);
        }

        log::info!(
            "default gateway changed: {} -> {}, updating routes...",
            expected,
            observed.gateway
        );
        self.remove();
        self.install(params, &observed)?;
        Ok(true)
    }

    // -- individual mutations ------------------------------------------------

    fn route(&self, args: &[&str]) -> VpnResult<()> {
        exec_checked(
            self.shim.runner.as_ref(),
            self.shim.platform.route_binary(),
            args,
        )?;
        Ok(())
    }

    fn route_best_effort(&self, args: &[&str]) {
        if let Err(e) = self.route(args) {
            log::warn!("route cleanup: {}", e);
        }
    }

    fn replace_default(&self, original: &DefaultRoute, tunnel_gateway: IpAddr) -> VpnResult<()> {
        let orig_gw = original.gateway.to_string();
        // Scoping the original default frees the `default` slot for the
        // tunnel gateway.
        self.route(&["-n", "add", "default", &orig_gw, "-ifscope", &original.interface])?;
        self.route(&["-n", "delete", "default", &orig_gw])?;
        self.route(&["-n", "add", "default", &tunnel_gateway.to_string()])
    }

    fn add_half_default(&self, tunnel_gateway: IpAddr) -> VpnResult<()> {
        self.route(&["-n", "add", "-inet", "-net", "0/1", &tunnel_gateway.to_string()])
    }

    fn add_host_pin(&self, host: IpAddr, original_gateway: IpAddr) -> VpnResult<()> {
        match host {
            IpAddr::V4(host) => self.route(&[
                "-n",
                "add",
                "-inet",
                "-net",
                &host.to_string(),
                &original_gateway.to_string(),
                "255.255.255.255",
            ]),
            IpAddr::V6(host) => self.route(&[
                "-n",
                "add",
                "-inet6",
                "-host",
                &host.to_string(),
                &original_gateway.to_string(),
            ]),
        }
    }

    fn add_upper_half(&self, tunnel_gateway: IpAddr) -> VpnResult<()> {
        self.route(&[
            "-n",
            "add",
            "-inet",
            "-net",
            "128.0.0.0",
            &tunnel_gateway.to_string(),
            "128.0.0.0",
        ])
    }

    fn add_v6_halves(&self, gw: Ipv6Addr) -> VpnResult<()> {
        let gw = gw.to_string();
        self.route(&["-n", "add", "-inet6", "-net", "::/1", &gw])?;
        self.route(&["-n", "add", "-inet6", "-net", "8000::/1", &gw])
    }

    fn remove_entry(&self, entry: InstalledRoute) {
        match entry {
            InstalledRoute::ScopedDefaultPair {
                original,
                tunnel_gateway,
            } => {
                let orig_gw = original.gateway.to_string();
                self.route_best_effort(&["-n", "delete", "default", &tunnel_gateway.to_string()]);
                // The standalone scoped default does not route on its own:
                // restore the plain default before removing the scoped one.
                self.route_best_effort(&["-n", "add", "default", &orig_gw]);
                self.route_best_effort(&[
                    "-n", "delete", "default", &orig_gw, "-ifscope", &original.interface,
                ]);
            }
            InstalledRoute::HalfDefault { tunnel_gateway } => {
                self.route_best_effort(&[
                    "-n",
                    "delete",
                    "-inet",
                    "-net",
                    "0/1",
                    &tunnel_gateway.to_string(),
                ]);
            }
            InstalledRoute::HostPin { host } => match host {
                IpAddr::V4(host) => {
                    self.route_best_effort(&["-n", "delete", "-inet", "-net", &host.to_string()]);
                }
                IpAddr::V6(host) => {
                    self.route_best_effort(&["-n", "delete", "-inet6", "-host", &host.to_string()]);
                }
            },
            InstalledRoute::UpperHalf { tunnel_gateway } => {
                self.route_best_effort(&[
                    "-n",
                    "delete",
                    "-inet",
                    "-net",
                    "128.0.0.0",
                    &tunnel_gateway.to_string(),
                ]);
            }
            InstalledRoute::V6Halves { tunnel_gateway } => {
                let gw = tunnel_gateway.to_string();
                self.route_best_effort(&["-n", "delete", "-inet6", "-net", "8000::/1", &gw]);
                self.route_best_effort(&["-n", "delete", "-inet6", "-net", "::/1", &gw]);
            }
        }
    }
}

/// Polls the system default route and reports gateway changes.
pub struct DefaultRouteWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DefaultRouteWatcher {
    pub fn spawn(
        shim: Shim,
        interval: Duration,
        on_change: impl Fn(DefaultRoute) + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("route-watcher".to_string())
            .spawn(move || {
                let mut last_gateway = shim.platform.default_route().ok().map(|r| r.gateway);
                while !stop_flag.load(Ordering::SeqCst) {
                    // Sleep in slices so stop is observed promptly.
                    let mut remaining = interval;
                    while !remaining.is_zero() && !stop_flag.load(Ordering::SeqCst) {
                        let slice = remaining.min(Duration::from_millis(50));
                        std::thread::sleep(slice);
                        remaining -= slice;
                    }
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }

                    if let Ok(route) = shim.platform.default_route() {
                        if last_gateway != Some(route.gateway) {
                            last_gateway = Some(route.gateway);
                            on_change(route);
                        }
                    }
                }
            })
            .expect("failed to spawn route watcher thread");

        DefaultRouteWatcher {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DefaultRouteWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
