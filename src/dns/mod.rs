//! Resolver configuration.
//!
//! Applies the tunnel resolver while connected and restores the previous
//! configuration on teardown. When the requested resolver lives in a
//! locally attached network, the configuration is additionally applied to
//! every non-VPN interface whose network contains the resolver, so local
//! lookups keep working.
//!
//! All mutations are serialised by an internal mutex and the last applied
//! settings are tracked in a single cell: re-applying equal settings is a
//! no-op, and teardown reverses exactly what was installed. Panics from the
//! OS bridge are caught and surfaced as typed errors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::platform::{exec_checked, Shim};
use crate::vpn::{VpnError, VpnResult};

/// Resolver transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsEncryption {
    Plain,
    DnsOverTls,
    DnsOverHttps,
}

/// A resolver configuration requested by the user or derived from the
/// connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsSettings {
    pub ip: IpAddr,
    pub encryption: DnsEncryption,
    /// Required when `encryption` is DoH.
    pub doh_template: Option<String>,
}

impl DnsSettings {
    pub fn plain(ip: IpAddr) -> Self {
        DnsSettings {
            ip,
            encryption: DnsEncryption::Plain,
            doh_template: None,
        }
    }

    pub fn doh(ip: IpAddr, template: impl Into<String>) -> Self {
        DnsSettings {
            ip,
            encryption: DnsEncryption::DnsOverHttps,
            doh_template: Some(template.into()),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn info_string(&self) -> String {
        match self.encryption {
            DnsEncryption::Plain => self.ip.to_string(),
            DnsEncryption::DnsOverTls => format!("{} (DoT)", self.ip),
            DnsEncryption::DnsOverHttps => format!(
                "{} (DoH {})",
                self.ip,
                self.doh_template.as_deref().unwrap_or("")
            ),
        }
    }
}

/// What the platform can do beyond plain DNS.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptionAbilities {
    pub doh: bool,
    pub dot: bool,
}

/// OS bridge for resolver mutations. The shipped implementation invokes the
/// platform DNS script; a typed-API family would implement the same trait.
pub trait DnsBridge: Send + Sync {
    /// Apply the resolver for the VPN interface (system-wide on the script
    /// platform).
    fn set(&self, settings: &DnsSettings) -> VpnResult<()>;

    /// Additively apply the resolver on a non-VPN interface.
    fn add_to_interface(&self, iface_ip: IpAddr, settings: &DnsSettings) -> VpnResult<()>;

    /// Remove a previously added resolver from a non-VPN interface.
    fn delete_from_interface(&self, iface_ip: IpAddr, settings: &DnsSettings) -> VpnResult<()>;

    /// Restore the pre-connect resolver configuration.
    fn restore(&self) -> VpnResult<()>;

    /// Prepare the system resolver to use an IPv6 nameserver on the tunnel
    /// interface. Must run before the interface is configured.
    fn init_ipv6_resolver(&self, local_ip: Ipv6Addr, iface: &str) -> VpnResult<()>;

    fn encryption_abilities(&self) -> EncryptionAbilities;
}

/// Bridge invoking the platform DNS shell script.
pub struct ScriptBridge {
    shim: Shim,
}

impl ScriptBridge {
    pub fn new(shim: Shim) -> Self {
        ScriptBridge { shim }
    }

    fn run(&self, args: &[&str]) -> VpnResult<()> {
        exec_checked(
            self.shim.runner.as_ref(),
            self.shim.platform.dns_script_path(),
            args,
        )?;
        Ok(())
    }
}

impl DnsBridge for ScriptBridge {
    fn set(&self, settings: &DnsSettings) -> VpnResult<()> {
        let ip = settings.ip.to_string();
        match settings.doh_template.as_deref() {
            Some(template) => self.run(&["-up_set_dns", &ip, template]),
            None => self.run(&["-up_set_dns", &ip]),
        }
    }

    fn add_to_interface(&self, iface_ip: IpAddr, settings: &DnsSettings) -> VpnResult<()> {
        self.run(&["-add", &settings.ip.to_string(), &iface_ip.to_string()])
    }

    fn delete_from_interface(&self, iface_ip: IpAddr, settings: &DnsSettings) -> VpnResult<()> {
        self.run(&["-delete", &settings.ip.to_string(), &iface_ip.to_string()])
    }

    fn restore(&self) -> VpnResult<()> {
        self.run(&["-down"])
    }

    fn init_ipv6_resolver(&self, local_ip: Ipv6Addr, iface: &str) -> VpnResult<()> {
        self.run(&["-up_init_ipv6_resolver", &local_ip.to_string(), iface])
    }

    fn encryption_abilities(&self) -> EncryptionAbilities {
        EncryptionAbilities {
            doh: self.shim.platform.supports_doh(),
            dot: self.shim.platform.supports_dot(),
        }
    }
}

/// Resolver state owner. One instance per process, shared behind `Arc`.
pub struct DnsManager {
    bridge: Arc<dyn DnsBridge>,
    /// Last applied settings; `None` when the system configuration is in
    /// its original state.
    last: Mutex<Option<DnsSettings>>,
    /// Serialises every mutation.
    op_lock: Mutex<()>,
}

impl DnsManager {
    pub fn new(bridge: Arc<dyn DnsBridge>) -> Self {
        DnsManager {
            bridge,
            last: Mutex::new(None),
            op_lock: Mutex::new(()),
        }
    }

    pub fn with_script(shim: Shim) -> Self {
        Self::new(Arc::new(ScriptBridge::new(shim)))
    }

    pub fn get_encryption_abilities(&self) -> EncryptionAbilities {
        self.bridge.encryption_abilities()
    }

    /// Apply a resolver configuration.
    ///
    /// `vpn_iface_local_ip` is the tunnel-local address; it is skipped when
    /// looking for non-VPN interfaces to update and must match the resolver
    /// address family.
    pub fn set_manual(
        &self,
        settings: &DnsSettings,
        vpn_iface_local_ip: Option<IpAddr>,
    ) -> VpnResult<()> {
        let _guard = self.op_lock.lock();

        self.validate(settings)?;
        if let Some(iface_ip) = vpn_iface_local_ip {
            if iface_ip.is_ipv6() != settings.is_ipv6() {
                return Err(VpnError::Config(
                    "DNS address family does not match the tunnel interface family".to_string(),
                ));
            }
        }

        if self.last.lock().as_ref() == Some(settings) {
            return Ok(());
        }

        // A different resolver was active before: remove it from the
        // non-VPN interfaces first (the VPN interface is overwritten below).
        if self.last.lock().is_some() {
            self.remove_applied(None)?;
        }

        log::info!("changing DNS to {} ...", settings.info_string());
        bridged(|| self.bridge.set(settings))?;

        for (name, iface_ip) in interfaces_containing(settings.ip, vpn_iface_local_ip)? {
            log::info!("adding DNS {} to local interface {}", settings.ip, name);
            bridged(|| self.bridge.add_to_interface(iface_ip, settings))?;
        }

        *self.last.lock() = Some(settings.clone());
        Ok(())
    }

    /// Undo exactly what the last `set_manual` installed.
    pub fn delete_manual(&self, vpn_iface_local_ip: Option<IpAddr>) -> VpnResult<()> {
        let _guard = self.op_lock.lock();
        self.remove_applied(vpn_iface_local_ip)
    }

    /// Prepare the system resolver for an IPv6 nameserver on the tunnel
    /// interface. Runs before the interface itself is configured.
    pub fn init_ipv6_resolver(&self, local_ip: Ipv6Addr, iface: &str) -> VpnResult<()> {
        let _guard = self.op_lock.lock();
        bridged(|| self.bridge.init_ipv6_resolver(local_ip, iface))
    }

    /// Temporarily restore OS defaults while the tunnel is paused.
    ///
    /// No-op on this platform family: pause tears the tunnel down and the
    /// reconnect cycle rebuilds the resolver configuration.
    pub fn pause(&self) -> VpnResult<()> {
        Ok(())
    }

    /// Counterpart of [`DnsManager::pause`]; equally a no-op here.
    pub fn resume(&self) -> VpnResult<()> {
        Ok(())
    }

    fn validate(&self, settings: &DnsSettings) -> VpnResult<()> {
        let abilities = self.bridge.encryption_abilities();
        match settings.encryption {
            DnsEncryption::Plain => Ok(()),
            DnsEncryption::DnsOverTls => {
                if !abilities.dot {
                    return Err(VpnError::Config(
                        "DNS over TLS is not supported on this platform".to_string(),
                    ));
                }
                Ok(())
            }
            DnsEncryption::DnsOverHttps => {
                if !abilities.doh {
                    return Err(VpnError::Config(
                        "DNS over HTTPS is not supported on this platform".to_string(),
                    ));
                }
                if settings.doh_template.as_deref().unwrap_or("").is_empty() {
                    return Err(VpnError::Config(
                        "DNS over HTTPS requires a template URL".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn remove_applied(&self, vpn_iface_local_ip: Option<IpAddr>) -> VpnResult<()> {
        let last = self.last.lock().clone();
        let Some(last) = last else {
            return Ok(());
        };

        log::info!("restoring default DNS...");
        match interfaces_containing(last.ip, vpn_iface_local_ip) {
            Ok(ifaces) => {
                for (name, iface_ip) in ifaces {
                    log::info!("removing DNS {} from local interface {}", last.ip, name);
                    if let Err(e) = bridged(|| self.bridge.delete_from_interface(iface_ip, &last)) {
                        log::error!("failed to remove DNS from {}: {}", name, e);
                    }
                }
            }
            Err(e) => log::error!("failed to enumerate local interfaces: {}", e),
        }

        let result = bridged(|| self.bridge.restore());
        *self.last.lock() = None;
        result
    }
}

/// Catch panics escaping the OS bridge and convert them to typed errors.
fn bridged(f: impl FnOnce() -> VpnResult<()>) -> VpnResult<()> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("DNS bridge panicked (recovered): {}", msg);
            Err(VpnError::Os(format!("DNS bridge panic: {}", msg)))
        }
    }
}

/// IPv4 interfaces whose attached network contains `addr`, skipping the
/// interface owning `skip_ip`. Used to decide which non-VPN interfaces need
/// the resolver applied additively.
fn interfaces_containing(
    addr: IpAddr,
    skip_ip: Option<IpAddr>,
) -> VpnResult<Vec<(String, IpAddr)>> {
    let IpAddr::V4(addr) = addr else {
        // Only local IPv4 networks are considered here.
        return Ok(Vec::new());
    };

    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| VpnError::Os(format!("failed to enumerate interfaces: {}", e)))?;

    let mut out = Vec::new();
    for ifa in addrs {
        let (Some(address), Some(netmask)) = (ifa.address, ifa.netmask) else {
            continue;
        };
        let (Some(inet), Some(mask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in()) else {
            continue;
        };

        let iface_ip = Ipv4Addr::from(u32::from_be(inet.ip().into()));
        let mask = Ipv4Addr::from(u32::from_be(mask.ip().into()));

        if iface_ip.is_loopback() || Some(IpAddr::V4(iface_ip)) == skip_ip {
            continue;
        }
        if v4_network_contains(iface_ip, mask, addr) {
            out.push((ifa.interface_name.clone(), IpAddr::V4(iface_ip)));
        }
    }
    Ok(out)
}

fn v4_network_contains(iface_ip: Ipv4Addr, netmask: Ipv4Addr, addr: Ipv4Addr) -> bool {
    let mask = u32::from(netmask);
    (u32::from(iface_ip) & mask) == (u32::from(addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockBridge {
        sets: AtomicUsize,
        restores: AtomicUsize,
        panic_on_set: bool,
        abilities: EncryptionAbilities,
    }

    impl DnsBridge for MockBridge {
        fn set(&self, _settings: &DnsSettings) -> VpnResult<()> {
            if self.panic_on_set {
                panic!("bridge exploded");
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn add_to_interface(&self, _ip: IpAddr, _s: &DnsSettings) -> VpnResult<()> {
            Ok(())
        }
        fn delete_from_interface(&self, _ip: IpAddr, _s: &DnsSettings) -> VpnResult<()> {
            Ok(())
        }
        fn restore(&self) -> VpnResult<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn init_ipv6_resolver(&self, _ip: Ipv6Addr, _iface: &str) -> VpnResult<()> {
            Ok(())
        }
        fn encryption_abilities(&self) -> EncryptionAbilities {
            self.abilities
        }
    }

    fn manager_with(bridge: MockBridge) -> (DnsManager, Arc<MockBridge>) {
        let bridge = Arc::new(bridge);
        (DnsManager::new(bridge.clone()), bridge)
    }

    fn resolver() -> DnsSettings {
        // Documentation range: not present in any locally attached network,
        // so the non-VPN interface scan stays empty on any test host.
        DnsSettings::plain("198.51.100.53".parse().unwrap())
    }

    #[test]
    fn set_then_delete_calls_bridge_once_each() {
        let (mgr, bridge) = manager_with(MockBridge::default());
        mgr.set_manual(&resolver(), None).unwrap();
        mgr.delete_manual(None).unwrap();
        assert_eq!(bridge.sets.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.restores.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redundant_set_is_noop() {
        let (mgr, bridge) = manager_with(MockBridge::default());
        mgr.set_manual(&resolver(), None).unwrap();
        mgr.set_manual(&resolver(), None).unwrap();
        assert_eq!(bridge.sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_without_set_is_noop() {
        let (mgr, bridge) = manager_with(MockBridge::default());
        mgr.delete_manual(None).unwrap();
        assert_eq!(bridge.restores.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn doh_requires_template() {
        let (mgr, _) = manager_with(MockBridge {
            abilities: EncryptionAbilities { doh: true, dot: false },
            ..Default::default()
        });
        let mut cfg = DnsSettings::doh("9.9.9.9".parse().unwrap(), "");
        cfg.doh_template = None;
        assert!(matches!(
            mgr.set_manual(&cfg, None),
            Err(VpnError::Config(_))
        ));
    }

    #[test]
    fn dot_rejected_without_ability() {
        let (mgr, _) = manager_with(MockBridge::default());
        let cfg = DnsSettings {
            ip: "9.9.9.9".parse().unwrap(),
            encryption: DnsEncryption::DnsOverTls,
            doh_template: None,
        };
        assert!(matches!(
            mgr.set_manual(&cfg, None),
            Err(VpnError::Config(_))
        ));
    }

    #[test]
    fn family_mismatch_is_hard_error() {
        let (mgr, _) = manager_with(MockBridge::default());
        let cfg = DnsSettings::plain("2001:db8::53".parse().unwrap());
        let err = mgr
            .set_manual(&cfg, Some("10.8.0.2".parse().unwrap()))
            .unwrap_err();
        assert!(matches!(err, VpnError::Config(_)));
    }

    #[test]
    fn bridge_panic_becomes_os_error() {
        let (mgr, _) = manager_with(MockBridge {
            panic_on_set: true,
            ..Default::default()
        });
        let err = mgr.set_manual(&resolver(), None).unwrap_err();
        assert!(matches!(err, VpnError::Os(_)));
    }

    #[test]
    fn network_containment() {
        let iface: Ipv4Addr = "192.168.1.10".parse().unwrap();
        let mask: Ipv4Addr = "255.255.255.0".parse().unwrap();
        assert!(v4_network_contains(iface, mask, "192.168.1.53".parse().unwrap()));
        assert!(!v4_network_contains(iface, mask, "192.168.2.53".parse().unwrap()));
    }
}
