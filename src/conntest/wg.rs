//! Throw-away WireGuard device for connectivity probing.
//!
//! The tester brings a device up against a dummy loopback remote (real
//! connectivity is irrelevant at this point) and then re-aims the same
//! device at each candidate by replacing its peer set. The session is
//! tagged test-only: no routes, no DNS, no handshake wait on start, and it
//! cannot coexist with a real tunnel session.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::platform::Shim;
use crate::servers::HostInfo;
use crate::vpn::device::{self, PeerConfig, TunnelDevice};
use crate::vpn::lifecycle::{self, SessionPermit};
use crate::vpn::params::{self, ConnectionParameters};
use crate::vpn::{VpnError, VpnResult};

/// Any valid key works here; the dummy peer never answers.
const DUMMY_PUBLIC_KEY: &str = "rg+GGDmjM4Vxo1hURvKmgm9yonb6qcoKbPCP/DNDBnI=";
const DUMMY_HOST_PORT: u16 = 2049;
/// In-tunnel gateway placeholder for the dummy configuration.
const DUMMY_HOST_LOCAL_IP: &str = "172.16.0.1";

const INIT_READY_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_KEEPALIVE_SECS: u32 = 60;

/// A live test-only tunnel device.
pub(crate) struct TestTunnel {
    device: TunnelDevice,
    private_key: String,
    _permit: SessionPermit,
}

impl TestTunnel {
    /// Bring up the probing device with the user's real credentials and a
    /// dummy remote.
    pub fn init(
        shim: &Shim,
        private_key: &str,
        local_ip: Ipv4Addr,
        cancel: &AtomicBool,
    ) -> VpnResult<TestTunnel> {
        params::parse_key(private_key).map_err(|_| {
            VpnError::Config(
                "WireGuard credentials are not defined (please re-generate the keys or re-login)"
                    .to_string(),
            )
        })?;

        let permit = lifecycle::acquire_test_session()?;

        let mut dummy = ConnectionParameters::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DUMMY_PUBLIC_KEY,
            DUMMY_HOST_LOCAL_IP.parse().unwrap(),
            DUMMY_HOST_PORT,
            0,
        )?;
        dummy.set_credentials(private_key, local_ip)?;

        let iface = device::allocate_interface(shim)?;
        let mut dev = TunnelDevice::start(shim, &iface)?;

        let result = (|| {
            dev.wait_ready(INIT_READY_TIMEOUT, cancel)?;
            dev.configure(&dummy)
        })();
        if let Err(e) = result {
            dev.teardown();
            return Err(e);
        }

        log::info!("connectivity test device ready on {}", iface);
        Ok(TestTunnel {
            device: dev,
            private_key: private_key.to_string(),
            _permit: permit,
        })
    }

    /// Aim the device at one candidate and wait for its first handshake.
    pub fn probe(
        &self,
        host: &HostInfo,
        port: u16,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> VpnResult<()> {
        let peer = PeerConfig {
            public_key: &host.public_key,
            endpoint: format!("{}:{}", host.host, port),
            keepalive_secs: PROBE_KEEPALIVE_SECS,
            allow_ipv6: false,
        };
        self.device.reconfigure_peer(&self.private_key, &peer)?;
        self.device
            .wait_for_first_handshake(timeout, Some(cancel))
            .map(|_| ())
    }
}

impl Drop for TestTunnel {
    fn drop(&mut self) {
        self.device.teardown();
    }
}
