//! Connection parameters and WireGuard key handling.
//!
//! A `ConnectionParameters` value is immutable once a connect attempt
//! begins; the lifecycle and the connectivity tester both consume it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::dns::DnsSettings;
use crate::vpn::{VpnError, VpnResult};

/// Parameters of a single tunnel connection.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    /// Local (inside-tunnel) IPv4 address assigned to the client.
    pub client_local_ip: Ipv4Addr,
    /// Local IPv6 address, when the account has one.
    pub client_local_ipv6: Option<Ipv6Addr>,

    /// Server public key, base64.
    pub host_public_key: String,
    /// Routable public IP of the server host.
    pub host_ip: IpAddr,
    /// Peer gateway inside the tunnel.
    pub host_local_ip: Ipv4Addr,
    /// Peer IPv6 gateway inside the tunnel, when available.
    pub host_local_ipv6: Option<Ipv6Addr>,
    pub host_port: u16,

    /// 0 means platform default.
    pub mtu: u32,

    pub multihop_exit_host: Option<String>,

    /// Resolver to install while connected; defaults to the tunnel gateway.
    pub dns: Option<DnsSettings>,

    /// Client private key, base64.
    pub private_key: String,
}

impl ConnectionParameters {
    pub fn new(
        host_ip: IpAddr,
        host_public_key: &str,
        host_local_ip: Ipv4Addr,
        host_port: u16,
        mtu: u32,
    ) -> VpnResult<Self> {
        if host_port == 0 {
            return Err(VpnError::Config("host port is not defined".to_string()));
        }
        parse_key(host_public_key)?;

        Ok(ConnectionParameters {
            client_local_ip: Ipv4Addr::UNSPECIFIED,
            client_local_ipv6: None,
            host_public_key: host_public_key.to_string(),
            host_ip,
            host_local_ip,
            host_local_ipv6: None,
            host_port,
            mtu,
            multihop_exit_host: None,
            dns: None,
            private_key: String::new(),
        })
    }

    /// Set the client credentials. Required before connecting.
    pub fn set_credentials(&mut self, private_key: &str, client_local_ip: Ipv4Addr) -> VpnResult<()> {
        parse_key(private_key)?;
        if client_local_ip.is_unspecified() {
            return Err(VpnError::Config("client local IP is not defined".to_string()));
        }
        self.private_key = private_key.to_string();
        self.client_local_ip = client_local_ip;
        Ok(())
    }

    pub fn set_ipv6(&mut self, client_local_ipv6: Ipv6Addr, host_local_ipv6: Ipv6Addr) {
        self.client_local_ipv6 = Some(client_local_ipv6);
        self.host_local_ipv6 = Some(host_local_ipv6);
    }

    /// Everything a connect attempt needs, present and consistent?
    pub fn validate(&self) -> VpnResult<()> {
        if self.private_key.is_empty() || self.client_local_ip.is_unspecified() {
            return Err(VpnError::Config(
                "credentials are not defined (please re-generate the WireGuard keys)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host_ip, self.host_port)
    }

    /// The in-tunnel gateway, used as the target of the redirected routes.
    pub fn tunnel_gateway(&self) -> IpAddr {
        IpAddr::V4(self.host_local_ip)
    }

    pub fn has_ipv6(&self) -> bool {
        self.client_local_ipv6.is_some()
    }

    /// Resolver to apply while connected. Falls back to plain DNS at the
    /// tunnel gateway, which runs a resolver on every server.
    pub fn effective_dns(&self) -> DnsSettings {
        self.dns
            .clone()
            .unwrap_or_else(|| DnsSettings::plain(IpAddr::V4(self.host_local_ip)))
    }
}

/// Decode a canonical base64 WireGuard key.
pub fn parse_key(key: &str) -> VpnResult<[u8; 32]> {
    let bytes = STANDARD
        .decode(key)
        .map_err(|e| VpnError::Config(format!("invalid base64 key: {}", e)))?;
    if bytes.len() != 32 {
        return Err(VpnError::Config(format!(
            "key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Generate a fresh x25519 keypair as `(private, public)` base64 strings.
pub fn generate_keypair() -> (String, String) {
    use rand::rngs::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    let private = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&private);
    (
        STANDARD.encode(private.as_bytes()),
        STANDARD.encode(public.as_bytes()),
    )
}

/// Derive the base64 public key from a base64 private key.
pub fn derive_public_key(private_key: &str) -> VpnResult<String> {
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(parse_key(private_key)?);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}
