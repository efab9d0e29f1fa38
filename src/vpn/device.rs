//! Tunnel device controller.
//!
//! Owns one tunnel interface for the duration of a session: allocates a
//! free device name, runs the userspace WireGuard process on it, assigns
//! addresses and MTU, pushes the peer configuration through the control
//! tool, and kills the process again on teardown.
//!
//! The controller does not decide *when* any of this happens; the
//! lifecycle (or the connectivity tester, which reuses the controller with
//! a throw-away peer) drives it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::platform::{exec_checked, ChildHandle, Shim};
use crate::vpn::handshake;
use crate::vpn::params::ConnectionParameters;
use crate::vpn::{VpnError, VpnResult};

// Printed by wireguard-go once its control socket is up.
// Careful: constant strings, may change with a WireGuard update.
const INIT_MARKER: &str = "UAPI listener started";
const ADDR_IN_USE_MARKER: &str = "Address already in use";

const SETCONF_ATTEMPTS: u32 = 5;
const KEEPALIVE_SECS: u32 = 25;

const SUBNET_MASK_V4: &str = "255.0.0.0";
const SUBNET_PREFIX_V6: &str = "64";

/// Pick the next free tunnel interface name by scanning the present
/// devices and taking the highest index plus one.
pub fn allocate_interface(shim: &Shim) -> VpnResult<String> {
    let prefix = shim.platform.tunnel_interface_prefix();
    let names = shim.platform.enumerate_tunnel_interfaces()?;

    let mut max_index: u32 = 0;
    for name in &names {
        if let Some(index) = name
            .strip_prefix(prefix)
            .and_then(|s| s.parse::<u32>().ok())
        {
            max_index = max_index.max(index);
        }
    }

    let next = max_index + 1;
    if next >= shim.platform.max_tunnel_interfaces() {
        return Err(VpnError::Resource(format!(
            "no free tunnel interface ({}{} exceeds the platform limit)",
            prefix, next
        )));
    }
    Ok(format!("{}{}", prefix, next))
}

/// Peer half of a pushed WireGuard configuration.
pub struct PeerConfig<'a> {
    pub public_key: &'a str,
    /// `host:port` text form.
    pub endpoint: String,
    pub keepalive_secs: u32,
    pub allow_ipv6: bool,
}

/// A running tunnel device.
pub struct TunnelDevice {
    shim: Shim,
    name: String,
    child: Option<Box<dyn ChildHandle>>,
    killer: Arc<dyn Fn() + Send + Sync>,
    stopped: AtomicBool,
}

impl TunnelDevice {
    /// Spawn the userspace WireGuard process on the given interface.
    pub fn start(shim: &Shim, name: &str) -> VpnResult<Self> {
        log::info!("starting WireGuard on interface {}", name);
        let child = shim.runner.spawn(
            shim.platform.wg_binary_path(),
            &["-f", name],
            &[("LOG_LEVEL", "verbose")],
        )?;
        let killer = child.killer();

        Ok(TunnelDevice {
            shim: shim.clone(),
            name: name.to_string(),
            child: Some(child),
            killer,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shareable teardown handle; lets a disconnect request kill the
    /// process while another thread blocks in [`TunnelDevice::wait_exit`].
    pub fn killer(&self) -> Arc<dyn Fn() + Send + Sync> {
        self.killer.clone()
    }

    /// Wait for the process to report its control socket as up.
    ///
    /// All process output seen while waiting is mirrored into the log;
    /// once ready, a drainer thread keeps logging the remaining output.
    pub fn wait_ready(&mut self, timeout: Duration, cancel: &AtomicBool) -> VpnResult<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| VpnError::Resource("tunnel process is not running".to_string()))?;
        let lines = child.stdout_lines();
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(VpnError::Cancelled);
            }

            match lines.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => {
                    log::info!("[wg] {}", line);
                    if line.contains(INIT_MARKER) {
                        // Keep logging whatever the process prints later.
                        std::thread::spawn(move || {
                            for line in lines {
                                log::info!("[wg] {}", line);
                            }
                        });
                        return Ok(());
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if !child.is_running() {
                        return Err(VpnError::Os(
                            "WireGuard process terminated during initialization".to_string(),
                        ));
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(VpnError::Os(
                        "WireGuard process terminated during initialization".to_string(),
                    ));
                }
            }

            if Instant::now() >= deadline {
                return Err(VpnError::Timeout(
                    "WireGuard process initialization timeout".to_string(),
                ));
            }
        }
    }

    /// Assign addresses, push the peer configuration and set the MTU.
    pub fn configure(&self, params: &ConnectionParameters) -> VpnResult<()> {
        log::info!("configuring {} interface...", self.name);
        self.assign_addresses(params)?;

        let peer = PeerConfig {
            public_key: &params.host_public_key,
            endpoint: params.endpoint().to_string(),
            keepalive_secs: KEEPALIVE_SECS,
            allow_ipv6: params.has_ipv6(),
        };
        self.push_peer_config(&params.private_key, &peer)?;

        if params.mtu > 0 {
            log::info!("configuring custom MTU = {} ...", params.mtu);
            exec_checked(
                self.shim.runner.as_ref(),
                self.shim.platform.ifconfig_binary(),
                &[&self.name, "mtu", &params.mtu.to_string()],
            )?;
        }
        Ok(())
    }

    /// Replace the peer set of the running device. Used by the
    /// connectivity tester to re-aim the same device at each candidate.
    pub fn reconfigure_peer(&self, private_key: &str, peer: &PeerConfig<'_>) -> VpnResult<()> {
        self.push_peer_config(private_key, peer)
    }

    /// Block until a peer reports its first handshake.
    pub fn wait_for_first_handshake(
        &self,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> VpnResult<u64> {
        handshake::wait_for_first_handshake(&self.shim, &self.name, timeout, cancel)
    }

    /// Block until the WireGuard process exits; returns its exit code.
    pub fn wait_exit(&mut self) -> VpnResult<i32> {
        match self.child.as_mut() {
            Some(child) => child.wait(),
            None => Ok(0),
        }
    }

    /// Kill the WireGuard process (and with it the interface). Idempotent.
    pub fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("stopping WireGuard process ({})", self.name);
        (self.killer)();
    }

    fn assign_addresses(&self, params: &ConnectionParameters) -> VpnResult<()> {
        exec_checked(
            self.shim.runner.as_ref(),
            self.shim.platform.ipconfig_binary(),
            &[
                "set",
                &self.name,
                "MANUAL",
                &params.client_local_ip.to_string(),
                SUBNET_MASK_V4,
            ],
        )?;

        if let Some(ipv6) = params.client_local_ipv6 {
            exec_checked(
                self.shim.runner.as_ref(),
                self.shim.platform.ipconfig_binary(),
                &[
                    "set",
                    &self.name,
                    "MANUAL-V6",
                    &ipv6.to_string(),
                    SUBNET_PREFIX_V6,
                ],
            )?;
        }
        Ok(())
    }

    /// Write the config file and apply it with `wg setconf`, retrying with
    /// a fresh ephemeral listen port while the previous one is in use.
    fn push_peer_config(&self, private_key: &str, peer: &PeerConfig<'_>) -> VpnResult<()> {
        let config_path = self.shim.platform.wg_config_file_path().to_path_buf();

        let result = (|| {
            for _ in 0..SETCONF_ATTEMPTS {
                let config = render_config(private_key, ephemeral_listen_port(), peer);
                std::fs::write(&config_path, config)?;

                let out = self.shim.runner.exec(
                    self.shim.platform.wg_tool_path(),
                    &["setconf", &self.name, config_path_str(&config_path)],
                )?;

                if out.stdout.contains(ADDR_IN_USE_MARKER) || out.stderr.contains(ADDR_IN_USE_MARKER)
                {
                    log::warn!("listen port already in use, retrying with a new one");
                    continue;
                }
                if !out.success() {
                    return Err(VpnError::Os(format!(
                        "wg setconf failed (status {}): {}",
                        out.status,
                        out.stderr.trim()
                    )));
                }
                return Ok(());
            }
            Err(VpnError::Resource(
                "failed to set wireguard configuration (listen port is busy)".to_string(),
            ))
        })();

        // The file carries the private key: never leave it behind.
        if let Err(e) = std::fs::remove_file(&config_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove wireguard config file: {}", e);
            }
        }
        result
    }
}

fn config_path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

/// Random port from the dynamic/ephemeral range.
fn ephemeral_listen_port() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(49152..=65535)
}

/// Render the `wg setconf` file for a single-peer device.
fn render_config(private_key: &str, listen_port: u16, peer: &PeerConfig<'_>) -> String {
    // "0.0.0.0/1, 128.0.0.0/1" instead of "0.0.0.0/0": the /0 form enables
    // the built-in WireGuard firewall, which would fight the daemon's own.
    let allowed_ips = if peer.allow_ipv6 {
        "128.0.0.0/1, 0.0.0.0/1, ::/0"
    } else {
        "128.0.0.0/1, 0.0.0.0/1"
    };

    format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         ListenPort = {}\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         Endpoint = {}\n\
         PersistentKeepalive = {}\n\
         AllowedIPs = {}\n",
        private_key, listen_port, peer.public_key, peer.endpoint, peer.keepalive_secs, allowed_ips
    )
}
