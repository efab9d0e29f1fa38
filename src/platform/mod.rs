//! Platform shim
//!
//! Narrow abstraction over everything the tunnel engine needs from the host
//! OS: executing system tools (`route`, `ifconfig`, `wg`, the DNS script),
//! spawning the userspace WireGuard process, enumerating tunnel interfaces
//! and reading the default route. One implementation per OS family; no
//! component above this module forks a subprocess directly.
//!
//! Commands are always fully specified as an absolute binary path plus an
//! argv array. Nothing is interpolated into a shell.

pub mod mock;

use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use crate::vpn::{VpnError, VpnResult};

/// Collected result of a completed system command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes system tools. The production implementation shells out; tests
/// substitute a recording executor.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, collecting stdout and stderr.
    fn exec(&self, binary: &Path, args: &[&str]) -> VpnResult<ExecOutput>;

    /// Spawn a long-running child process with piped output.
    fn spawn(
        &self,
        binary: &Path,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> VpnResult<Box<dyn ChildHandle>>;
}

/// Handle to a spawned child process.
pub trait ChildHandle: Send {
    /// Stream of stdout lines. The receiver can be cloned and read from any
    /// thread; it disconnects when the process output closes.
    fn stdout_lines(&self) -> Receiver<String>;

    /// Block until the process exits; returns the exit code.
    fn wait(&mut self) -> VpnResult<i32>;

    /// Kill the process. Safe to call more than once or after exit.
    fn kill(&mut self);

    /// A shareable termination handle, usable from any thread while another
    /// one blocks in [`ChildHandle::wait`].
    fn killer(&self) -> Arc<dyn Fn() + Send + Sync>;

    fn is_running(&mut self) -> bool;
}

/// Run a command and convert a non-zero exit status into an error carrying
/// the tool's stderr.
pub fn exec_checked(runner: &dyn CommandRunner, binary: &Path, args: &[&str]) -> VpnResult<ExecOutput> {
    let out = runner.exec(binary, args)?;
    if !out.success() {
        return Err(VpnError::Os(format!(
            "'{} {}' failed (status {}): {}",
            binary.display(),
            args.join(" "),
            out.status,
            out.stderr.trim()
        )));
    }
    Ok(out)
}

/// The system default route at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: IpAddr,
    pub interface: String,
}

/// How the default route is redirected into the tunnel.
///
/// `HalfDefault` adds a `0/1` route and leaves the original `default`
/// untouched. That is enough for the normal routing path, but OS services
/// that bind sockets directly to the primary interface keep using the
/// original default and lose connectivity once the tunnel is up. On such
/// systems `ReplaceDefault` scopes the original default to its interface
/// and installs a new `default` via the tunnel gateway instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStyle {
    ReplaceDefault,
    HalfDefault,
}

/// Per-OS-family facts and probes.
pub trait Platform: Send + Sync {
    fn route_binary(&self) -> &Path;
    fn ifconfig_binary(&self) -> &Path;
    fn ipconfig_binary(&self) -> &Path;

    fn dns_script_path(&self) -> &Path;
    fn wg_binary_path(&self) -> &Path;
    fn wg_tool_path(&self) -> &Path;
    fn wg_config_file_path(&self) -> &Path;

    /// Name prefix of tunnel devices on this platform (e.g. `utun`).
    fn tunnel_interface_prefix(&self) -> &str;

    /// Upper bound on tunnel device indices.
    fn max_tunnel_interfaces(&self) -> u32 {
        256
    }

    fn routing_style(&self) -> RoutingStyle;

    /// Names of all currently present tunnel interfaces.
    fn enumerate_tunnel_interfaces(&self) -> VpnResult<Vec<String>>;

    /// Current system default route.
    fn default_route(&self) -> VpnResult<DefaultRoute>;

    /// Whether a primary (internet-facing) interface is currently up.
    fn is_primary_interface_up(&self) -> bool;

    fn supports_doh(&self) -> bool;
    fn supports_dot(&self) -> bool;
}

/// Bundle of the platform facts and the command runner, cloned into every
/// component that needs to touch the OS.
#[derive(Clone)]
pub struct Shim {
    pub platform: Arc<dyn Platform>,
    pub runner: Arc<dyn CommandRunner>,
}

impl Shim {
    /// Shim for the current OS, executing real commands.
    pub fn system() -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Shim {
            platform: Arc::new(MacosPlatform::new(Arc::clone(&runner))),
            runner,
        }
    }
}

// ---------------------------------------------------------------------------
// System command runner
// ---------------------------------------------------------------------------

/// Runner that executes real processes.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn exec(&self, binary: &Path, args: &[&str]) -> VpnResult<ExecOutput> {
        log::debug!("exec: {} {}", binary.display(), args.join(" "));
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                VpnError::Resource(format!("failed to execute '{}': {}", binary.display(), e))
            })?;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        binary: &Path,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> VpnResult<Box<dyn ChildHandle>> {
        log::info!("spawn: {} {}", binary.display(), args.join(" "));
        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            VpnError::Resource(format!("failed to spawn '{}': {}", binary.display(), e))
        })?;

        let (tx, rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::info!("[child err] {}", line);
                }
            });
        }

        Ok(Box::new(SystemChild {
            child,
            stdout_rx: rx,
        }))
    }
}

struct SystemChild {
    child: std::process::Child,
    stdout_rx: Receiver<String>,
}

impl ChildHandle for SystemChild {
    fn stdout_lines(&self) -> Receiver<String> {
        self.stdout_rx.clone()
    }

    fn wait(&mut self) -> VpnResult<i32> {
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            // Already exited is the normal case here.
            log::debug!("kill: {}", e);
        }
        let _ = self.child.wait();
    }

    fn killer(&self) -> Arc<dyn Fn() + Send + Sync> {
        let pid = self.child.id() as libc::pid_t;
        Arc::new(move || unsafe {
            libc::kill(pid, libc::SIGKILL);
        })
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

// ---------------------------------------------------------------------------
// macOS family
// ---------------------------------------------------------------------------

/// macOS/BSD family: `utunN` devices, BSD `route`, `ipconfig set` for
/// address assignment and a shell script for resolver configuration.
pub struct MacosPlatform {
    runner: Arc<dyn CommandRunner>,
    route: PathBuf,
    ifconfig: PathBuf,
    ipconfig: PathBuf,
    dns_script: PathBuf,
    wg_binary: PathBuf,
    wg_tool: PathBuf,
    wg_config: PathBuf,
}

impl MacosPlatform {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        MacosPlatform {
            runner,
            route: PathBuf::from("/sbin/route"),
            ifconfig: PathBuf::from("/sbin/ifconfig"),
            ipconfig: PathBuf::from("/usr/sbin/ipconfig"),
            dns_script: PathBuf::from("/opt/veilport/etc/dns.sh"),
            wg_binary: PathBuf::from("/opt/veilport/wireguard/wireguard-go"),
            wg_tool: PathBuf::from("/opt/veilport/wireguard/wg"),
            wg_config: PathBuf::from("/opt/veilport/mutable/wireguard.conf"),
        }
    }

    /// Fallback gateway detection by parsing `route -n get default`.
    fn default_route_from_tool(&self) -> VpnResult<DefaultRoute> {
        let out = exec_checked(self.runner.as_ref(), &self.route, &["-n", "get", "default"])?;

        let field = |name: &str| -> Option<String> {
            out.stdout
                .lines()
                .find(|l| l.trim().starts_with(name))
                .and_then(|l| l.split(':').nth(1))
                .map(|s| s.trim().to_string())
        };

        let gateway: IpAddr = field("gateway:")
            .ok_or_else(|| VpnError::Os("no gateway in route output".to_string()))?
            .parse()
            .map_err(|e| VpnError::Os(format!("invalid gateway in route output: {}", e)))?;
        let interface = field("interface:")
            .ok_or_else(|| VpnError::Os("no interface in route output".to_string()))?;

        Ok(DefaultRoute { gateway, interface })
    }
}

impl Platform for MacosPlatform {
    fn route_binary(&self) -> &Path {
        &self.route
    }
    fn ifconfig_binary(&self) -> &Path {
        &self.ifconfig
    }
    fn ipconfig_binary(&self) -> &Path {
        &self.ipconfig
    }
    fn dns_script_path(&self) -> &Path {
        &self.dns_script
    }
    fn wg_binary_path(&self) -> &Path {
        &self.wg_binary
    }
    fn wg_tool_path(&self) -> &Path {
        &self.wg_tool
    }
    fn wg_config_file_path(&self) -> &Path {
        &self.wg_config
    }

    fn tunnel_interface_prefix(&self) -> &str {
        "utun"
    }

    fn routing_style(&self) -> RoutingStyle {
        RoutingStyle::ReplaceDefault
    }

    fn enumerate_tunnel_interfaces(&self) -> VpnResult<Vec<String>> {
        let prefix = self.tunnel_interface_prefix();
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| VpnError::Os(format!("failed to enumerate interfaces: {}", e)))?;

        let mut names: Vec<String> = Vec::new();
        for addr in addrs {
            if addr.interface_name.starts_with(prefix) && !names.contains(&addr.interface_name) {
                names.push(addr.interface_name.clone());
            }
        }
        Ok(names)
    }

    fn default_route(&self) -> VpnResult<DefaultRoute> {
        match default_net::get_default_interface() {
            Ok(iface) => {
                if let Some(gw) = iface.gateway {
                    return Ok(DefaultRoute {
                        gateway: gw.ip_addr,
                        interface: iface.name,
                    });
                }
                log::warn!("default interface has no gateway, falling back to route tool");
            }
            Err(e) => {
                log::warn!("default interface lookup failed: {}, falling back to route tool", e);
            }
        }
        self.default_route_from_tool()
    }

    fn is_primary_interface_up(&self) -> bool {
        default_net::get_default_interface().is_ok()
    }

    fn supports_doh(&self) -> bool {
        true
    }

    fn supports_dot(&self) -> bool {
        false
    }
}
