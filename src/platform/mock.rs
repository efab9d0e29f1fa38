//! Recording executor and platform stand-in.
//!
//! Every OS mutation in this crate goes through [`CommandRunner`], so the
//! whole engine can be exercised without privileges by substituting the
//! runner with [`RecordingRunner`]: it logs each command, replays scripted
//! outputs and fakes spawned children. Compiled unconditionally so that
//! integration tests (and downstream daemon tests) can use it too.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::{ChildHandle, CommandRunner, DefaultRoute, ExecOutput, Platform, RoutingStyle, Shim};
use crate::vpn::VpnResult;

type Responder = dyn Fn(&[String], &str) -> Option<ExecOutput> + Send + Sync;

/// Command executor that records instead of executing.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, Vec<ExecOutput>)>>,
    responder: Mutex<Option<Box<Responder>>>,
    fail_matching: Mutex<Vec<String>>,
    spawned: Mutex<Vec<MockChildControl>>,
    spawn_stdout: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// All executed commands, each as `"<binary> <args...>"`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    /// Queue outputs for commands containing `needle`. Outputs are consumed
    /// in order; the last one is repeated once the queue drains.
    pub fn respond(&self, needle: &str, outputs: Vec<ExecOutput>) {
        self.responses.lock().push((needle.to_string(), outputs));
    }

    pub fn respond_stdout(&self, needle: &str, stdout: &str) {
        self.respond(
            needle,
            vec![ExecOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }],
        );
    }

    /// Answer commands dynamically: the closure sees the full call history
    /// (current call included, last) and the current call, and may return
    /// an output. Scripted `respond` queues take precedence.
    pub fn set_responder(
        &self,
        responder: impl Fn(&[String], &str) -> Option<ExecOutput> + Send + Sync + 'static,
    ) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Make any command containing `needle` exit with status 1.
    pub fn fail_on(&self, needle: &str) {
        self.fail_matching.lock().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_matching.lock().clear();
    }

    /// Stdout lines every spawned child emits immediately (e.g. the
    /// userspace WireGuard readiness marker).
    pub fn set_spawn_stdout(&self, lines: Vec<String>) {
        *self.spawn_stdout.lock() = lines;
    }

    /// Controls for children spawned so far, in spawn order.
    pub fn spawned_children(&self) -> Vec<MockChildControl> {
        self.spawned.lock().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn exec(&self, binary: &Path, args: &[&str]) -> VpnResult<ExecOutput> {
        let call = format!("{} {}", binary.display(), args.join(" "));
        self.calls.lock().push(call.clone());

        for needle in self.fail_matching.lock().iter() {
            if call.contains(needle.as_str()) {
                return Ok(ExecOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: format!("forced failure ({})", needle),
                });
            }
        }

        {
            let mut responses = self.responses.lock();
            for (needle, outputs) in responses.iter_mut() {
                if call.contains(needle.as_str()) {
                    if outputs.len() > 1 {
                        return Ok(outputs.remove(0));
                    }
                    if let Some(last) = outputs.first() {
                        return Ok(last.clone());
                    }
                }
            }
        }

        if let Some(responder) = self.responder.lock().as_ref() {
            let history = self.calls.lock().clone();
            if let Some(out) = responder(&history, &call) {
                return Ok(out);
            }
        }

        Ok(ExecOutput::default())
    }

    fn spawn(
        &self,
        binary: &Path,
        args: &[&str],
        _env: &[(&str, &str)],
    ) -> VpnResult<Box<dyn ChildHandle>> {
        let call = format!("{} {}", binary.display(), args.join(" "));
        self.calls.lock().push(format!("spawn {}", call));

        let (tx, rx) = unbounded();
        for line in self.spawn_stdout.lock().iter() {
            let _ = tx.send(line.clone());
        }

        let control = MockChildControl {
            stdout_tx: tx,
            exit: Arc::new(ExitCell::default()),
        };
        self.spawned.lock().push(control.clone());

        Ok(Box::new(MockChild {
            control,
            stdout_rx: rx,
        }))
    }
}

#[derive(Default)]
struct ExitCell {
    code: Mutex<Option<i32>>,
    cond: Condvar,
}

/// Test-side handle to a fake child process.
#[derive(Clone)]
pub struct MockChildControl {
    stdout_tx: Sender<String>,
    exit: Arc<ExitCell>,
}

impl MockChildControl {
    /// Emit a stdout line from the fake process.
    pub fn emit(&self, line: &str) {
        let _ = self.stdout_tx.send(line.to_string());
    }

    /// Terminate the fake process with the given exit code.
    pub fn exit(&self, code: i32) {
        let mut guard = self.exit.code.lock();
        if guard.is_none() {
            *guard = Some(code);
            self.exit.cond.notify_all();
        }
    }

    pub fn is_exited(&self) -> bool {
        self.exit.code.lock().is_some()
    }
}

struct MockChild {
    control: MockChildControl,
    stdout_rx: Receiver<String>,
}

impl ChildHandle for MockChild {
    fn stdout_lines(&self) -> Receiver<String> {
        self.stdout_rx.clone()
    }

    fn wait(&mut self) -> VpnResult<i32> {
        let mut guard = self.control.exit.code.lock();
        while guard.is_none() {
            self.control.exit.cond.wait(&mut guard);
        }
        Ok(guard.unwrap())
    }

    fn kill(&mut self) {
        self.control.exit(-9);
    }

    fn killer(&self) -> Arc<dyn Fn() + Send + Sync> {
        let control = self.control.clone();
        Arc::new(move || control.exit(-9))
    }

    fn is_running(&mut self) -> bool {
        !self.control.is_exited()
    }
}

/// Configurable platform facts for tests.
pub struct MockPlatform {
    route: PathBuf,
    ifconfig: PathBuf,
    ipconfig: PathBuf,
    dns_script: PathBuf,
    wg_binary: PathBuf,
    wg_tool: PathBuf,
    wg_config: PathBuf,
    routing_style: Mutex<RoutingStyle>,
    interfaces: Mutex<Vec<String>>,
    default_route: Mutex<Option<DefaultRoute>>,
    primary_up: AtomicBool,
    doh: bool,
    dot: bool,
}

impl Default for MockPlatform {
    fn default() -> Self {
        // Unique per instance: the device controller really writes and
        // removes this file, and tests run in parallel.
        static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let wg_config = std::env::temp_dir().join(format!(
            "veilport-test-{}-{}.conf",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        MockPlatform {
            route: PathBuf::from("/sbin/route"),
            ifconfig: PathBuf::from("/sbin/ifconfig"),
            ipconfig: PathBuf::from("/usr/sbin/ipconfig"),
            dns_script: PathBuf::from("/opt/veilport/etc/dns.sh"),
            wg_binary: PathBuf::from("/opt/veilport/wireguard/wireguard-go"),
            wg_tool: PathBuf::from("/opt/veilport/wireguard/wg"),
            wg_config,
            routing_style: Mutex::new(RoutingStyle::ReplaceDefault),
            interfaces: Mutex::new(Vec::new()),
            default_route: Mutex::new(Some(DefaultRoute {
                gateway: "192.168.1.1".parse().unwrap(),
                interface: "en0".to_string(),
            })),
            primary_up: AtomicBool::new(true),
            doh: true,
            dot: false,
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_routing_style(&self, style: RoutingStyle) {
        *self.routing_style.lock() = style;
    }

    pub fn set_interfaces(&self, names: Vec<&str>) {
        *self.interfaces.lock() = names.into_iter().map(String::from).collect();
    }

    pub fn set_default_route(&self, route: Option<DefaultRoute>) {
        *self.default_route.lock() = route;
    }

    pub fn set_default_gateway(&self, gateway: IpAddr) {
        let mut guard = self.default_route.lock();
        if let Some(ref mut r) = *guard {
            r.gateway = gateway;
        }
    }

    pub fn set_primary_interface_up(&self, up: bool) {
        self.primary_up.store(up, Ordering::SeqCst);
    }
}

impl Platform for MockPlatform {
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
        *self.routing_style.lock()
    }

    fn enumerate_tunnel_interfaces(&self) -> VpnResult<Vec<String>> {
        Ok(self.interfaces.lock().clone())
    }

    fn default_route(&self) -> VpnResult<DefaultRoute> {
        self.default_route
            .lock()
            .clone()
            .ok_or_else(|| crate::vpn::VpnError::Os("no default route".to_string()))
    }

    fn is_primary_interface_up(&self) -> bool {
        self.primary_up.load(Ordering::SeqCst)
    }

    fn supports_doh(&self) -> bool {
        self.doh
    }

    fn supports_dot(&self) -> bool {
        self.dot
    }
}

/// Shim wired to a fresh [`RecordingRunner`] and [`MockPlatform`].
pub fn mock_shim() -> (Shim, Arc<RecordingRunner>, Arc<MockPlatform>) {
    let runner = Arc::new(RecordingRunner::new());
    let platform = Arc::new(MockPlatform::new());
    let shim = Shim {
        platform: platform.clone(),
        runner: runner.clone(),
    };
    (shim, runner, platform)
}
