//! First-handshake detection.
//!
//! A tunnel is only usable after the first Noise handshake with the peer
//! completes, observable as a non-zero `latest-handshakes` timestamp on the
//! control plane. The wait polls every 10 ms and honours a cancellation
//! flag between polls; the connectivity tester reuses it with very short
//! timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::platform::{exec_checked, Shim};
use crate::vpn::{VpnError, VpnResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Block until any peer of `iface` reports a completed handshake, the
/// timeout expires, or `cancel` becomes true.
///
/// Returns the handshake unix timestamp (seconds).
pub fn wait_for_first_handshake(
    shim: &Shim,
    iface: &str,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> VpnResult<u64> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(flag) = cancel {
            if flag.load(Ordering::SeqCst) {
                return Err(VpnError::Cancelled);
            }
        }

        let out = exec_checked(
            shim.runner.as_ref(),
            shim.platform.wg_tool_path(),
            &["show", iface, "latest-handshakes"],
        )?;

        if let Some(ts) = parse_latest_handshakes(&out.stdout) {
            return Ok(ts);
        }

        if Instant::now() >= deadline {
            return Err(VpnError::Timeout("WireGuard handshake timeout".to_string()));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Parse `wg show <iface> latest-handshakes` output: one
/// `<public-key>\t<unix-seconds>` line per peer. Returns the newest
/// non-zero timestamp.
fn parse_latest_handshakes(output: &str) -> Option<u64> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|ts| ts.parse::<u64>().ok())
        .filter(|ts| *ts != 0)
        .max()
}
