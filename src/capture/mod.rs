use std::path::Path;

use anyhow::{Context, Result};
use pcap::{Activated, Capture, Device};

/// One captured frame: raw link-layer bytes plus the capture timestamp in
/// epoch-relative seconds.
pub struct FrameData<'a> {
    pub data: &'a [u8],
    pub timestamp: f64,
}

/// DLT_EN10MB; the analyzer understands Ethernet-II frames only.
const LINKTYPE_ETHERNET: i32 = 1;

/// Pull-based frame source over a live interface or a capture file. Both
/// variants erase to the same activated handle, so the read path is shared.
pub struct PacketSource {
    capture: Capture<dyn Activated>,
}

impl PacketSource {
    pub fn live(
        interface: Option<&str>,
        snaplen: i32,
        promisc: bool,
        bpf: Option<&str>,
    ) -> Result<Self> {
        let device = resolve_device(interface)?;
        let capture = Capture::from_device(device)?
            .snaplen(snaplen)
            .promisc(promisc)
            .timeout(1000)
            .open()
            .context("Could not activate the capture handle")?;
        Self::configure(capture.into(), bpf)
    }

    pub fn from_file(path: &Path, bpf: Option<&str>) -> Result<Self> {
        let capture = Capture::from_file(path)
            .with_context(|| format!("Could not read capture file {}", path.display()))?;
        Self::configure(capture.into(), bpf)
    }

    fn configure(mut capture: Capture<dyn Activated>, bpf: Option<&str>) -> Result<Self> {
        if let Some(expr) = bpf {
            capture
                .filter(expr, true)
                .with_context(|| format!("Bad BPF expression '{}'", expr))?;
        }
        let dl = capture.get_datalink();
        if dl.0 != LINKTYPE_ETHERNET {
            eprintln!(
                "Warning: capture link type {} is not Ethernet; frames will not decode",
                dl.0
            );
        }
        Ok(PacketSource { capture })
    }

    /// Pull the next frame. `Ok(None)` marks the end of a capture file;
    /// read timeouts on idle live interfaces are retried internally.
    pub fn next_frame(&mut self) -> Result<Option<FrameData<'_>>> {
        // `Capture<dyn Activated>::next_packet` ties its return value's lifetime to
        // the `&mut self.capture` borrow, so retrying in a loop makes NLL think the
        // borrow from a prior iteration is still live when we borrow again. Only one
        // borrow is ever active at a time, so re-borrowing through a raw pointer each
        // iteration sidesteps that false conflict without changing behavior.
        let capture: *mut Capture<dyn Activated> = &mut self.capture;
        loop {
            match unsafe { (*capture).next_packet() } {
                Ok(packet) => {
                    let tv = packet.header.ts;
                    return Ok(Some(FrameData {
                        data: packet.data,
                        timestamp: seconds_from(tv.tv_sec as i64, tv.tv_usec as i64),
                    }));
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Pick the named device, or fall back to pcap's default lookup.
fn resolve_device(name: Option<&str>) -> Result<Device> {
    match name {
        Some(wanted) => Device::list()?
            .into_iter()
            .find(|d| d.name == wanted)
            .with_context(|| format!("No capture interface named '{}'", wanted)),
        None => Device::lookup()?.context("No default capture interface"),
    }
}

/// Fold a capture timeval into f64 seconds. Subsecond fields outside the
/// microsecond range come from sloppy pcap writers and count as zero.
fn seconds_from(sec: i64, usec: i64) -> f64 {
    let whole = sec.max(0) as f64;
    let frac = if (0..1_000_000).contains(&usec) {
        usec as f64 / 1_000_000.0
    } else {
        0.0
    };
    whole + frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_from_combines_fields() {
        assert_eq!(seconds_from(10, 500_000), 10.5);
        assert_eq!(seconds_from(0, 0), 0.0);
    }

    #[test]
    fn seconds_from_discards_bogus_subseconds() {
        assert_eq!(seconds_from(7, 2_000_000), 7.0);
        assert_eq!(seconds_from(7, -1), 7.0);
    }

    #[test]
    fn seconds_from_clamps_negative_seconds() {
        assert_eq!(seconds_from(-5, 100), 0.0001);
    }
}
