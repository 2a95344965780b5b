//! Shared-port symmetric-RTP forwarder
//!
//! Both legs of a call send media to the same relay port; datagrams are
//! attributed to caller or callee by source address. The first packet seen
//! from a side latches its actual address for the rest of the session, which
//! is what makes symmetric RTP work through NAT. Each forwarder owns one UDP
//! socket and a dedicated thread doing blocking reads with a 1 s timeout so
//! media never shares a scheduler queue with signaling.

use crate::error::{RelayError, RelayResult};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One PCMU silence frame: 12-byte RTP header, 160 payload bytes
pub const SILENCE_RTP: [u8; 172] = build_silence_frame();

const fn build_silence_frame() -> [u8; 172] {
    let mut pkt = [0xffu8; 172];
    let header = [
        0x80u8, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xa0, 0x00, 0x00, 0x00, 0x00,
    ];
    let mut i = 0;
    while i < 12 {
        pkt[i] = header[i];
        i += 1;
    }
    pkt
}

/// Continuous NAT punch cadence toward an unlatched caller
const PUNCH_INTERVAL: Duration = Duration::from_secs(2);
const PUNCH_LIMIT: u64 = 30;
/// Opportunistic punch on every Nth callee-to-caller forward
const PUNCH_EVERY_FORWARDS: u64 = 50;

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const QUIET_WARN_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketSource {
    Caller,
    Callee,
    Unknown,
}

/// Addressing state shared between the signaling loop and the thread
#[derive(Debug, Clone, Default)]
pub struct ForwarderTargets {
    pub caller_target: Option<SocketAddr>,
    pub callee_target: Option<SocketAddr>,
    pub caller_expected_ip: Option<IpAddr>,
    pub callee_expected_ip: Option<IpAddr>,
    pub caller_actual: Option<SocketAddr>,
    pub callee_actual: Option<SocketAddr>,
}

impl ForwarderTargets {
    fn caller_latched(&self) -> bool {
        self.caller_actual.is_some()
    }

    fn callee_latched(&self) -> bool {
        self.callee_actual.is_some()
    }
}

/// Counter snapshot for observability and CDR enrichment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwarderStats {
    pub caller_to_callee_packets: u64,
    pub callee_to_caller_packets: u64,
    pub unknown_packets: u64,
    pub total_bytes: u64,
    pub caller_latched: bool,
    pub callee_latched: bool,
    pub caller_addr: Option<SocketAddr>,
    pub callee_addr: Option<SocketAddr>,
}

struct Shared {
    running: AtomicBool,
    socket: UdpSocket,
    targets: Mutex<ForwarderTargets>,
    caller_to_callee: AtomicU64,
    callee_to_caller: AtomicU64,
    unknown_packets: AtomicU64,
    total_bytes: AtomicU64,
    punch_count: AtomicU64,
}

/// A single (call, stream) forwarder bound to one local UDP port
pub struct SharedPortForwarder {
    label: String,
    local_port: u16,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SharedPortForwarder {
    /// Bind the shared port; `local_port` 0 picks an ephemeral port
    pub fn bind(
        local_port: u16,
        caller_target: Option<SocketAddr>,
        callee_target: Option<SocketAddr>,
        caller_expected_ip: Option<IpAddr>,
        callee_expected_ip: Option<IpAddr>,
        label: &str,
    ) -> RelayResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).map_err(|e| {
            RelayError::transport_error(format!("0.0.0.0:{}", local_port), e.to_string(), false)
        })?;
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(|e| {
                RelayError::transport_error(format!("0.0.0.0:{}", local_port), e.to_string(), false)
            })?;
        let local_port = socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(local_port);

        Ok(SharedPortForwarder {
            label: label.to_string(),
            local_port,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                socket,
                targets: Mutex::new(ForwarderTargets {
                    caller_target,
                    callee_target,
                    caller_expected_ip,
                    callee_expected_ip,
                    caller_actual: None,
                    callee_actual: None,
                }),
                caller_to_callee: AtomicU64::new(0),
                callee_to_caller: AtomicU64::new(0),
                unknown_packets: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                punch_count: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Spawn the forwarding thread
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let label = self.label.clone();
        let port = self.local_port;
        let handle = std::thread::Builder::new()
            .name(format!("rtp-fwd-{}", port))
            .spawn(move || forward_loop(shared, label, port))
            .ok();
        *self.handle.lock().unwrap() = handle;
    }

    /// Stop the thread; the 1 s recv timeout bounds the join
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Re-point both legs and relearn addresses (re-INVITE)
    pub fn update_targets(&self, caller: Option<SocketAddr>, callee: Option<SocketAddr>) {
        let mut targets = self.shared.targets.lock().unwrap();
        targets.caller_target = caller;
        targets.callee_target = callee;
        targets.caller_actual = None;
        targets.callee_actual = None;
        info!(
            label = %self.label,
            port = self.local_port,
            ?caller,
            ?callee,
            "latch reset, forwarder targets updated"
        );
    }

    /// Burst silence frames to both expected peers (NAT hole punch)
    pub fn send_punch(&self, count: u32, interval: Duration) {
        let (caller, callee) = {
            let targets = self.shared.targets.lock().unwrap();
            (targets.caller_target, targets.callee_target)
        };
        for target in [callee, caller].into_iter().flatten() {
            debug!(label = %self.label, port = self.local_port, %target, count, "sending NAT punch burst");
            for i in 0..count {
                if self.shared.socket.send_to(&SILENCE_RTP, target).is_err() {
                    break;
                }
                if !interval.is_zero() && i + 1 < count {
                    std::thread::sleep(interval);
                }
            }
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        let targets = self.shared.targets.lock().unwrap();
        ForwarderStats {
            caller_to_callee_packets: self.shared.caller_to_callee.load(Ordering::Relaxed),
            callee_to_caller_packets: self.shared.callee_to_caller.load(Ordering::Relaxed),
            unknown_packets: self.shared.unknown_packets.load(Ordering::Relaxed),
            total_bytes: self.shared.total_bytes.load(Ordering::Relaxed),
            caller_latched: targets.caller_latched(),
            callee_latched: targets.callee_latched(),
            caller_addr: targets.caller_actual.or(targets.caller_target),
            callee_addr: targets.callee_actual.or(targets.callee_target),
        }
    }
}

impl Drop for SharedPortForwarder {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Attribute an inbound datagram to one side, latching on first sight
fn classify(targets: &mut ForwarderTargets, addr: SocketAddr) -> PacketSource {
    if targets.callee_actual == Some(addr) {
        return PacketSource::Callee;
    }
    if targets.caller_actual == Some(addr) {
        return PacketSource::Caller;
    }

    let src_ip = addr.ip();
    if targets.callee_expected_ip == Some(src_ip) && targets.caller_expected_ip != Some(src_ip) {
        targets.callee_actual = Some(addr);
        return PacketSource::Callee;
    }
    if targets.caller_expected_ip == Some(src_ip) && targets.callee_expected_ip != Some(src_ip) {
        targets.caller_actual = Some(addr);
        return PacketSource::Caller;
    }

    // one side known: the stranger is the other side
    if targets.callee_latched() && !targets.caller_latched() {
        targets.caller_actual = Some(addr);
        return PacketSource::Caller;
    }
    if targets.caller_latched() && !targets.callee_latched() {
        targets.callee_actual = Some(addr);
        return PacketSource::Callee;
    }

    // first packet of the session: the callee typically talks first
    if !targets.callee_latched() {
        targets.callee_actual = Some(addr);
        return PacketSource::Callee;
    }

    PacketSource::Unknown
}

fn forward_loop(shared: Arc<Shared>, label: String, port: u16) {
    {
        let targets = shared.targets.lock().unwrap();
        info!(
            %label,
            port,
            caller = ?targets.caller_target,
            callee = ?targets.callee_target,
            "shared-port forwarder started"
        );
    }

    let mut buf = [0u8; 2048];
    let started = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_seen: Option<Instant> = None;
    let mut quiet_warned = false;
    let mut last_punch: Option<Instant> = None;
    let mut last_a2b = 0u64;
    let mut last_b2a = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        match shared.socket.recv_from(&mut buf) {
            Ok((len, addr)) => {
                // anything shorter than an RTP header is noise
                if len < 12 {
                    continue;
                }
                last_seen = Some(Instant::now());
                shared.total_bytes.fetch_add(len as u64, Ordering::Relaxed);

                let (source, caller_dest, callee_dest, caller_target, caller_unlatched) = {
                    let mut targets = shared.targets.lock().unwrap();
                    let caller_was_latched = targets.caller_latched();
                    let callee_was_latched = targets.callee_latched();
                    let source = classify(&mut targets, addr);
                    if !caller_was_latched && targets.caller_latched() {
                        info!(%label, port, %addr, "caller latched");
                    }
                    if !callee_was_latched && targets.callee_latched() {
                        info!(%label, port, %addr, "callee latched");
                    }
                    (
                        source,
                        targets.caller_actual.or(targets.caller_target),
                        targets.callee_actual.or(targets.callee_target),
                        targets.caller_target,
                        !targets.caller_latched(),
                    )
                };

                match source {
                    PacketSource::Callee => {
                        if let Some(dest) = caller_dest {
                            if shared.socket.send_to(&buf[..len], dest).is_ok() {
                                let n =
                                    shared.callee_to_caller.fetch_add(1, Ordering::Relaxed) + 1;
                                // opportunistic punch while the caller NAT is still closed
                                if caller_unlatched && n % PUNCH_EVERY_FORWARDS == 0 {
                                    if let Some(target) = caller_target {
                                        let _ = shared.socket.send_to(&SILENCE_RTP, target);
                                    }
                                }
                            }
                        }
                    }
                    PacketSource::Caller => {
                        if let Some(dest) = callee_dest {
                            if shared.socket.send_to(&buf[..len], dest).is_ok() {
                                shared.caller_to_callee.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    PacketSource::Unknown => {
                        let n = shared.unknown_packets.fetch_add(1, Ordering::Relaxed) + 1;
                        if n <= 5 {
                            warn!(%label, port, %addr, "dropping packet from unknown source");
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!(%label, port, error = %e, "recv failed");
                }
            }
        }

        continuous_punch(&shared, &mut last_punch);

        if last_stats.elapsed() >= STATS_INTERVAL {
            let a2b = shared.caller_to_callee.load(Ordering::Relaxed);
            let b2a = shared.callee_to_caller.load(Ordering::Relaxed);
            let (caller_latched, callee_latched, caller_addr, callee_addr) = {
                let targets = shared.targets.lock().unwrap();
                (
                    targets.caller_latched(),
                    targets.callee_latched(),
                    targets.caller_actual.or(targets.caller_target),
                    targets.callee_actual.or(targets.callee_target),
                )
            };
            if a2b + b2a > 0 {
                debug!(
                    %label,
                    port,
                    a_to_b = a2b,
                    a_to_b_delta = a2b - last_a2b,
                    b_to_a = b2a,
                    b_to_a_delta = b2a - last_b2a,
                    caller_latched,
                    callee_latched,
                    ?caller_addr,
                    ?callee_addr,
                    "forwarder stats"
                );
            } else if !quiet_warned
                && last_seen.is_none()
                && started.elapsed() >= QUIET_WARN_AFTER
            {
                warn!(%label, port, ?caller_addr, ?callee_addr, "no media received for 10s");
                quiet_warned = true;
            }
            last_stats = Instant::now();
            last_a2b = a2b;
            last_b2a = b2a;
        }
    }

    debug!(%label, port, "forwarder stopped");
}

/// Punch toward an unlatched caller every 2 s, up to the limit
fn continuous_punch(shared: &Arc<Shared>, last_punch: &mut Option<Instant>) {
    let (unlatched, target) = {
        let targets = shared.targets.lock().unwrap();
        (!targets.caller_latched(), targets.caller_target)
    };
    let target = match (unlatched, target) {
        (true, Some(target)) => target,
        _ => return,
    };
    let due = last_punch.map_or(true, |t| t.elapsed() >= PUNCH_INTERVAL);
    if due && shared.punch_count.load(Ordering::Relaxed) < PUNCH_LIMIT {
        *last_punch = Some(Instant::now());
        shared.punch_count.fetch_add(1, Ordering::Relaxed);
        let _ = shared.socket.send_to(&SILENCE_RTP, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ua_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv_until<'a>(socket: &UdpSocket, buf: &'a mut [u8], want: &[u8]) -> Option<usize> {
        for _ in 0..20 {
            match socket.recv_from(buf) {
                Ok((len, _)) => {
                    if &buf[..len] == want {
                        return Some(len);
                    }
                }
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_silence_frame_shape() {
        assert_eq!(SILENCE_RTP.len(), 172);
        assert_eq!(SILENCE_RTP[0], 0x80);
        assert_eq!(&SILENCE_RTP[12..], &[0xffu8; 160][..]);
    }

    #[test]
    fn test_classify_latches_by_expected_ip() {
        let mut targets = ForwarderTargets {
            caller_expected_ip: Some("10.0.0.11".parse().unwrap()),
            callee_expected_ip: Some("10.0.0.12".parse().unwrap()),
            ..Default::default()
        };
        let callee_addr: SocketAddr = "10.0.0.12:50000".parse().unwrap();
        assert_eq!(classify(&mut targets, callee_addr), PacketSource::Callee);
        assert_eq!(targets.callee_actual, Some(callee_addr));

        let caller_addr: SocketAddr = "10.0.0.11:40000".parse().unwrap();
        assert_eq!(classify(&mut targets, caller_addr), PacketSource::Caller);
        assert_eq!(targets.caller_actual, Some(caller_addr));

        // latched addresses keep winning
        assert_eq!(classify(&mut targets, callee_addr), PacketSource::Callee);
        // a third address once both sides are latched is unknown
        let stranger: SocketAddr = "10.9.9.9:1234".parse().unwrap();
        assert_eq!(classify(&mut targets, stranger), PacketSource::Unknown);
    }

    #[test]
    fn test_classify_same_nat_falls_back_to_first_packet_rule() {
        // both legs behind the same public IP: expected-IP matching is moot
        let shared_ip: IpAddr = "203.0.113.7".parse().unwrap();
        let mut targets = ForwarderTargets {
            caller_expected_ip: Some(shared_ip),
            callee_expected_ip: Some(shared_ip),
            ..Default::default()
        };
        let first: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        let second: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        assert_eq!(classify(&mut targets, first), PacketSource::Callee);
        assert_eq!(classify(&mut targets, second), PacketSource::Caller);
    }

    #[test]
    fn test_forwards_both_directions_and_counts() {
        let caller_ua = ua_socket();
        let callee_ua = ua_socket();
        let caller_addr = caller_ua.local_addr().unwrap();
        let callee_addr = callee_ua.local_addr().unwrap();

        let forwarder = SharedPortForwarder::bind(
            0,
            Some(caller_addr),
            Some(callee_addr),
            Some(caller_addr.ip()),
            Some(callee_addr.ip()),
            "test-call",
        )
        .unwrap();
        let relay_addr: SocketAddr = format!("127.0.0.1:{}", forwarder.local_port())
            .parse()
            .unwrap();
        forwarder.start();

        // callee speaks first and is latched as callee
        let callee_payload = [0x80u8; 64];
        callee_ua.send_to(&callee_payload, relay_addr).unwrap();
        let mut buf = [0u8; 2048];
        assert!(recv_until(&caller_ua, &mut buf, &callee_payload).is_some());

        // caller answers through the same port
        let caller_payload = [0x81u8; 64];
        caller_ua.send_to(&caller_payload, relay_addr).unwrap();
        assert!(recv_until(&callee_ua, &mut buf, &caller_payload).is_some());

        // counters reflect one packet each way
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let stats = forwarder.stats();
            if stats.caller_to_callee_packets == 1 && stats.callee_to_caller_packets == 1 {
                assert!(stats.caller_latched);
                assert!(stats.callee_latched);
                break;
            }
            assert!(Instant::now() < deadline, "counters never settled");
            std::thread::sleep(Duration::from_millis(20));
        }

        forwarder.stop();
    }

    #[test]
    fn test_short_packets_dropped() {
        let callee_ua = ua_socket();
        let caller_ua = ua_socket();
        let forwarder = SharedPortForwarder::bind(
            0,
            Some(caller_ua.local_addr().unwrap()),
            Some(callee_ua.local_addr().unwrap()),
            None,
            None,
            "short",
        )
        .unwrap();
        let relay_addr: SocketAddr = format!("127.0.0.1:{}", forwarder.local_port())
            .parse()
            .unwrap();
        forwarder.start();

        callee_ua.send_to(b"tiny", relay_addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let stats = forwarder.stats();
        assert_eq!(stats.callee_to_caller_packets, 0);
        assert_eq!(stats.total_bytes, 0);

        forwarder.stop();
    }

    #[test]
    fn test_update_targets_resets_latches() {
        let forwarder = SharedPortForwarder::bind(
            0,
            Some("127.0.0.1:40000".parse().unwrap()),
            Some("127.0.0.1:50000".parse().unwrap()),
            None,
            None,
            "relearn",
        )
        .unwrap();
        {
            let mut targets = forwarder.shared.targets.lock().unwrap();
            targets.caller_actual = Some("127.0.0.1:40001".parse().unwrap());
            targets.callee_actual = Some("127.0.0.1:50001".parse().unwrap());
        }
        forwarder.update_targets(
            Some("127.0.0.1:41000".parse().unwrap()),
            Some("127.0.0.1:51000".parse().unwrap()),
        );
        let stats = forwarder.stats();
        assert!(!stats.caller_latched);
        assert!(!stats.callee_latched);
        assert_eq!(stats.caller_addr, Some("127.0.0.1:41000".parse().unwrap()));
    }

    #[test]
    fn test_punch_burst_reaches_both_legs() {
        let caller_ua = ua_socket();
        let callee_ua = ua_socket();
        let forwarder = SharedPortForwarder::bind(
            0,
            Some(caller_ua.local_addr().unwrap()),
            Some(callee_ua.local_addr().unwrap()),
            None,
            None,
            "punch",
        )
        .unwrap();
        forwarder.send_punch(3, Duration::ZERO);

        let mut buf = [0u8; 2048];
        let (len, _) = caller_ua.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &SILENCE_RTP[..]);
        let (len, _) = callee_ua.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &SILENCE_RTP[..]);
    }
}
