//! Per-call media session management for the B2BUA path
//!
//! Sessions are created lazily when the first INVITE SDP is rewritten. The
//! relay uses a shared-port scheme: both legs are told (through rewritten
//! SDP) to send media to the B-leg RTP port, and the forwarder separates the
//! flows by source address. This keeps media alive when the caller's
//! firewall drops inbound UDP to unsolicited ports, and it halves port
//! consumption.

use crate::allocator::PortAllocator;
use crate::config::MediaMode;
use crate::error::RelayResult;
use crate::forwarder::SharedPortForwarder;
use crate::sdp;
use crate::types::epoch_secs;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which forwarder of a call a key addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    AudioRtp,
    AudioRtcp,
    VideoRtp,
    VideoRtcp,
}

/// Media addressing and lifecycle state for one call
#[derive(Debug, Clone)]
pub struct MediaSession {
    pub call_id: String,
    pub a_leg_rtp_port: u16,
    pub a_leg_rtcp_port: u16,
    pub b_leg_rtp_port: u16,
    pub b_leg_rtcp_port: u16,
    pub a_leg_video_rtp_port: Option<u16>,
    pub a_leg_video_rtcp_port: Option<u16>,
    pub b_leg_video_rtp_port: Option<u16>,
    pub b_leg_video_rtcp_port: Option<u16>,

    /// Audio address the A leg declared in its SDP
    pub a_leg_sdp_addr: Option<(String, u16)>,
    pub a_leg_video_sdp_addr: Option<(String, u16)>,
    /// UDP source of the SIP message that carried the A leg's SDP
    pub a_leg_signaling_addr: Option<SocketAddr>,

    pub b_leg_sdp_addr: Option<(String, u16)>,
    pub b_leg_video_sdp_addr: Option<(String, u16)>,
    pub b_leg_signaling_addr: Option<SocketAddr>,

    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,

    pub caller_number: Option<String>,
    pub callee_number: Option<String>,
}

impl MediaSession {
    fn new(call_id: &str, a_ports: (u16, u16), b_ports: (u16, u16)) -> Self {
        MediaSession {
            call_id: call_id.to_string(),
            a_leg_rtp_port: a_ports.0,
            a_leg_rtcp_port: a_ports.1,
            b_leg_rtp_port: b_ports.0,
            b_leg_rtcp_port: b_ports.1,
            a_leg_video_rtp_port: None,
            a_leg_video_rtcp_port: None,
            b_leg_video_rtp_port: None,
            b_leg_video_rtcp_port: None,
            a_leg_sdp_addr: None,
            a_leg_video_sdp_addr: None,
            a_leg_signaling_addr: None,
            b_leg_sdp_addr: None,
            b_leg_video_sdp_addr: None,
            b_leg_signaling_addr: None,
            created_at: epoch_secs(),
            started_at: None,
            ended_at: None,
            caller_number: None,
            callee_number: None,
        }
    }

    /// Target for media sent toward one leg: the SDP RTP port, but behind
    /// NAT the signaling-side public IP replaces the SDP address
    fn rtp_target(
        sdp_addr: &Option<(String, u16)>,
        signaling: &Option<SocketAddr>,
    ) -> Option<SocketAddr> {
        let (sdp_ip, sdp_port) = sdp_addr.as_ref()?;
        let ip: IpAddr = match signaling {
            Some(addr) => addr.ip(),
            None => sdp_ip.parse().ok()?,
        };
        Some(SocketAddr::new(ip, *sdp_port))
    }

    pub fn a_leg_rtp_target(&self) -> Option<SocketAddr> {
        Self::rtp_target(&self.a_leg_sdp_addr, &self.a_leg_signaling_addr)
    }

    pub fn b_leg_rtp_target(&self) -> Option<SocketAddr> {
        Self::rtp_target(&self.b_leg_sdp_addr, &self.b_leg_signaling_addr)
    }

    pub fn a_leg_video_target(&self) -> Option<SocketAddr> {
        Self::rtp_target(&self.a_leg_video_sdp_addr, &self.a_leg_signaling_addr)
    }

    pub fn b_leg_video_target(&self) -> Option<SocketAddr> {
        Self::rtp_target(&self.b_leg_video_sdp_addr, &self.b_leg_signaling_addr)
    }

    fn a_expected_ip(&self) -> Option<IpAddr> {
        self.a_leg_signaling_addr
            .map(|a| a.ip())
            .or_else(|| self.a_leg_sdp_addr.as_ref().and_then(|(ip, _)| ip.parse().ok()))
    }

    fn b_expected_ip(&self) -> Option<IpAddr> {
        self.b_leg_signaling_addr
            .map(|a| a.ip())
            .or_else(|| self.b_leg_sdp_addr.as_ref().and_then(|(ip, _)| ip.parse().ok()))
    }
}

/// Counter snapshot for one call
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub call_id: String,
    pub shared_port: u16,
    pub a_to_b_packets: u64,
    pub b_to_a_packets: u64,
    pub caller_latched: bool,
    pub callee_latched: bool,
    pub duration_secs: u64,
}

/// Manages media sessions and their forwarders
pub struct MediaRelay {
    server_ip: String,
    mode: MediaMode,
    force_plain_rtp: bool,
    allocator: Arc<PortAllocator>,
    sessions: HashMap<String, MediaSession>,
    forwarders: HashMap<(String, StreamKind), SharedPortForwarder>,
}

impl MediaRelay {
    pub fn new(
        server_ip: &str,
        mode: MediaMode,
        force_plain_rtp: bool,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        MediaRelay {
            server_ip: server_ip.to_string(),
            mode,
            force_plain_rtp,
            allocator,
            sessions: HashMap::new(),
            forwarders: HashMap::new(),
        }
    }

    pub fn session(&self, call_id: &str) -> Option<&MediaSession> {
        self.sessions.get(call_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn get_or_create_session(&mut self, call_id: &str) -> RelayResult<&mut MediaSession> {
        if !self.sessions.contains_key(call_id) {
            let a_ports = self.allocator.allocate_pair(call_id)?;
            let b_ports = match self.allocator.allocate_pair(call_id) {
                Ok(ports) => ports,
                Err(e) => {
                    self.allocator.release_pair(a_ports.0, a_ports.1);
                    return Err(e);
                }
            };
            info!(
                call_id,
                a_rtp = a_ports.0,
                b_rtp = b_ports.0,
                "media session created"
            );
            self.sessions
                .insert(call_id.to_string(), MediaSession::new(call_id, a_ports, b_ports));
        }
        Ok(self.sessions.get_mut(call_id).unwrap())
    }

    /// Rewrite the SDP of an INVITE about to be forwarded to the callee
    ///
    /// Records the A leg's declared media address and signaling source, then
    /// points the SDP at the shared B-leg port. Video pairs are allocated on
    /// demand when the offer carries an `m=video` line.
    pub fn process_invite_sdp(
        &mut self,
        call_id: &str,
        sdp_body: &str,
        caller_addr: SocketAddr,
        caller_number: Option<&str>,
        callee_number: Option<&str>,
    ) -> RelayResult<String> {
        if self.mode == MediaMode::Passthrough {
            return Ok(sdp::rewrite_sdp_ip(sdp_body, &caller_addr.ip().to_string()));
        }

        let media_info = sdp::extract_media_info(sdp_body);
        let wants_video = media_info
            .as_ref()
            .and_then(|m| m.video_port)
            .is_some();

        // allocate video pairs before borrowing the session mutably
        let video_ports = if wants_video {
            let has_video = self
                .sessions
                .get(call_id)
                .map(|s| s.b_leg_video_rtp_port.is_some())
                .unwrap_or(false);
            if !has_video {
                match (
                    self.allocator.allocate_pair(call_id),
                    self.allocator.allocate_pair(call_id),
                ) {
                    (Ok(a), Ok(b)) => Some((a, b)),
                    (Ok(a), Err(_)) => {
                        self.allocator.release_pair(a.0, a.1);
                        warn!(call_id, "video port allocation failed, audio only");
                        None
                    }
                    _ => {
                        warn!(call_id, "video port allocation failed, audio only");
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        let server_ip = self.server_ip.clone();
        let force_plain = self.force_plain_rtp;
        let session = self.get_or_create_session(call_id)?;

        if let Some((a_video, b_video)) = video_ports {
            session.a_leg_video_rtp_port = Some(a_video.0);
            session.a_leg_video_rtcp_port = Some(a_video.1);
            session.b_leg_video_rtp_port = Some(b_video.0);
            session.b_leg_video_rtcp_port = Some(b_video.1);
        }

        session.a_leg_signaling_addr = Some(caller_addr);
        if let Some(number) = caller_number {
            session.caller_number = Some(number.to_string());
        }
        if let Some(number) = callee_number {
            session.callee_number = Some(number.to_string());
        }
        if let Some(info) = &media_info {
            session.a_leg_sdp_addr = info.audio_addr();
            session.a_leg_video_sdp_addr = info.video_addr();
        }

        Ok(sdp::rewrite_sdp(
            sdp_body,
            &server_ip,
            session.b_leg_rtp_port,
            session.b_leg_video_rtp_port,
            force_plain,
        ))
    }

    /// Rewrite the SDP of a 200 OK about to be returned to the caller
    ///
    /// Records the B leg's media address; the answer is pointed at the same
    /// shared B-leg port the offer was, so both legs converge on one socket.
    pub fn process_answer_sdp(
        &mut self,
        call_id: &str,
        sdp_body: &str,
        callee_addr: SocketAddr,
    ) -> Option<String> {
        if self.mode == MediaMode::Passthrough {
            return Some(sdp::rewrite_sdp_ip(sdp_body, &callee_addr.ip().to_string()));
        }

        let server_ip = self.server_ip.clone();
        let force_plain = self.force_plain_rtp;
        let session = match self.sessions.get_mut(call_id) {
            Some(session) => session,
            None => {
                warn!(call_id, "answer SDP for unknown media session");
                return None;
            }
        };

        session.b_leg_signaling_addr = Some(callee_addr);
        if let Some(info) = sdp::extract_media_info(sdp_body) {
            session.b_leg_sdp_addr = info.audio_addr();
            session.b_leg_video_sdp_addr = info.video_addr();
        }

        Some(sdp::rewrite_sdp(
            sdp_body,
            &server_ip,
            session.b_leg_rtp_port,
            session.b_leg_video_rtp_port,
            force_plain,
        ))
    }

    /// Rewrite a re-INVITE's SDP, updating the sender's leg
    pub fn process_reinvite_sdp(
        &mut self,
        call_id: &str,
        sdp_body: &str,
        sender_addr: SocketAddr,
        sender_is_caller: bool,
    ) -> RelayResult<String> {
        if sender_is_caller {
            self.process_invite_sdp(call_id, sdp_body, sender_addr, None, None)
        } else {
            match self.process_answer_sdp(call_id, sdp_body, sender_addr) {
                Some(rewritten) => Ok(rewritten),
                None => self.process_invite_sdp(call_id, sdp_body, sender_addr, None, None),
            }
        }
    }

    /// Start (or re-target) forwarding once both legs' addresses are known
    ///
    /// Called on the 200 OK of INVITE. Retransmitted 200s land on the
    /// `started_at` branch and only refresh targets instead of spawning a
    /// second set of forwarders.
    pub fn start_forwarding(&mut self, call_id: &str) -> bool {
        if self.mode == MediaMode::Passthrough {
            return false;
        }
        let session = match self.sessions.get(call_id) {
            Some(session) => session.clone(),
            None => {
                warn!(call_id, "cannot start forwarding, no media session");
                return false;
            }
        };

        let a_target = match session.a_leg_rtp_target() {
            Some(target) => target,
            None => {
                warn!(call_id, "cannot start forwarding, A-leg address incomplete");
                return false;
            }
        };
        let b_target = match session.b_leg_rtp_target() {
            Some(target) => target,
            None => {
                warn!(call_id, "cannot start forwarding, B-leg address incomplete");
                return false;
            }
        };
        if a_target == b_target {
            warn!(call_id, %a_target, "leg targets identical, refusing media loop");
            return false;
        }

        if session.started_at.is_some() {
            // re-INVITE: relearn addresses, keep sockets
            if let Some(fwd) = self.forwarders.get(&(call_id.to_string(), StreamKind::AudioRtp)) {
                fwd.update_targets(Some(a_target), Some(b_target));
            }
            if let Some(fwd) = self.forwarders.get(&(call_id.to_string(), StreamKind::AudioRtcp)) {
                fwd.update_targets(
                    Some(SocketAddr::new(a_target.ip(), a_target.port() + 1)),
                    Some(SocketAddr::new(b_target.ip(), b_target.port() + 1)),
                );
            }
            if let (Some(a_video), Some(b_video)) =
                (session.a_leg_video_target(), session.b_leg_video_target())
            {
                if let Some(fwd) =
                    self.forwarders.get(&(call_id.to_string(), StreamKind::VideoRtp))
                {
                    fwd.update_targets(Some(a_video), Some(b_video));
                }
                if let Some(fwd) =
                    self.forwarders.get(&(call_id.to_string(), StreamKind::VideoRtcp))
                {
                    fwd.update_targets(
                        Some(SocketAddr::new(a_video.ip(), a_video.port() + 1)),
                        Some(SocketAddr::new(b_video.ip(), b_video.port() + 1)),
                    );
                }
            }
            return true;
        }

        let label = format!(
            "{}<->{}",
            session.caller_number.as_deref().unwrap_or("A"),
            session.callee_number.as_deref().unwrap_or("B")
        );
        let a_expected = session.a_expected_ip();
        let b_expected = session.b_expected_ip();

        info!(
            call_id,
            %label,
            shared_port = session.b_leg_rtp_port,
            caller = %a_target,
            callee = %b_target,
            "starting shared-port media forwarding"
        );

        let audio = match SharedPortForwarder::bind(
            session.b_leg_rtp_port,
            Some(a_target),
            Some(b_target),
            a_expected,
            b_expected,
            &label,
        ) {
            Ok(fwd) => fwd,
            Err(e) => {
                warn!(call_id, error = %e, "audio forwarder bind failed");
                return false;
            }
        };
        audio.start();

        let rtcp_label = format!("{}-rtcp", label);
        match SharedPortForwarder::bind(
            session.b_leg_rtcp_port,
            Some(SocketAddr::new(a_target.ip(), a_target.port() + 1)),
            Some(SocketAddr::new(b_target.ip(), b_target.port() + 1)),
            a_expected,
            b_expected,
            &rtcp_label,
        ) {
            Ok(rtcp) => {
                rtcp.start();
                self.forwarders
                    .insert((call_id.to_string(), StreamKind::AudioRtcp), rtcp);
            }
            Err(e) => warn!(call_id, error = %e, "rtcp forwarder bind failed"),
        }

        audio.send_punch(20, Duration::from_millis(10));
        self.forwarders
            .insert((call_id.to_string(), StreamKind::AudioRtp), audio);

        if let (Some(video_port), Some(a_video), Some(b_video)) = (
            session.b_leg_video_rtp_port,
            session.a_leg_video_target(),
            session.b_leg_video_target(),
        ) {
            let video_label = format!("{}-video", label);
            if let Ok(video) = SharedPortForwarder::bind(
                video_port,
                Some(a_video),
                Some(b_video),
                a_expected,
                b_expected,
                &video_label,
            ) {
                video.start();
                video.send_punch(20, Duration::from_millis(10));
                self.forwarders
                    .insert((call_id.to_string(), StreamKind::VideoRtp), video);
            }
            if let Some(rtcp_port) = session.b_leg_video_rtcp_port {
                if let Ok(video_rtcp) = SharedPortForwarder::bind(
                    rtcp_port,
                    Some(SocketAddr::new(a_video.ip(), a_video.port() + 1)),
                    Some(SocketAddr::new(b_video.ip(), b_video.port() + 1)),
                    a_expected,
                    b_expected,
                    &format!("{}-video-rtcp", label),
                ) {
                    video_rtcp.start();
                    self.forwarders
                        .insert((call_id.to_string(), StreamKind::VideoRtcp), video_rtcp);
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(call_id) {
            session.started_at = Some(epoch_secs());
        }
        true
    }

    /// Stop every forwarder of a call
    pub fn stop_forwarding(&mut self, call_id: &str) {
        for kind in [
            StreamKind::AudioRtp,
            StreamKind::AudioRtcp,
            StreamKind::VideoRtp,
            StreamKind::VideoRtcp,
        ] {
            if let Some(fwd) = self.forwarders.remove(&(call_id.to_string(), kind)) {
                fwd.stop();
            }
        }
        if let Some(session) = self.sessions.get_mut(call_id) {
            session.ended_at = Some(epoch_secs());
        }
    }

    /// Tear down a call's media: stop forwarders, release every port
    pub fn end_session(&mut self, call_id: &str) {
        self.stop_forwarding(call_id);
        if let Some(session) = self.sessions.remove(call_id) {
            info!(call_id, "media session ended");
            self.allocator
                .release_pair(session.a_leg_rtp_port, session.a_leg_rtcp_port);
            self.allocator
                .release_pair(session.b_leg_rtp_port, session.b_leg_rtcp_port);
            if let (Some(rtp), Some(rtcp)) =
                (session.a_leg_video_rtp_port, session.a_leg_video_rtcp_port)
            {
                self.allocator.release_pair(rtp, rtcp);
            }
            if let (Some(rtp), Some(rtcp)) =
                (session.b_leg_video_rtp_port, session.b_leg_video_rtcp_port)
            {
                self.allocator.release_pair(rtp, rtcp);
            }
        }
    }

    /// Tear down everything (shutdown path)
    pub fn end_all_sessions(&mut self) -> Vec<String> {
        let call_ids: Vec<String> = self.sessions.keys().cloned().collect();
        for call_id in &call_ids {
            self.end_session(call_id);
        }
        call_ids
    }

    pub fn session_stats(&self, call_id: &str) -> Option<SessionStats> {
        let session = self.sessions.get(call_id)?;
        let fwd = self
            .forwarders
            .get(&(call_id.to_string(), StreamKind::AudioRtp));
        let stats = fwd.map(|f| f.stats()).unwrap_or_default();
        Some(SessionStats {
            call_id: call_id.to_string(),
            shared_port: session.b_leg_rtp_port,
            a_to_b_packets: stats.caller_to_callee_packets,
            b_to_a_packets: stats.callee_to_caller_packets,
            caller_latched: stats.caller_latched,
            callee_latched: stats.callee_latched,
            duration_secs: session
                .started_at
                .map(|t| epoch_secs().saturating_sub(t))
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.11\r\n\
s=-\r\n\
c=IN IP4 10.0.0.11\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    const ANSWER: &str = "v=0\r\n\
o=- 2 2 IN IP4 10.0.0.12\r\n\
s=-\r\n\
c=IN IP4 10.0.0.12\r\n\
t=0 0\r\n\
m=audio 50000 RTP/AVP 0\r\n";

    fn relay(range: (u16, u16)) -> MediaRelay {
        MediaRelay::new(
            "203.0.113.5",
            MediaMode::Relay,
            false,
            Arc::new(PortAllocator::new(range.0, range.1)),
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_invite_rewrite_points_at_shared_port() {
        let mut relay = relay((21000, 21016));
        let rewritten = relay
            .process_invite_sdp("call-1", OFFER, addr("10.0.0.11:5062"), Some("1001"), Some("1002"))
            .unwrap();

        let session = relay.session("call-1").unwrap().clone();
        assert!(rewritten.contains("c=IN IP4 203.0.113.5"));
        assert!(rewritten.contains(&format!("m=audio {} RTP/AVP 0", session.b_leg_rtp_port)));
        assert_eq!(session.a_leg_sdp_addr, Some(("10.0.0.11".to_string(), 40000)));
        assert_eq!(session.a_leg_signaling_addr, Some(addr("10.0.0.11:5062")));
        assert_eq!(session.caller_number.as_deref(), Some("1001"));
    }

    #[test]
    fn test_answer_rewrite_uses_same_shared_port() {
        let mut relay = relay((21016, 21032));
        let offer_rewrite = relay
            .process_invite_sdp("call-2", OFFER, addr("10.0.0.11:5062"), None, None)
            .unwrap();
        let answer_rewrite = relay
            .process_answer_sdp("call-2", ANSWER, addr("10.0.0.12:5063"))
            .unwrap();

        let session = relay.session("call-2").unwrap();
        let port_line = format!("m=audio {} RTP/AVP 0", session.b_leg_rtp_port);
        assert!(offer_rewrite.contains(&port_line));
        assert!(answer_rewrite.contains(&port_line));
        assert_eq!(session.b_leg_sdp_addr, Some(("10.0.0.12".to_string(), 50000)));
    }

    #[test]
    fn test_answer_without_session_is_rejected() {
        let mut relay = relay((21032, 21040));
        assert!(relay
            .process_answer_sdp("nope", ANSWER, addr("10.0.0.12:5063"))
            .is_none());
    }

    #[test]
    fn test_rtp_target_prefers_signaling_ip() {
        let mut relay = relay((21040, 21056));
        relay
            .process_invite_sdp("call-3", OFFER, addr("198.51.100.9:5062"), None, None)
            .unwrap();
        let session = relay.session("call-3").unwrap();
        // public signaling IP with the SDP-declared RTP port
        assert_eq!(session.a_leg_rtp_target(), Some(addr("198.51.100.9:40000")));
    }

    #[test]
    fn test_video_ports_allocated_on_demand() {
        let offer_av = format!("{}m=video 42000 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n", OFFER);
        let mut relay = relay((21056, 21080));
        let rewritten = relay
            .process_invite_sdp("call-4", &offer_av, addr("10.0.0.11:5062"), None, None)
            .unwrap();
        let session = relay.session("call-4").unwrap();
        let video_port = session.b_leg_video_rtp_port.unwrap();
        assert!(rewritten.contains(&format!("m=video {} RTP/AVP 96", video_port)));
        assert_eq!(session.a_leg_video_sdp_addr, Some(("10.0.0.11".to_string(), 42000)));
    }

    #[test]
    fn test_passthrough_keeps_ports() {
        let mut relay = MediaRelay::new(
            "203.0.113.5",
            MediaMode::Passthrough,
            false,
            Arc::new(PortAllocator::new(21080, 21084)),
        );
        let rewritten = relay
            .process_invite_sdp("call-5", OFFER, addr("198.51.100.9:5062"), None, None)
            .unwrap();
        assert!(rewritten.contains("c=IN IP4 198.51.100.9"));
        assert!(rewritten.contains("m=audio 40000 RTP/AVP 0"));
        assert!(relay.session("call-5").is_none());
    }

    #[test]
    fn test_end_session_releases_ports() {
        let allocator = Arc::new(PortAllocator::new(21084, 21092));
        let mut relay = MediaRelay::new("203.0.113.5", MediaMode::Relay, false, allocator.clone());
        relay
            .process_invite_sdp("call-6", OFFER, addr("10.0.0.11:5062"), None, None)
            .unwrap();
        assert_eq!(allocator.stats().used_pairs, 2);
        relay.end_session("call-6");
        assert_eq!(allocator.stats().used_pairs, 0);
        assert_eq!(relay.active_sessions(), 0);
    }

    #[test]
    fn test_forwarding_lifecycle() {
        let mut relay = relay((25600, 25616));
        relay
            .process_invite_sdp("call-7", OFFER, addr("127.0.0.1:5062"), None, None)
            .unwrap();
        // no answer yet: B-leg address incomplete
        assert!(!relay.start_forwarding("call-7"));

        relay
            .process_answer_sdp("call-7", ANSWER, addr("127.0.0.2:5063"))
            .unwrap();
        assert!(relay.start_forwarding("call-7"));
        let stats = relay.session_stats("call-7").unwrap();
        assert_eq!(stats.a_to_b_packets, 0);
        assert!(!stats.caller_latched);

        // a retransmitted 200 OK must not spawn a second forwarder set
        assert!(relay.start_forwarding("call-7"));
        relay.end_session("call-7");
    }
}
