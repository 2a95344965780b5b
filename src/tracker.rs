//! In-memory SIP message tracker
//!
//! Keeps a bounded ring of parsed message snapshots for external observers
//! (debugging, admin surfaces). The proxy core records into it but never
//! reads it back. Subscribers get each record after the ring lock has been
//! released so a slow callback cannot stall the signaling path.

use crate::message::{header_uri, SipMessage};
use crate::sdp;
use crate::types::{host_port_from_uri, user_from_uri};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which way the message travelled relative to the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
    Fwd,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rx => "RX",
            Direction::Tx => "TX",
            Direction::Fwd => "FWD",
        }
    }
}

/// Snapshot of one tracked message
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: u64,
    /// Milliseconds since the epoch
    pub timestamp_ms: u64,
    pub direction: Direction,
    /// Method for requests, "200 OK"-style label for responses
    pub method: String,
    pub call_id: String,
    pub from_user: String,
    pub to_user: String,
    pub from_tag: String,
    pub to_tag: String,
    /// Transport-layer addresses (post-NAT)
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    /// Best-effort pre-NAT addresses from Contact/Via/SDP (source) and the
    /// R-URI (destination)
    pub src_pre_nat: String,
    pub dst_pre_nat: String,
    pub status_code: String,
    pub cseq: String,
    pub content_length: usize,
    pub has_sdp: bool,
    pub via_count: usize,
    pub route_count: usize,
    pub contact: String,
    pub user_agent: String,
    pub sdp_info: String,
    pub audio_codecs: String,
    pub video_codecs: String,
    pub is_retransmission: bool,
    pub raw: String,
}

type Subscriber = Arc<dyn Fn(&MessageRecord) + Send + Sync>;

struct TrackerInner {
    records: VecDeque<MessageRecord>,
    next_id: u64,
    enabled: bool,
}

/// Bounded ring of message records with publish/subscribe
pub struct MessageTracker {
    capacity: usize,
    inner: Mutex<TrackerInner>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Lookback window for flagging retransmissions
const RETRANSMIT_WINDOW_MS: u64 = 2000;

impl MessageTracker {
    pub fn new(capacity: usize) -> Self {
        MessageTracker {
            capacity,
            inner: Mutex::new(TrackerInner {
                records: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 0,
                enabled: true,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Record a message snapshot; oldest entries drop on overflow
    pub fn record(
        &self,
        msg: &SipMessage,
        direction: Direction,
        src: Option<SocketAddr>,
        dst: Option<SocketAddr>,
    ) {
        let published = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.enabled {
                return;
            }
            inner.next_id += 1;
            let mut record = build_record(inner.next_id, msg, direction, src, dst);

            let cutoff = record.timestamp_ms.saturating_sub(RETRANSMIT_WINDOW_MS);
            record.is_retransmission = inner.records.iter().rev().any(|r| {
                r.timestamp_ms >= cutoff
                    && r.call_id == record.call_id
                    && r.cseq == record.cseq
                    && r.direction == record.direction
                    && r.src == record.src
            });

            if inner.records.len() >= self.capacity {
                inner.records.pop_front();
            }
            inner.records.push_back(record.clone());
            record
        };

        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            subscriber(&published);
        }
    }

    /// Most recent records, newest last, up to `limit`
    pub fn records(&self, limit: usize) -> Vec<MessageRecord> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.records.len().saturating_sub(limit);
        inner.records.iter().skip(skip).cloned().collect()
    }

    /// All records for one Call-ID
    pub fn records_for_call(&self, call_id: &str) -> Vec<MessageRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.call_id == call_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().records.clear();
    }

    pub fn subscribe(&self, callback: Subscriber) {
        self.subscribers.lock().unwrap().push(callback);
    }

    /// Aggregate counters over the current ring contents
    pub fn stats(&self) -> TrackerStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = TrackerStats {
            total: inner.records.len(),
            ..Default::default()
        };
        for record in &inner.records {
            match record.direction {
                Direction::Rx => stats.rx += 1,
                Direction::Tx => stats.tx += 1,
                Direction::Fwd => stats.fwd += 1,
            }
            if record.is_retransmission {
                stats.retransmissions += 1;
            }
            if !record.status_code.is_empty() {
                stats.responses += 1;
            } else {
                stats.requests += 1;
            }
        }
        stats
    }
}

/// Summary counters for the admin surface
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackerStats {
    pub total: usize,
    pub rx: usize,
    pub tx: usize,
    pub fwd: usize,
    pub requests: usize,
    pub responses: usize,
    pub retransmissions: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn build_record(
    id: u64,
    msg: &SipMessage,
    direction: Direction,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
) -> MessageRecord {
    let (method, status_code) = if msg.is_request() {
        (
            msg.start_line()
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string(),
            String::new(),
        )
    } else {
        let code = msg
            .status_code()
            .map(|c| c.to_string())
            .unwrap_or_default();
        let label = format!("{} {}", code, msg.reason_phrase().unwrap_or(""));
        (label.trim().to_string(), code)
    };

    let media = msg.body_str().and_then(sdp::extract_media_info);
    let (sdp_info, audio_codecs, video_codecs) = match &media {
        Some(info) => (info.summary(), info.audio_codecs(), info.video_codecs()),
        None => (String::new(), String::new(), String::new()),
    };

    // Pre-NAT address: what the endpoint itself claims in Contact, else SDP
    let src_pre_nat = msg
        .contact_uri()
        .map(|uri| {
            let (host, port) = host_port_from_uri(&uri);
            format!("{}:{}", host, port)
        })
        .or_else(|| {
            media
                .as_ref()
                .and_then(|m| m.audio_addr())
                .map(|(ip, port)| format!("{}:{}", ip, port))
        })
        .unwrap_or_default();

    let dst_pre_nat = msg
        .request_uri()
        .map(|uri| {
            let (host, port) = host_port_from_uri(uri);
            format!("{}:{}", host, port)
        })
        .unwrap_or_default();

    MessageRecord {
        id,
        timestamp_ms: now_ms(),
        direction,
        method,
        call_id: msg.call_id().unwrap_or("").to_string(),
        from_user: msg
            .from_uri()
            .map(|u| user_from_uri(&u))
            .unwrap_or_default(),
        to_user: msg.to_uri().map(|u| user_from_uri(&u)).unwrap_or_default(),
        from_tag: msg.from_tag().unwrap_or_default(),
        to_tag: msg.to_tag().unwrap_or_default(),
        src,
        dst,
        src_pre_nat,
        dst_pre_nat,
        status_code,
        cseq: msg.get("cseq").unwrap_or("").to_string(),
        content_length: msg.body().len(),
        has_sdp: msg.has_sdp(),
        via_count: msg.via_count(),
        route_count: msg.route_count(),
        contact: msg.get("contact").map(header_uri).unwrap_or_default(),
        user_agent: msg.get("user-agent").unwrap_or("").to_string(),
        sdp_info,
        audio_codecs,
        video_codecs,
        is_retransmission: false,
        raw: String::from_utf8_lossy(&msg.to_bytes()).to_string(),
    }
}
