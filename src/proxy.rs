//! Stateful proxy core
//!
//! A single `Core` value owns every signaling-side registry: registrations,
//! dialogs, the INVITE branch map, last-final-status and last-2xx-contact
//! maps, the retransmission dedup caches and the pending-request table. It
//! is driven by one event-loop task; every handler runs synchronously from
//! message receipt until the reply or forward has been handed to a socket,
//! so none of this state needs locking.

use crate::auth::{self, UserDirectory};
use crate::cdr::CdrSink;
use crate::config::{MediaMode, RelayConfig};
use crate::error::{RelayError, RelayResult};
use crate::media::MediaRelay;
use crate::message::{header_param, header_uri, split_route_entries, SipMessage};
use crate::registry::RegistrationStore;
use crate::tracker::{Direction, MessageTracker};
use crate::transport::{CoreEvent, ReplySink};
use crate::types::{
    epoch_secs, gen_branch, gen_call_id, gen_tag, host_port_from_uri, strip_uri_params,
    user_from_uri, Method, ALLOWED_METHODS,
};
use crate::allocator::PortAllocator;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Retransmission suppression window (Timer F equivalent)
const DEDUP_WINDOW_SECS: u64 = 32;
/// Idle dialogs are reaped after an hour
const DIALOG_TIMEOUT_SECS: u64 = 3600;
const BRANCH_TTL_SECS: u64 = 32;
const PENDING_TTL_SECS: u64 = 32;

const SUPPORTED_EXTENSIONS: &str = "100rel, timer, path";
const DEFAULT_MAX_FORWARDS: i64 = 70;
const DEFAULT_EXPIRES: u64 = 3600;

/// Peer addresses of the two legs of a confirmed or pending dialog
#[derive(Debug, Clone)]
struct Dialog {
    caller: SocketAddr,
    callee: SocketAddr,
    created_at: u64,
}

#[derive(Debug, Clone)]
struct BranchEntry {
    branch: String,
    created_at: u64,
}

/// Where the original request came from, for response fallback routing
struct PendingRequest {
    peer: SocketAddr,
    sink: ReplySink,
    created_at: u64,
}

/// The proxy core: all signaling state plus its collaborators
pub struct Core {
    cfg: RelayConfig,
    users: Arc<dyn UserDirectory>,
    cdr: Arc<dyn CdrSink>,
    tracker: Arc<MessageTracker>,
    media: MediaRelay,
    /// Outbound path for forwarded messages and proxy-originated requests
    outbound: ReplySink,

    registry: RegistrationStore,
    dialogs: HashMap<String, Dialog>,
    branches: HashMap<String, BranchEntry>,
    last_final_status: HashMap<String, String>,
    last_2xx_contact: HashMap<String, String>,
    cancel_seen: HashMap<String, u64>,
    ack_seen: HashMap<String, u64>,
    bye_seen: HashMap<String, u64>,
    pending: HashMap<String, PendingRequest>,
    /// Per-source-IP routing failure counters, opaque to the core
    failure_counts: HashMap<IpAddr, u64>,
}

impl Core {
    pub fn new(
        cfg: RelayConfig,
        users: Arc<dyn UserDirectory>,
        cdr: Arc<dyn CdrSink>,
        tracker: Arc<MessageTracker>,
        outbound: ReplySink,
    ) -> Self {
        let allocator = Arc::new(PortAllocator::new(cfg.rtp_port_start, cfg.rtp_port_end));
        let media = MediaRelay::new(
            &cfg.server_ip,
            cfg.media_mode,
            cfg.force_plain_rtp,
            allocator,
        );
        Core {
            cfg,
            users,
            cdr,
            tracker,
            media,
            outbound,
            registry: RegistrationStore::new(),
            dialogs: HashMap::new(),
            branches: HashMap::new(),
            last_final_status: HashMap::new(),
            last_2xx_contact: HashMap::new(),
            cancel_seen: HashMap::new(),
            ack_seen: HashMap::new(),
            bye_seen: HashMap::new(),
            pending: HashMap::new(),
            failure_counts: HashMap::new(),
        }
    }

    /// Process one event; returns false when the loop should stop
    pub fn handle_event(&mut self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::Inbound { bytes, peer, sink } => {
                self.handle_datagram(&bytes, peer, sink);
                true
            }
            CoreEvent::SweepRegistrations => {
                self.sweep_registrations();
                true
            }
            CoreEvent::SweepDialogs => {
                self.sweep_dialogs();
                true
            }
            CoreEvent::SweepBranches => {
                self.sweep_branches();
                true
            }
            CoreEvent::SweepPending => {
                self.sweep_pending();
                true
            }
            CoreEvent::NatKeepalive => {
                self.nat_keepalive();
                true
            }
            CoreEvent::Shutdown => {
                self.shutdown();
                false
            }
        }
    }

    /// Entry point for one inbound message
    pub fn handle_datagram(&mut self, bytes: &[u8], peer: SocketAddr, sink: ReplySink) {
        let msg = match SipMessage::parse_with_limits(bytes, &self.cfg.parser_limits) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed message");
                return;
            }
        };
        self.tracker
            .record(&msg, Direction::Rx, Some(peer), Some(self.cfg.bind_addr));

        if msg.is_request() {
            self.handle_request(msg, peer, sink);
        } else {
            self.handle_response(msg, peer);
        }
    }

    // ----- request pipeline --------------------------------------------

    fn handle_request(&mut self, mut msg: SipMessage, peer: SocketAddr, sink: ReplySink) {
        let method = match msg.method() {
            Some(method) => method,
            None => return,
        };

        if !method.is_supported() {
            let mut resp = self.reply_for(&msg, 405, "Method Not Allowed");
            resp.add("allow", ALLOWED_METHODS);
            self.send_reply(resp, peer, &sink);
            return;
        }

        if method == Method::REGISTER {
            self.handle_register(msg, peer, sink);
            return;
        }

        // hop-by-hop: Max-Forwards
        let max_forwards: i64 = msg
            .get("max-forwards")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_FORWARDS);
        if max_forwards - 1 < 0 {
            let resp = self.reply_for(&msg, 483, "Too Many Hops");
            self.send_reply(resp, peer, &sink);
            return;
        }
        msg.set("max-forwards", &(max_forwards - 1).to_string());

        // pop our own Route if the UA pre-loaded one
        let mut popped_self_route = false;
        if let Some(route) = msg.top_route() {
            let (host, port) = host_port_from_uri(&header_uri(&route));
            if self.cfg.is_self(&host, port) {
                msg.pop_route();
                popped_self_route = true;
            }
        }

        match method {
            Method::ACK => self.handle_ack(msg, peer, popped_self_route),
            Method::CANCEL => self.handle_cancel(msg, peer, sink),
            Method::BYE => self.handle_bye(msg, peer, sink),
            Method::OPTIONS => {
                let uri = msg.request_uri().unwrap_or("").to_string();
                let (host, port) = host_port_from_uri(&uri);
                if self.cfg.is_self(&host, port) || user_from_uri(&uri).is_empty() {
                    let mut resp = self.reply_for(&msg, 200, "OK");
                    resp.add("allow", ALLOWED_METHODS);
                    resp.add("supported", SUPPORTED_EXTENSIONS);
                    self.send_reply(resp, peer, &sink);
                } else {
                    self.route_request(msg, Method::OPTIONS, peer, sink);
                }
            }
            method => self.route_request(msg, method, peer, sink),
        }
    }

    /// Initial vs in-dialog dispatch for the dialog-forming methods
    fn route_request(&mut self, msg: SipMessage, method: Method, peer: SocketAddr, sink: ReplySink) {
        let call_id = msg.call_id().unwrap_or("").to_string();
        let in_dialog = msg.to_tag().is_some() || self.dialogs.contains_key(&call_id);
        if in_dialog {
            self.forward_in_dialog(msg, method, peer, sink);
        } else {
            self.forward_initial(msg, method, peer, sink);
        }
    }

    /// §Initial INVITE/MESSAGE routing: resolve the To AOR to a binding
    fn forward_initial(
        &mut self,
        mut msg: SipMessage,
        method: Method,
        peer: SocketAddr,
        sink: ReplySink,
    ) {
        let call_id = msg.call_id().unwrap_or("").to_string();
        let to_uri = msg.to_uri().unwrap_or_default();
        let aor = strip_uri_params(&to_uri);

        // preloaded routes beyond ourselves are ignored
        msg.remove_all("route");

        let bindings: Vec<_> = self
            .registry
            .active_bindings(&aor)
            .into_iter()
            .filter(|b| b.source != peer)
            .collect();

        let binding = match bindings.into_iter().next() {
            Some(binding) => binding,
            None => {
                *self.failure_counts.entry(peer.ip()).or_insert(0) += 1;
                info!(%peer, %aor, "no active binding, answering 480");
                let resp = self.reply_for(&msg, 480, "Temporarily Unavailable");
                self.send_reply(resp, peer, &sink);
                if method == Method::INVITE {
                    self.cdr.on_call_fail(
                        &call_id,
                        480,
                        "Temporarily Unavailable",
                        "no active binding",
                    );
                }
                return;
            }
        };

        if matches!(method, Method::INVITE | Method::MESSAGE) {
            let trying = self.reply_for(&msg, 100, "Trying");
            self.send_reply(trying, peer, &sink);
        }

        // a user calling their own AOR gets the From rebuilt onto the
        // registered AOR so the callee sees a coherent dialog
        let from_uri = msg.from_uri().unwrap_or_default();
        if !user_from_uri(&to_uri).is_empty()
            && user_from_uri(&to_uri) == user_from_uri(&from_uri)
        {
            let from_aor = strip_uri_params(&from_uri);
            let tag = msg.from_tag();
            let mut rebuilt = format!("<{}>", from_aor);
            if let Some(tag) = tag {
                rebuilt.push_str(&format!(";tag={}", tag));
            }
            msg.set("from", &rebuilt);
        }

        let target = binding.source;
        msg.set_request_uri(&clean_contact_uri(&binding.contact));
        msg.add("record-route", &self.record_route_value());

        let branch = gen_branch();
        msg.push_via(&self.via_value(&branch));
        self.branches.insert(
            call_id.clone(),
            BranchEntry {
                branch,
                created_at: epoch_secs(),
            },
        );
        self.dialogs.insert(
            call_id.clone(),
            Dialog {
                caller: peer,
                callee: target,
                created_at: epoch_secs(),
            },
        );

        let mut codec = String::new();
        let mut call_type = "audio";
        if method == Method::INVITE && msg.has_sdp() {
            if let Some(body) = msg.body_str().map(str::to_string) {
                if let Some(info) = crate::sdp::extract_media_info(&body) {
                    codec = info.audio_codecs();
                    if info.video_port.is_some() {
                        call_type = "video";
                    }
                }
                let caller_user = user_from_uri(&from_uri);
                let callee_user = user_from_uri(&to_uri);
                match self.media.process_invite_sdp(
                    &call_id,
                    &body,
                    peer,
                    Some(caller_user.as_str()),
                    Some(callee_user.as_str()),
                ) {
                    Ok(rewritten) => msg.set_body(rewritten.into_bytes()),
                    Err(RelayError::ResourceError { .. }) => {
                        warn!(%call_id, "RTP ports exhausted, refusing call");
                        let resp = self.reply_for(&msg, 503, "Service Unavailable");
                        self.send_reply(resp, peer, &sink);
                        self.dialogs.remove(&call_id);
                        self.branches.remove(&call_id);
                        return;
                    }
                    Err(e) => warn!(%call_id, error = %e, "SDP rewrite failed, forwarding as-is"),
                }
            }
        }

        self.pending.insert(
            call_id.clone(),
            PendingRequest {
                peer,
                sink: sink.clone(),
                created_at: epoch_secs(),
            },
        );

        let user_agent = msg.get("user-agent").unwrap_or("").to_string();
        let cseq = msg.get("cseq").unwrap_or("").to_string();
        match self.forward(&msg, target) {
            Ok(()) => match method {
                Method::INVITE => {
                    self.cdr.on_call_start(
                        &call_id,
                        &from_uri,
                        &to_uri,
                        peer,
                        &target.ip().to_string(),
                        target.port(),
                        call_type,
                        &codec,
                        &user_agent,
                        &cseq,
                    );
                }
                Method::MESSAGE => {
                    let body = msg.body_str().unwrap_or("").to_string();
                    self.cdr.on_message(
                        &format!("{}:{}", call_id, cseq),
                        &from_uri,
                        &to_uri,
                        peer,
                        &body,
                        &user_agent,
                        &cseq,
                    );
                }
                _ => {}
            },
            Err(e) => {
                warn!(%call_id, %target, error = %e, "forward failed");
                self.dialogs.remove(&call_id);
                self.branches.remove(&call_id);
                self.media.end_session(&call_id);
                if let Some((code, reason)) = Self::forward_failure_status(&method, &e) {
                    let resp = self.reply_for(&msg, code, reason);
                    self.send_reply(resp, peer, &sink);
                }
            }
        }
    }

    /// In-dialog requests other than ACK/CANCEL/BYE (re-INVITE, UPDATE, ...)
    fn forward_in_dialog(
        &mut self,
        mut msg: SipMessage,
        method: Method,
        peer: SocketAddr,
        sink: ReplySink,
    ) {
        let call_id = msg.call_id().unwrap_or("").to_string();

        let target = match self.resolve_in_dialog_target(&mut msg, peer) {
            Some(target) => target,
            None => {
                debug!(%call_id, %peer, "no target for in-dialog request, dropping");
                return;
            }
        };

        // a re-INVITE re-anchors the sender leg's media
        if method == Method::INVITE && msg.has_sdp() {
            if let Some(body) = msg.body_str().map(str::to_string) {
                let sender_is_caller = self
                    .dialogs
                    .get(&call_id)
                    .map(|d| d.caller == peer)
                    .unwrap_or(true);
                match self
                    .media
                    .process_reinvite_sdp(&call_id, &body, peer, sender_is_caller)
                {
                    Ok(rewritten) => {
                        msg.set_body(rewritten.into_bytes());
                        let codecs = crate::sdp::extract_media_info(&body)
                            .map(|i| i.audio_codecs())
                            .unwrap_or_default();
                        self.cdr.on_media_change(&call_id, "audio", &codecs);
                    }
                    Err(e) => warn!(%call_id, error = %e, "re-INVITE SDP rewrite failed"),
                }
            }
        }

        let branch = gen_branch();
        msg.push_via(&self.via_value(&branch));
        if method == Method::INVITE {
            if let Some(entry) = self.branches.get_mut(&call_id) {
                entry.branch = branch;
                entry.created_at = epoch_secs();
            }
        }

        self.pending.insert(
            call_id.clone(),
            PendingRequest {
                peer,
                sink,
                created_at: epoch_secs(),
            },
        );

        if let Err(e) = self.forward(&msg, target) {
            warn!(%call_id, %target, error = %e, "in-dialog forward failed");
            if let Some((code, reason)) = Self::forward_failure_status(&method, &e) {
                let resp = self.reply_for(&msg, code, reason);
                if let Some(pending) = self.pending.get(&call_id) {
                    let sink = pending.sink.clone();
                    self.send_reply(resp, peer, &sink);
                }
            }
        }
    }

    /// Target selection for in-dialog requests: Route header, then R-URI,
    /// with stale or loopback URIs re-resolved through the registration store
    fn resolve_in_dialog_target(&mut self, msg: &mut SipMessage, peer: SocketAddr) -> Option<SocketAddr> {
        let call_id = msg.call_id().unwrap_or("").to_string();

        if let Some(route) = msg.top_route() {
            let (host, port) = host_port_from_uri(&header_uri(&route));
            if let Ok(ip) = host.parse::<IpAddr>() {
                let target = SocketAddr::new(ip, port);
                return self.guard_self_loop(&call_id, target, peer);
            }
        }

        let uri = msg.request_uri().unwrap_or("").to_string();
        let (host, port) = host_port_from_uri(&uri);
        let needs_rewrite = uri.contains(";ob") || self.cfg.is_self(&host, port);
        if needs_rewrite {
            let aor = strip_uri_params(&msg.to_uri().unwrap_or_default());
            let binding = self
                .registry
                .active_bindings(&aor)
                .into_iter()
                .find(|b| b.source != peer)?;
            msg.set_request_uri(&clean_contact_uri(&binding.contact));
            return Some(binding.source);
        }

        let ip: IpAddr = host.parse().ok()?;
        let mut target = SocketAddr::new(ip, port);
        if let Some(real) = self.registry.source_for(target) {
            target = real;
        }
        self.guard_self_loop(&call_id, target, peer)
    }

    /// Substitute the dialog's other leg when a hop would loop
    fn guard_self_loop(
        &self,
        call_id: &str,
        target: SocketAddr,
        sender: SocketAddr,
    ) -> Option<SocketAddr> {
        let loops = target == sender || self.cfg.is_self(&target.ip().to_string(), target.port());
        if !loops {
            return Some(target);
        }
        let dialog = self.dialogs.get(call_id)?;
        let other = if sender == dialog.caller {
            dialog.callee
        } else {
            dialog.caller
        };
        if other == sender {
            warn!(%call_id, %target, "loop with no alternative leg, dropping");
            return None;
        }
        debug!(%call_id, %target, substituted = %other, "self-loop guarded");
        Some(other)
    }

    // ----- REGISTER -----------------------------------------------------

    fn handle_register(&mut self, msg: SipMessage, peer: SocketAddr, sink: ReplySink) {
        let authorized = msg
            .get("authorization")
            .map(|a| auth::verify(a, "REGISTER", self.users.as_ref()))
            .unwrap_or(false);
        if !authorized {
            // the 401 is the normal first leg of the handshake, not a failure
            let mut resp = self.reply_for(&msg, 401, "Unauthorized");
            resp.add("www-authenticate", &auth::challenge(&self.cfg.realm));
            self.send_reply(resp, peer, &sink);
            return;
        }

        let aor = strip_uri_params(&msg.to_uri().unwrap_or_default());
        let call_id = msg.call_id().unwrap_or("").to_string();
        let user_agent = msg.get("user-agent").unwrap_or("").to_string();
        let cseq = msg.get("cseq").unwrap_or("").to_string();
        let default_expires: u64 = msg
            .get("expires")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_EXPIRES);

        // each Contact header may carry several comma-separated bindings
        let mut contacts: Vec<(String, u64)> = Vec::new();
        for value in msg.get_all("contact") {
            for entry in split_route_entries(value) {
                let uri = header_uri(&entry);
                let expires = header_param(&entry, "expires")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default_expires);
                contacts.push((uri, expires));
            }
        }

        self.registry.purge_expired(&aor);

        // wildcard de-registration clears the whole AOR
        if contacts.iter().any(|(uri, exp)| uri == "*" && *exp == 0) {
            for binding in self.registry.active_bindings(&aor) {
                self.registry.remove_contact(&aor, &binding.contact);
                self.cdr
                    .on_unregister(&aor, peer, &binding.contact, &call_id, &user_agent, &cseq);
            }
            let resp = self.reply_for(&msg, 200, "OK");
            self.send_reply(resp, peer, &sink);
            return;
        }

        if contacts.iter().any(|(_, expires)| *expires > 0) {
            self.registry.purge_foreign_sources(&aor, peer);
        }

        for (uri, expires) in &contacts {
            // NAT-safe rewrite: the observed source supersedes the URI host
            let user = user_from_uri(uri);
            let rewritten = if user.is_empty() {
                format!("sip:{}", peer)
            } else {
                format!("sip:{}@{}", user, peer)
            };
            if *expires == 0 {
                if self.registry.remove_contact(&aor, &rewritten) {
                    info!(%aor, contact = %rewritten, "binding removed");
                    self.cdr
                        .on_unregister(&aor, peer, &rewritten, &call_id, &user_agent, &cseq);
                }
            } else {
                self.registry.upsert(&aor, &rewritten, *expires, peer);
                info!(%aor, contact = %rewritten, expires, "binding installed");
                self.cdr.on_register(
                    &aor, peer, &rewritten, *expires, 200, &call_id, &user_agent, &cseq,
                );
            }
        }

        let mut resp = self.reply_for(&msg, 200, "OK");
        let now = epoch_secs();
        for binding in self.registry.active_bindings(&aor) {
            resp.add(
                "contact",
                &format!("<{}>;expires={}", binding.contact, binding.remaining(now)),
            );
        }
        self.send_reply(resp, peer, &sink);
    }

    // ----- CANCEL / BYE / ACK ------------------------------------------

    fn handle_cancel(&mut self, mut msg: SipMessage, peer: SocketAddr, sink: ReplySink) {
        let call_id = msg.call_id().unwrap_or("").to_string();

        if let Some(&seen) = self.cancel_seen.get(&call_id) {
            if epoch_secs().saturating_sub(seen) < DEDUP_WINDOW_SECS {
                // absorb the retransmission and placate the UA locally
                let resp = self.reply_for(&msg, 200, "OK");
                self.send_reply(resp, peer, &sink);
                return;
            }
        }

        // the CANCEL must match the INVITE transaction downstream, so the
        // Via branch of the forwarded INVITE is reused and the R-URI is
        // rebuilt exactly like the INVITE's was
        let aor = strip_uri_params(&msg.to_uri().unwrap_or_default());
        if let Some(binding) = self
            .registry
            .active_bindings(&aor)
            .into_iter()
            .find(|b| b.source != peer)
        {
            msg.set_request_uri(&clean_contact_uri(&binding.contact));
        }

        let branch = self
            .branches
            .get(&call_id)
            .map(|e| e.branch.clone())
            .unwrap_or_else(gen_branch);
        msg.push_via(&self.via_value(&branch));

        let target = match self.dialogs.get(&call_id) {
            Some(dialog) => dialog.callee,
            None => {
                let aor_binding = self
                    .registry
                    .active_bindings(&aor)
                    .into_iter()
                    .find(|b| b.source != peer);
                match aor_binding {
                    Some(binding) => binding.source,
                    None => {
                        debug!(%call_id, "CANCEL with no dialog and no binding, dropping");
                        return;
                    }
                }
            }
        };

        let cseq = msg.get("cseq").unwrap_or("").to_string();
        if self.forward(&msg, target).is_ok() {
            self.cancel_seen.insert(call_id.clone(), epoch_secs());
            self.cdr.on_call_cancel(&call_id, &cseq);
        }
    }

    fn handle_bye(&mut self, mut msg: SipMessage, peer: SocketAddr, sink: ReplySink) {
        let call_id = msg.call_id().unwrap_or("").to_string();
        let dedup_key = format!(
            "{}:{}:{}",
            call_id,
            msg.get("cseq").unwrap_or(""),
            peer
        );
        if let Some(&seen) = self.bye_seen.get(&dedup_key) {
            if epoch_secs().saturating_sub(seen) < DEDUP_WINDOW_SECS {
                return;
            }
        }

        // the dialog map guarantees delivery to the other leg even when the
        // UA's Route/R-URI went stale
        let target = match self.dialogs.get(&call_id) {
            Some(dialog) => {
                if peer == dialog.caller {
                    dialog.callee
                } else {
                    dialog.caller
                }
            }
            None => match self.resolve_in_dialog_target(&mut msg, peer) {
                Some(target) => target,
                None => {
                    debug!(%call_id, "BYE with no dialog and no route, dropping");
                    return;
                }
            },
        };

        msg.push_via(&self.via_value(&gen_branch()));
        self.pending.insert(
            call_id.clone(),
            PendingRequest {
                peer,
                sink: sink.clone(),
                created_at: epoch_secs(),
            },
        );

        match self.forward(&msg, target) {
            Ok(()) => {
                self.bye_seen.insert(dedup_key, epoch_secs());
            }
            Err(e) => {
                warn!(%call_id, %target, error = %e, "BYE forward failed");
                if let Some((code, reason)) = Self::forward_failure_status(&Method::BYE, &e) {
                    let resp = self.reply_for(&msg, code, reason);
                    self.send_reply(resp, peer, &sink);
                }
                // drop state so the UA's retransmissions cannot amplify
                if matches!(e, RelayError::TransportError { .. }) {
                    let cseq = msg.get("cseq").unwrap_or("").to_string();
                    self.teardown_call(&call_id);
                    self.cdr.on_call_end(&call_id, "Transport failure", &cseq);
                }
            }
        }
    }

    fn handle_ack(&mut self, mut msg: SipMessage, peer: SocketAddr, popped_self_route: bool) {
        let call_id = msg.call_id().unwrap_or("").to_string();
        let dedup_key = format!(
            "{}:{}:{}",
            call_id,
            msg.get("cseq").unwrap_or(""),
            peer
        );
        if let Some(&seen) = self.ack_seen.get(&dedup_key) {
            if epoch_secs().saturating_sub(seen) < DEDUP_WINDOW_SECS {
                return;
            }
        }

        // 2xx-ACK or non-2xx-ACK: the recorded final status decides; when
        // state is already gone, a self-addressed Route plus a To tag is the
        // telltale of a 2xx-ACK
        let is_2xx_ack = match self.last_final_status.get(&call_id) {
            Some(status) => status.starts_with('2'),
            None => popped_self_route && msg.to_tag().is_some(),
        };

        if is_2xx_ack {
            self.handle_2xx_ack(msg, peer, dedup_key);
        } else {
            self.handle_non_2xx_ack(msg, peer, dedup_key);
        }
    }

    fn handle_2xx_ack(&mut self, mut msg: SipMessage, peer: SocketAddr, dedup_key: String) {
        let call_id = msg.call_id().unwrap_or("").to_string();

        // the ACK must chase the 200 OK's Contact
        if let Some(contact) = self.last_2xx_contact.get(&call_id) {
            if msg.request_uri() != Some(contact.as_str()) {
                msg.set_request_uri(&contact.clone());
            }
        }

        let branch = self
            .branches
            .get(&call_id)
            .map(|e| e.branch.clone())
            .unwrap_or_else(gen_branch);
        msg.push_via(&self.via_value(&branch));

        let target = match self.dialogs.get(&call_id) {
            Some(dialog) => {
                let other = if peer == dialog.caller {
                    dialog.callee
                } else {
                    dialog.caller
                };
                Some(other)
            }
            None => {
                // state already cleaned: fall back to Route, then R-URI,
                // then the registration store
                let candidate = msg
                    .top_route()
                    .map(|r| header_uri(&r))
                    .or_else(|| msg.request_uri().map(str::to_string))
                    .map(|uri| host_port_from_uri(&uri));
                match candidate {
                    Some((host, port)) if !self.cfg.is_self(&host, port) => host
                        .parse::<IpAddr>()
                        .ok()
                        .map(|ip| SocketAddr::new(ip, port)),
                    _ => {
                        let aor = strip_uri_params(&msg.to_uri().unwrap_or_default());
                        self.registry
                            .active_bindings(&aor)
                            .into_iter()
                            .find(|b| b.source != peer)
                            .map(|b| b.source)
                    }
                }
            }
        };

        let target = match target.and_then(|t| self.guard_self_loop(&call_id, t, peer)) {
            Some(target) => target,
            None => {
                debug!(%call_id, "2xx-ACK unroutable, dropping");
                return;
            }
        };

        if self.forward(&msg, target).is_ok() {
            self.ack_seen.insert(dedup_key, epoch_secs());
        }
    }

    fn handle_non_2xx_ack(&mut self, mut msg: SipMessage, peer: SocketAddr, dedup_key: String) {
        let call_id = msg.call_id().unwrap_or("").to_string();

        // R-URI stays untouched; the Via stack must replay the INVITE's so
        // the downstream transaction engine matches the ACK to its INVITE
        let branch = self
            .branches
            .get(&call_id)
            .map(|e| e.branch.clone())
            .unwrap_or_else(gen_branch);
        msg.push_via(&self.via_value(&branch));

        let target = match self.dialogs.get(&call_id) {
            Some(dialog) => Some(dialog.callee),
            None => {
                let aor = strip_uri_params(&msg.to_uri().unwrap_or_default());
                self.registry
                    .active_bindings(&aor)
                    .into_iter()
                    .find(|b| b.source != peer)
                    .map(|b| b.source)
            }
        };
        let target = match target {
            Some(target) => target,
            None => {
                debug!(%call_id, "non-2xx ACK unroutable, dropping");
                return;
            }
        };

        if self.forward(&msg, target).is_ok() {
            self.ack_seen.insert(dedup_key, epoch_secs());
            // the failed INVITE transaction is complete
            self.dialogs.remove(&call_id);
            self.branches.remove(&call_id);
            self.last_final_status.remove(&call_id);
            self.last_2xx_contact.remove(&call_id);
            self.media.end_session(&call_id);
        }
    }

    // ----- response pipeline -------------------------------------------

    fn handle_response(&mut self, mut msg: SipMessage, peer: SocketAddr) {
        let call_id = msg.call_id().unwrap_or("").to_string();
        let status = match msg.status_code() {
            Some(status) => status,
            None => return,
        };

        // only responses to requests we forwarded carry our Via on top
        let top = match msg.top_via() {
            Some(top) => top,
            None => return,
        };
        let (via_host, via_port) = via_sent_by(&top);
        if !self.cfg.is_self(&via_host, via_port) {
            debug!(%call_id, status, "response top Via is not ours, dropping");
            return;
        }

        // the proxy emits its own 100s; loop-indicator statuses would cascade
        if status == 100 {
            return;
        }
        if matches!(status, 482 | 483 | 502 | 503 | 504) {
            warn!(%call_id, status, "suppressing loop-indicator response");
            return;
        }

        msg.pop_via();

        let next_hop = match msg.top_via() {
            Some(via) => {
                let (host, port) = via_sent_by(&via);
                let host = header_param(&via, "received").unwrap_or(host);
                let port = header_param(&via, "rport")
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or(port);
                host.parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, port))
            }
            None => self.pending.get(&call_id).map(|p| p.peer),
        };
        let mut next_hop = match next_hop {
            Some(next) => next,
            None => {
                debug!(%call_id, status, "response has no next hop, dropping");
                return;
            }
        };

        if let Some(real) = self.registry.source_for(next_hop) {
            next_hop = real;
        }
        let next_hop = match self.guard_self_loop(&call_id, next_hop, peer) {
            Some(next) => next,
            None => return,
        };

        let cseq_method = msg.cseq().map(|(_, method)| method);
        let reason = msg.reason_phrase().unwrap_or("").to_string();
        let cseq_raw = msg.get("cseq").unwrap_or("").to_string();

        match cseq_method {
            Some(Method::INVITE) => {
                if status >= 200 {
                    self.last_final_status
                        .insert(call_id.clone(), status.to_string());
                }
                if (200..300).contains(&status) {
                    // make the 2xx-ACK land on our real listening address
                    // even when the advertised host points elsewhere
                    let local_route = format!(
                        "<sip:{}:{};lr>",
                        self.cfg.server_ip,
                        self.cfg.bind_addr.port()
                    );
                    msg.remove_all("record-route");
                    msg.add("record-route", &local_route);
                    msg.push_front("route", &local_route);

                    if let Some(contact) = msg.contact_uri() {
                        self.last_2xx_contact
                            .insert(call_id.clone(), strip_uri_params(&contact));
                    }

                    let mut codec = String::new();
                    let mut call_type = "audio";
                    if msg.has_sdp() {
                        if let Some(body) = msg.body_str().map(str::to_string) {
                            if let Some(info) = crate::sdp::extract_media_info(&body) {
                                codec = info.audio_codecs();
                                if info.video_port.is_some() {
                                    call_type = "video";
                                }
                            }
                            if self.cfg.media_mode == MediaMode::Relay {
                                if let Some(rewritten) =
                                    self.media.process_answer_sdp(&call_id, &body, peer)
                                {
                                    msg.set_body(rewritten.into_bytes());
                                }
                                self.media.start_forwarding(&call_id);
                            } else {
                                let rewritten = crate::sdp::rewrite_sdp_ip(
                                    &body,
                                    &peer.ip().to_string(),
                                );
                                msg.set_body(rewritten.into_bytes());
                            }
                        }
                    }
                    self.cdr
                        .on_call_answer(&call_id, peer, call_type, &codec, status, &reason);
                } else if status >= 300 && status != 487 {
                    self.cdr
                        .on_call_fail(&call_id, status, &reason, "final response");
                }
                // 486/487/488/6xx keep Dialog and Branch alive for the ACK
            }
            Some(Method::BYE) => {
                if (200..300).contains(&status) {
                    // one atomic teardown step
                    self.teardown_call(&call_id);
                    self.cdr.on_call_end(&call_id, "Normal", &cseq_raw);
                }
            }
            Some(Method::CANCEL) => {
                // branch retained: the 487 and its ACK are still in flight
            }
            _ => {}
        }

        let bytes = msg.to_bytes();
        self.tracker
            .record(&msg, Direction::Fwd, Some(peer), Some(next_hop));
        let send_result = match self.pending.get(&call_id) {
            Some(pending) if pending.peer == next_hop => pending.sink.send(&bytes, next_hop),
            _ => self.outbound.send(&bytes, next_hop),
        };
        if let Err(e) = send_result {
            warn!(%call_id, status, %next_hop, error = %e, "response forward failed");
        }
    }

    // ----- timer sweeps -------------------------------------------------

    fn sweep_registrations(&mut self) {
        let purged = self.registry.purge_expired_all();
        if !purged.is_empty() {
            info!(count = purged.len(), "expired registrations purged");
        }
    }

    fn sweep_dialogs(&mut self) {
        let now = epoch_secs();
        let stale: Vec<String> = self
            .dialogs
            .iter()
            .filter(|(_, d)| now.saturating_sub(d.created_at) > DIALOG_TIMEOUT_SECS)
            .map(|(call_id, _)| call_id.clone())
            .collect();
        for call_id in stale {
            warn!(%call_id, "reaping stale dialog");
            self.teardown_call(&call_id);
        }
    }

    fn sweep_branches(&mut self) {
        let now = epoch_secs();
        self.branches
            .retain(|_, e| now.saturating_sub(e.created_at) <= BRANCH_TTL_SECS);
        self.cancel_seen
            .retain(|_, &mut t| now.saturating_sub(t) <= DEDUP_WINDOW_SECS);
        self.ack_seen
            .retain(|_, &mut t| now.saturating_sub(t) <= DEDUP_WINDOW_SECS);
        self.bye_seen
            .retain(|_, &mut t| now.saturating_sub(t) <= DEDUP_WINDOW_SECS);
    }

    fn sweep_pending(&mut self) {
        let now = epoch_secs();
        self.pending
            .retain(|_, p| now.saturating_sub(p.created_at) <= PENDING_TTL_SECS);
    }

    /// OPTIONS ping plus CRLF heartbeat toward every NATed binding
    fn nat_keepalive(&mut self) {
        for (aor, bindings) in self.registry.snapshot() {
            for binding in bindings {
                if binding.source.ip().is_loopback() {
                    continue;
                }
                let mut options = SipMessage::request(&Method::OPTIONS, &binding.contact);
                options.push_via(&self.via_value(&gen_branch()));
                options.set("max-forwards", "70");
                options.add(
                    "from",
                    &format!(
                        "<sip:keepalive@{}>;tag={}",
                        self.cfg.advertised_host,
                        gen_tag()
                    ),
                );
                options.add("to", &format!("<{}>", binding.contact));
                options.add("call-id", &gen_call_id(&self.cfg.advertised_host));
                options.add("cseq", "1 OPTIONS");
                options.add("allow", ALLOWED_METHODS);
                options.add("content-length", "0");

                let bytes = options.to_bytes();
                if self.outbound.send(&bytes, binding.source).is_ok() {
                    self.tracker.record(
                        &options,
                        Direction::Tx,
                        Some(self.cfg.bind_addr),
                        Some(binding.source),
                    );
                }
                let _ = self.outbound.send(b"\r\n", binding.source);
                debug!(%aor, target = %binding.source, "NAT keepalive sent");
            }
        }
    }

    fn shutdown(&mut self) {
        info!("core shutting down");
        let live: Vec<String> = self.dialogs.keys().cloned().collect();
        for call_id in live {
            self.cdr.on_call_end(&call_id, "Shutdown", "");
        }
        self.media.end_all_sessions();
        self.dialogs.clear();
        self.branches.clear();
        self.pending.clear();
    }

    // ----- helpers ------------------------------------------------------

    /// All call-state for one Call-ID goes away in a single step
    fn teardown_call(&mut self, call_id: &str) {
        self.dialogs.remove(call_id);
        self.branches.remove(call_id);
        self.last_final_status.remove(call_id);
        self.last_2xx_contact.remove(call_id);
        self.media.end_session(call_id);
    }

    /// Status code owed to the upstream UA when a forward fails
    ///
    /// Unreachable transport maps per method (nothing for ACK/CANCEL, 408
    /// for BYE, 480 otherwise); any other runtime failure is a 502.
    fn forward_failure_status(method: &Method, error: &RelayError) -> Option<(u16, &'static str)> {
        match error {
            RelayError::TransportError { .. } => match method {
                Method::ACK | Method::CANCEL => None,
                Method::BYE => Some((408, "Request Timeout")),
                _ => Some((480, "Temporarily Unavailable")),
            },
            _ => Some((502, "Bad Gateway")),
        }
    }

    fn via_value(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={};rport",
            self.cfg.advertised_host, self.cfg.advertised_port, branch
        )
    }

    fn record_route_value(&self) -> String {
        format!(
            "<sip:{}:{};lr>",
            self.cfg.advertised_host, self.cfg.advertised_port
        )
    }

    fn reply_for(&self, req: &SipMessage, code: u16, reason: &str) -> SipMessage {
        let mut resp = SipMessage::response_to(req, code, reason);
        // locally generated final responses own the To tag
        if code >= 200 && resp.to_tag().is_none() {
            if let Some(to) = resp.get("to").map(str::to_string) {
                resp.set("to", &format!("{};tag={}", to, gen_tag()));
            }
        }
        resp
    }

    fn send_reply(&self, resp: SipMessage, peer: SocketAddr, sink: &ReplySink) {
        let bytes = resp.to_bytes();
        self.tracker
            .record(&resp, Direction::Tx, Some(self.cfg.bind_addr), Some(peer));
        if let Err(e) = sink.send(&bytes, peer) {
            warn!(%peer, error = %e, "reply send failed");
        }
    }

    fn forward(&self, msg: &SipMessage, target: SocketAddr) -> RelayResult<()> {
        let bytes = msg.to_bytes();
        self.tracker
            .record(msg, Direction::Fwd, Some(self.cfg.bind_addr), Some(target));
        self.outbound.send(&bytes, target)
    }

    // ----- read-only accessors for external collaborators ---------------

    pub fn registrations(&self) -> Vec<(String, Vec<crate::registry::Binding>)> {
        self.registry.snapshot()
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn failure_count(&self, ip: IpAddr) -> u64 {
        self.failure_counts.get(&ip).copied().unwrap_or(0)
    }

    pub fn media_stats(&self, call_id: &str) -> Option<crate::media::SessionStats> {
        self.media.session_stats(call_id)
    }

    pub fn tracker(&self) -> &Arc<MessageTracker> {
        &self.tracker
    }

    #[doc(hidden)]
    pub fn has_dialog(&self, call_id: &str) -> bool {
        self.dialogs.contains_key(call_id)
    }

    #[doc(hidden)]
    pub fn has_branch(&self, call_id: &str) -> bool {
        self.branches.contains_key(call_id)
    }

    #[doc(hidden)]
    pub fn has_media_session(&self, call_id: &str) -> bool {
        self.media.session(call_id).is_some()
    }

    /// Rewind per-call timestamps so sweep behavior is testable
    #[cfg(test)]
    fn age_call_state(&mut self, call_id: &str, secs: u64) {
        if let Some(dialog) = self.dialogs.get_mut(call_id) {
            dialog.created_at = dialog.created_at.saturating_sub(secs);
        }
        if let Some(entry) = self.branches.get_mut(call_id) {
            entry.created_at = entry.created_at.saturating_sub(secs);
        }
        if let Some(seen) = self.cancel_seen.get_mut(call_id) {
            *seen = seen.saturating_sub(secs);
        }
    }
}

/// host:port out of a Via entry's sent-by
fn via_sent_by(via: &str) -> (String, u16) {
    let after_proto = via.split_whitespace().nth(1).unwrap_or("");
    let sent_by = after_proto.split(';').next().unwrap_or("");
    match sent_by.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(5060),
        ),
        None => (sent_by.to_string(), 5060),
    }
}

/// Strip routing artifacts (`;ob`, `;transport=`) off a contact URI
fn clean_contact_uri(uri: &str) -> String {
    uri.split(';')
        .enumerate()
        .filter(|(i, part)| {
            *i == 0 || !(part.trim() == "ob" || part.trim_start().starts_with("transport="))
        })
        .map(|(_, part)| part)
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{digest_response, MemoryUserDirectory};
    use crate::cdr::NullCdr;
    use std::sync::mpsc::Receiver;

    #[test]
    fn test_via_sent_by() {
        assert_eq!(
            via_sent_by("SIP/2.0/UDP 10.0.0.1:5062;branch=z9hG4bK1;rport"),
            ("10.0.0.1".to_string(), 5062)
        );
        assert_eq!(
            via_sent_by("SIP/2.0/UDP proxy.example.com;branch=z9hG4bK2"),
            ("proxy.example.com".to_string(), 5060)
        );
    }

    #[test]
    fn test_clean_contact_uri() {
        assert_eq!(
            clean_contact_uri("sip:1001@10.0.0.11:5062;ob;transport=udp"),
            "sip:1001@10.0.0.11:5062"
        );
        assert_eq!(
            clean_contact_uri("sip:1001@10.0.0.11:5062;user=phone"),
            "sip:1001@10.0.0.11:5062;user=phone"
        );
    }

    fn make_core(rtp_start: u16) -> (Core, ReplySink, Receiver<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink = ReplySink::Channel(tx);
        let cfg = RelayConfig {
            bind_addr: "127.0.0.1:5060".parse().unwrap(),
            advertised_host: "127.0.0.1".to_string(),
            server_ip: "127.0.0.1".to_string(),
            rtp_port_start: rtp_start,
            rtp_port_end: rtp_start + 20,
            ..Default::default()
        };
        let mut users = MemoryUserDirectory::new();
        users.insert("1001", "pw1001");
        users.insert("1002", "pw1002");
        let core = Core::new(
            cfg,
            Arc::new(users),
            Arc::new(NullCdr),
            Arc::new(MessageTracker::new(100)),
            sink.clone(),
        );
        (core, sink, rx)
    }

    fn push(core: &mut Core, sink: &ReplySink, text: &str, peer: &str) {
        let bytes = text.replace('\n', "\r\n").into_bytes();
        core.handle_datagram(&bytes, peer.parse().unwrap(), sink.clone());
    }

    fn drain(rx: &Receiver<(Vec<u8>, SocketAddr)>) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn register(core: &mut Core, sink: &ReplySink, rx: &Receiver<(Vec<u8>, SocketAddr)>, user: &str, peer: &str) {
        push(
            core,
            sink,
            &format!(
                "REGISTER sip:sip.local SIP/2.0\n\
Via: SIP/2.0/UDP {peer};branch=z9hG4bK-r1;rport\n\
Max-Forwards: 70\n\
From: <sip:{user}@sip.local>;tag=r1\n\
To: <sip:{user}@sip.local>\n\
Call-ID: reg-{user}\n\
CSeq: 1 REGISTER\n\
Contact: <sip:{user}@{peer}>\n\
Expires: 3600\n\
Content-Length: 0\n\n",
            ),
            peer,
        );
        let sent = drain(rx);
        let challenge = SipMessage::parse(&sent[0].0).unwrap();
        let value = challenge.get("www-authenticate").unwrap();
        let nonce = header_param(&value.replace(", ", ";"), "nonce").unwrap();
        let response = digest_response(
            user,
            "sip.local",
            &format!("pw{}", user),
            "REGISTER",
            "sip:sip.local",
            &nonce,
        );
        push(
            core,
            sink,
            &format!(
                "REGISTER sip:sip.local SIP/2.0\n\
Via: SIP/2.0/UDP {peer};branch=z9hG4bK-r2;rport\n\
Max-Forwards: 70\n\
From: <sip:{user}@sip.local>;tag=r2\n\
To: <sip:{user}@sip.local>\n\
Call-ID: reg-{user}\n\
CSeq: 2 REGISTER\n\
Contact: <sip:{user}@{peer}>\n\
Expires: 3600\n\
Authorization: Digest username=\"{user}\", realm=\"sip.local\", nonce=\"{nonce}\", uri=\"sip:sip.local\", response=\"{response}\", algorithm=MD5\n\
Content-Length: 0\n\n",
            ),
            peer,
        );
        drain(rx);
    }

    fn start_call(
        core: &mut Core,
        sink: &ReplySink,
        rx: &Receiver<(Vec<u8>, SocketAddr)>,
        call_id: &str,
        a_peer: &str,
    ) {
        push(
            core,
            sink,
            &format!(
                "INVITE sip:1002@sip.local SIP/2.0\n\
Via: SIP/2.0/UDP {a_peer};branch=z9hG4bK-i1;rport\n\
Max-Forwards: 70\n\
From: <sip:1001@sip.local>;tag=a\n\
To: <sip:1002@sip.local>\n\
Call-ID: {call_id}\n\
CSeq: 1 INVITE\n\
Contact: <sip:1001@{a_peer}>\n\
Content-Length: 0\n\n",
            ),
            a_peer,
        );
        drain(rx);
    }

    #[test]
    fn test_stale_dialog_swept() {
        let (mut core, sink, rx) = make_core(28000);
        register(&mut core, &sink, &rx, "1001", "127.0.0.1:6062");
        register(&mut core, &sink, &rx, "1002", "127.0.0.1:6063");
        start_call(&mut core, &sink, &rx, "sweep-1", "127.0.0.1:6062");
        assert!(core.has_dialog("sweep-1"));

        core.handle_event(CoreEvent::SweepDialogs);
        assert!(core.has_dialog("sweep-1"), "fresh dialog must survive");

        core.age_call_state("sweep-1", DIALOG_TIMEOUT_SECS + 60);
        core.handle_event(CoreEvent::SweepDialogs);
        assert!(!core.has_dialog("sweep-1"));
    }

    #[test]
    fn test_branch_entries_expire() {
        let (mut core, sink, rx) = make_core(28020);
        register(&mut core, &sink, &rx, "1001", "127.0.0.1:6072");
        register(&mut core, &sink, &rx, "1002", "127.0.0.1:6073");
        start_call(&mut core, &sink, &rx, "sweep-2", "127.0.0.1:6072");
        assert!(core.has_branch("sweep-2"));

        core.handle_event(CoreEvent::SweepBranches);
        assert!(core.has_branch("sweep-2"));

        core.age_call_state("sweep-2", BRANCH_TTL_SECS + 5);
        core.handle_event(CoreEvent::SweepBranches);
        assert!(!core.has_branch("sweep-2"));
    }

    #[test]
    fn test_cancel_dedup_expires_with_sweep() {
        let (mut core, sink, rx) = make_core(28040);
        register(&mut core, &sink, &rx, "1001", "127.0.0.1:6082");
        register(&mut core, &sink, &rx, "1002", "127.0.0.1:6083");
        start_call(&mut core, &sink, &rx, "sweep-3", "127.0.0.1:6082");

        let cancel = "CANCEL sip:1002@sip.local SIP/2.0\n\
Via: SIP/2.0/UDP 127.0.0.1:6082;branch=z9hG4bK-i1;rport\n\
Max-Forwards: 70\n\
From: <sip:1001@sip.local>;tag=a\n\
To: <sip:1002@sip.local>\n\
Call-ID: sweep-3\n\
CSeq: 1 CANCEL\n\
Content-Length: 0\n\n";
        push(&mut core, &sink, cancel, "127.0.0.1:6082");
        let first = drain(&rx);
        assert_eq!(first.len(), 1, "CANCEL forwarded downstream");
        assert_eq!(first[0].1, "127.0.0.1:6083".parse::<SocketAddr>().unwrap());

        // inside the window the retransmission is answered locally
        push(&mut core, &sink, cancel, "127.0.0.1:6082");
        let second = drain(&rx);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1, "127.0.0.1:6082".parse::<SocketAddr>().unwrap());

        // after the sweep the entry is gone and a late CANCEL flows again
        core.age_call_state("sweep-3", DEDUP_WINDOW_SECS + 5);
        core.handle_event(CoreEvent::SweepBranches);
        push(&mut core, &sink, cancel, "127.0.0.1:6082");
        let third = drain(&rx);
        assert_eq!(third[0].1, "127.0.0.1:6083".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_nat_keepalive_pings_nonlocal_bindings() {
        let (mut core, sink, rx) = make_core(28060);
        // loopback binding: skipped
        register(&mut core, &sink, &rx, "1001", "127.0.0.1:6092");
        // NATed binding: pinged
        register(&mut core, &sink, &rx, "1002", "192.0.2.44:6093");

        core.handle_event(CoreEvent::NatKeepalive);
        let sent = drain(&rx);
        assert_eq!(sent.len(), 2, "one OPTIONS and one CRLF heartbeat");

        let nated: SocketAddr = "192.0.2.44:6093".parse().unwrap();
        let options = SipMessage::parse(&sent[0].0).unwrap();
        assert_eq!(sent[0].1, nated);
        assert_eq!(options.method(), Some(Method::OPTIONS));
        assert_eq!(
            options.request_uri(),
            Some("sip:1002@192.0.2.44:6093")
        );
        assert_eq!(sent[1].0, b"\r\n".to_vec());
        assert_eq!(sent[1].1, nated);

        // a fresh Call-ID every round
        core.handle_event(CoreEvent::NatKeepalive);
        let again = drain(&rx);
        let options2 = SipMessage::parse(&again[0].0).unwrap();
        assert_ne!(options.call_id(), options2.call_id());
    }

    #[test]
    fn test_locally_generated_final_responses_carry_to_tag() {
        let (mut core, sink, rx) = make_core(28080);
        push(
            &mut core,
            &sink,
            "INVITE sip:5555@sip.local SIP/2.0\n\
Via: SIP/2.0/UDP 127.0.0.1:6102;branch=z9hG4bK-x;rport\n\
Max-Forwards: 70\n\
From: <sip:1001@sip.local>;tag=a\n\
To: <sip:5555@sip.local>\n\
Call-ID: tag-test\n\
CSeq: 1 INVITE\n\
Content-Length: 0\n\n",
            "127.0.0.1:6102",
        );
        let sent = drain(&rx);
        let resp = SipMessage::parse(&sent[0].0).unwrap();
        assert_eq!(resp.status_code(), Some(480));
        assert!(resp.to_tag().is_some());
        assert_eq!(resp.from_tag().as_deref(), Some("a"));
    }
}
