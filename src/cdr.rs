//! Call-detail-record collaborator interface
//!
//! The CDR writer lives outside the core; the proxy only fires these
//! callbacks and never waits on them. Every method has an empty default so
//! implementers override just what they record.

use std::net::SocketAddr;

/// Fire-and-forget call/registration event sink
#[allow(clippy::too_many_arguments)]
pub trait CdrSink: Send + Sync {
    fn on_register(
        &self,
        _aor: &str,
        _source: SocketAddr,
        _contact: &str,
        _expires: u64,
        _status_code: u16,
        _call_id: &str,
        _user_agent: &str,
        _cseq: &str,
    ) {
    }

    fn on_unregister(
        &self,
        _aor: &str,
        _source: SocketAddr,
        _contact: &str,
        _call_id: &str,
        _user_agent: &str,
        _cseq: &str,
    ) {
    }

    fn on_call_start(
        &self,
        _call_id: &str,
        _caller_uri: &str,
        _callee_uri: &str,
        _caller_addr: SocketAddr,
        _callee_ip: &str,
        _callee_port: u16,
        _call_type: &str,
        _codec: &str,
        _user_agent: &str,
        _cseq: &str,
    ) {
    }

    fn on_call_answer(
        &self,
        _call_id: &str,
        _callee_addr: SocketAddr,
        _call_type: &str,
        _codec: &str,
        _status_code: u16,
        _status_text: &str,
    ) {
    }

    fn on_call_end(&self, _call_id: &str, _termination_reason: &str, _cseq: &str) {}

    fn on_call_fail(&self, _call_id: &str, _status_code: u16, _status_text: &str, _reason: &str) {}

    fn on_call_cancel(&self, _call_id: &str, _cseq: &str) {}

    fn on_message(
        &self,
        _call_id_plus_cseq: &str,
        _caller_uri: &str,
        _callee_uri: &str,
        _caller_addr: SocketAddr,
        _message_body: &str,
        _user_agent: &str,
        _cseq: &str,
    ) {
    }

    fn on_media_change(&self, _call_id: &str, _new_call_type: &str, _new_codec: &str) {}
}

/// Sink that drops every event
pub struct NullCdr;

impl CdrSink for NullCdr {}
