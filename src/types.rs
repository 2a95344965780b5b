//! Common types and helpers used throughout the proxy

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use strum_macros::{Display, EnumString};

/// SIP URI schemes as defined in RFC 3261
#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString, Default)]
pub enum Scheme {
    #[default]
    #[strum(serialize = "sip")]
    SIP,
    #[strum(serialize = "sips")]
    SIPS,
    #[strum(serialize = "tel")]
    TEL,
}

/// SIP methods as defined in RFC 3261 and extensions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Method {
    INVITE,
    ACK,
    OPTIONS,
    BYE,
    CANCEL,
    REGISTER,
    PRACK,     // RFC 3262
    SUBSCRIBE, // RFC 6665
    NOTIFY,    // RFC 6665
    REFER,     // RFC 3515
    MESSAGE,   // RFC 3428
    UPDATE,    // RFC 3311
    #[strum(default)]
    UNKNOWN(String),
}

impl Method {
    /// Methods the proxy forwards; anything else is answered 405
    pub fn is_supported(&self) -> bool {
        !matches!(self, Method::UNKNOWN(_))
    }
}

/// The Allow list advertised in OPTIONS replies and 405 responses
pub const ALLOWED_METHODS: &str =
    "INVITE, ACK, CANCEL, BYE, OPTIONS, PRACK, UPDATE, REFER, NOTIFY, SUBSCRIBE, MESSAGE, REGISTER";

/// Seconds since the Unix epoch
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a Via branch parameter with the RFC 3261 magic cookie
pub fn gen_branch() -> String {
    format!("z9hG4bK-{}", rand_alnum(10))
}

/// Generate a From/To tag
pub fn gen_tag() -> String {
    rand_alnum(8)
}

/// Generate a Call-ID for proxy-originated requests (NAT keepalive OPTIONS)
pub fn gen_call_id(host: &str) -> String {
    format!("{}@{}", rand_alnum(16), host)
}

fn rand_alnum(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// Extract host and port from a SIP URI, defaulting the port to 5060
///
/// `sip:1002@192.168.1.60:5066;transport=udp` -> `("192.168.1.60", 5066)`
/// `sip:1002@192.168.1.60` -> `("192.168.1.60", 5060)`
pub fn host_port_from_uri(uri: &str) -> (String, u16) {
    let mut u = uri.trim();
    if let Some(rest) = u.strip_prefix("sips:") {
        u = rest;
    } else if let Some(rest) = u.strip_prefix("sip:") {
        u = rest;
    }
    if let Some(at) = u.find('@') {
        u = &u[at + 1..];
    }
    if let Some(semi) = u.find(';') {
        u = &u[..semi];
    }
    if let Some(colon) = u.rfind(':') {
        let (host, port_str) = u.split_at(colon);
        if let Ok(port) = port_str[1..].parse::<u16>() {
            return (host.to_string(), port);
        }
        return (host.to_string(), 5060);
    }
    (u.to_string(), 5060)
}

/// Extract the user part of a SIP URI, empty when the URI has no user
pub fn user_from_uri(uri: &str) -> String {
    let mut u = uri.trim();
    if let Some(rest) = u.strip_prefix("sips:") {
        u = rest;
    } else if let Some(rest) = u.strip_prefix("sip:") {
        u = rest;
    }
    match u.find('@') {
        Some(at) => u[..at].split(';').next().unwrap_or("").to_string(),
        None => String::new(),
    }
}

/// Strip URI parameters, keeping `scheme:user@host[:port]`
pub fn strip_uri_params(uri: &str) -> String {
    match uri.find(';') {
        Some(semi) => uri[..semi].to_string(),
        None => uri.to_string(),
    }
}
