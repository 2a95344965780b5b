//! Runtime configuration for the proxy and media relay

use crate::allocator::{RTP_PORT_END, RTP_PORT_START};
use crate::limits::ParserLimits;
use std::net::SocketAddr;

/// How the relay treats media for new calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMode {
    /// Allocate relay ports, rewrite both legs' SDP and forward RTP
    Relay,
    /// Rewrite only the SDP address to the signaling source; no forwarders.
    /// Fragile across dissimilar NATs, kept for direct-media deployments.
    Passthrough,
}

/// Proxy configuration
///
/// `advertised_host` goes into Via and Record-Route and may be a public
/// hostname in front of the server; `server_ip` is what gets written into
/// rewritten SDP; `bind_addr` is the actual listening socket.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub advertised_host: String,
    pub advertised_port: u16,
    pub server_ip: String,
    pub realm: String,
    pub media_mode: MediaMode,
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,
    /// Downgrade SRTP offers to plain RTP when rewriting SDP
    pub force_plain_rtp: bool,
    pub tracker_capacity: usize,
    /// Parser DoS limits applied to every inbound message
    pub parser_limits: ParserLimits,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".parse().unwrap(),
            advertised_host: "127.0.0.1".to_string(),
            advertised_port: 5060,
            server_ip: "127.0.0.1".to_string(),
            realm: "sip.local".to_string(),
            media_mode: MediaMode::Relay,
            rtp_port_start: RTP_PORT_START,
            rtp_port_end: RTP_PORT_END,
            force_plain_rtp: false,
            tracker_capacity: 10_000,
            parser_limits: ParserLimits::default(),
        }
    }
}

impl RelayConfig {
    /// `host:port` the proxy announces in Via and Record-Route
    pub fn advertised_addr(&self) -> String {
        format!("{}:{}", self.advertised_host, self.advertised_port)
    }

    /// True when a host:port names this server
    pub fn is_self(&self, host: &str, port: u16) -> bool {
        let bind_ip = self.bind_addr.ip();
        let named = host == self.advertised_host
            || host == self.server_ip
            || (!bind_ip.is_unspecified()
                && host.parse::<std::net::IpAddr>().ok() == Some(bind_ip));
        named && (port == self.advertised_port || port == self.bind_addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_self_matches_advertised_and_server_ip() {
        let cfg = RelayConfig {
            advertised_host: "proxy.example.com".to_string(),
            server_ip: "203.0.113.5".to_string(),
            ..Default::default()
        };
        assert!(cfg.is_self("proxy.example.com", 5060));
        assert!(cfg.is_self("203.0.113.5", 5060));
        assert!(!cfg.is_self("proxy.example.com", 5080));
        assert!(!cfg.is_self("other.example.com", 5060));
    }
}
