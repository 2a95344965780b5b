//! SDP handling for the B2BUA media path
//!
//! The relay never terminates media, so SDP handling stays deliberately
//! narrow: extract the connection address, media ports and rtpmap entries,
//! and rewrite `c=`/`m=` lines while leaving every other line untouched.
//! The transport token (`RTP/AVP`, `RTP/SAVP`) and payload list pass through
//! verbatim so SRTP endpoints keep negotiating end to end.

/// Media addressing extracted from an SDP body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    /// Session-level `c=` address
    pub connection_ip: Option<String>,
    pub audio_port: Option<u16>,
    pub audio_payloads: Vec<String>,
    /// Media-level `c=` under `m=audio`, overrides the session-level one
    pub audio_connection_ip: Option<String>,
    pub video_port: Option<u16>,
    pub video_payloads: Vec<String>,
    pub video_connection_ip: Option<String>,
    /// `a=rtpmap` payload type to `name/rate` mappings
    pub rtpmap: Vec<(u8, String)>,
}

impl MediaInfo {
    /// Effective audio address: media-level `c=` wins over session-level
    pub fn audio_addr(&self) -> Option<(String, u16)> {
        let ip = self
            .audio_connection_ip
            .clone()
            .or_else(|| self.connection_ip.clone())?;
        Some((ip, self.audio_port?))
    }

    /// Effective video address
    pub fn video_addr(&self) -> Option<(String, u16)> {
        let ip = self
            .video_connection_ip
            .clone()
            .or_else(|| self.connection_ip.clone())?;
        Some((ip, self.video_port?))
    }

    /// Codec names for the payload types of one media line
    fn codec_list(&self, payloads: &[String]) -> String {
        let mut names = Vec::new();
        for pt in payloads {
            if let Ok(n) = pt.parse::<u8>() {
                if let Some((_, codec)) = self.rtpmap.iter().find(|(p, _)| *p == n) {
                    let name = codec.split('/').next().unwrap_or(codec);
                    names.push(format!("{}/{}", name, n));
                    continue;
                }
                if let Some(name) = static_codec_name(n) {
                    names.push(format!("{}/{}", name, n));
                }
            }
        }
        names.join(", ")
    }

    pub fn audio_codecs(&self) -> String {
        self.codec_list(&self.audio_payloads)
    }

    pub fn video_codecs(&self) -> String {
        self.codec_list(&self.video_payloads)
    }

    /// Compact `ip:port audio, ip:port video` summary for observability
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some((ip, port)) = self.audio_addr() {
            parts.push(format!("{}:{} audio", ip, port));
        }
        if let Some((ip, port)) = self.video_addr() {
            parts.push(format!("{}:{} video", ip, port));
        }
        parts.join(", ")
    }
}

enum MediaSection {
    None,
    Audio,
    Video,
    Other,
}

/// Extract media addressing from an SDP body
///
/// Returns `None` when the body carries no audio media line.
pub fn extract_media_info(sdp: &str) -> Option<MediaInfo> {
    if sdp.is_empty() {
        return None;
    }
    let mut info = MediaInfo::default();
    let mut section = MediaSection::None;

    for raw in sdp.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("c=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 && parts[1] == "IP4" {
                match section {
                    MediaSection::Audio => info.audio_connection_ip = Some(parts[2].to_string()),
                    MediaSection::Video => info.video_connection_ip = Some(parts[2].to_string()),
                    MediaSection::None => info.connection_ip = Some(parts[2].to_string()),
                    MediaSection::Other => {}
                }
            }
        } else if line.starts_with("m=audio ") {
            section = MediaSection::Audio;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                if let Ok(port) = parts[1].parse::<u16>() {
                    info.audio_port = Some(port);
                    info.audio_payloads = parts[3..].iter().map(|s| s.to_string()).collect();
                }
            }
        } else if line.starts_with("m=video ") {
            section = MediaSection::Video;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                if let Ok(port) = parts[1].parse::<u16>() {
                    info.video_port = Some(port);
                    info.video_payloads = parts[3..].iter().map(|s| s.to_string()).collect();
                }
            }
        } else if line.starts_with("m=") {
            section = MediaSection::Other;
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, char::is_whitespace);
            if let (Some(pt), Some(codec)) = (parts.next(), parts.next()) {
                if let Ok(pt) = pt.parse::<u8>() {
                    info.rtpmap.push((pt, codec.trim().to_string()));
                }
            }
        }
    }

    if info.audio_port.is_some() {
        Some(info)
    } else {
        None
    }
}

/// Rewrite the SDP toward the relay
///
/// Every `c=IN IP4` line gets `new_ip`; the `m=audio` port becomes
/// `audio_port` and the `m=video` port becomes `video_port` when given. All
/// other lines pass through untouched. With `force_plain_rtp` the transport
/// token is downgraded to `RTP/AVP` and `a=crypto:`/`a=fingerprint:` lines
/// are dropped, which breaks SRTP endpoints; the default keeps the original
/// transport so ciphertext is forwarded opaquely.
pub fn rewrite_sdp(
    sdp: &str,
    new_ip: &str,
    audio_port: u16,
    video_port: Option<u16>,
    force_plain_rtp: bool,
) -> String {
    if sdp.is_empty() {
        return sdp.to_string();
    }
    let mut out: Vec<String> = Vec::new();

    for raw in sdp.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("c=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 && parts[1] == "IP4" {
                out.push(format!("c=IN IP4 {}", new_ip));
                continue;
            }
        } else if line.starts_with("m=audio ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                let proto = if force_plain_rtp { "RTP/AVP" } else { parts[2] };
                out.push(format!(
                    "m=audio {} {} {}",
                    audio_port,
                    proto,
                    parts[3..].join(" ")
                ));
                continue;
            }
        } else if line.starts_with("m=video ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                if let Some(port) = video_port {
                    let proto = if force_plain_rtp { "RTP/AVP" } else { parts[2] };
                    out.push(format!(
                        "m=video {} {} {}",
                        port,
                        proto,
                        parts[3..].join(" ")
                    ));
                    continue;
                }
            }
        } else if force_plain_rtp
            && (line.starts_with("a=crypto:") || line.starts_with("a=fingerprint:"))
        {
            continue;
        }
        out.push(line.to_string());
    }

    out.join("\r\n") + "\r\n"
}

/// Rewrite only the connection address (passthrough media mode)
pub fn rewrite_sdp_ip(sdp: &str, new_ip: &str) -> String {
    if sdp.is_empty() {
        return sdp.to_string();
    }
    let mut out: Vec<String> = Vec::new();
    for raw in sdp.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("c=") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 3 && parts[1] == "IP4" {
                out.push(format!("c=IN IP4 {}", new_ip));
                continue;
            }
        }
        out.push(line.to_string());
    }
    out.join("\r\n") + "\r\n"
}

fn static_codec_name(payload_type: u8) -> Option<&'static str> {
    match payload_type {
        0 => Some("PCMU"),
        8 => Some("PCMA"),
        9 => Some("G722"),
        18 => Some("G729"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
o=- 123 456 IN IP4 10.0.0.11\r\n\
s=call\r\n\
c=IN IP4 10.0.0.11\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n";

    const SDP_AV: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.11\r\n\
s=-\r\n\
c=IN IP4 10.0.0.11\r\n\
t=0 0\r\n\
m=audio 40000 RTP/SAVP 0\r\n\
a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:abc\r\n\
m=video 42000 RTP/AVP 96\r\n\
c=IN IP4 10.0.0.99\r\n\
a=rtpmap:96 H264/90000\r\n";

    #[test]
    fn test_extract_media_info() {
        let info = extract_media_info(SDP).unwrap();
        assert_eq!(info.connection_ip.as_deref(), Some("10.0.0.11"));
        assert_eq!(info.audio_port, Some(40000));
        assert_eq!(info.audio_payloads, vec!["0", "8"]);
        assert_eq!(info.audio_addr(), Some(("10.0.0.11".to_string(), 40000)));
        assert_eq!(info.rtpmap.len(), 2);
        assert_eq!(info.audio_codecs(), "PCMU/0, PCMA/8");
    }

    #[test]
    fn test_media_level_connection_overrides_session() {
        let info = extract_media_info(SDP_AV).unwrap();
        assert_eq!(info.video_connection_ip.as_deref(), Some("10.0.0.99"));
        assert_eq!(info.video_addr(), Some(("10.0.0.99".to_string(), 42000)));
        assert_eq!(info.audio_addr(), Some(("10.0.0.11".to_string(), 40000)));
    }

    #[test]
    fn test_no_audio_means_no_media_info() {
        assert!(extract_media_info("v=0\r\ns=-\r\n").is_none());
        assert!(extract_media_info("").is_none());
    }

    #[test]
    fn test_rewrite_replaces_ip_and_port_only() {
        let rewritten = rewrite_sdp(SDP, "203.0.113.5", 20000, None, false);
        assert!(rewritten.contains("c=IN IP4 203.0.113.5\r\n"));
        assert!(rewritten.contains("m=audio 20000 RTP/AVP 0 8\r\n"));
        // payloads and rtpmap untouched
        assert!(rewritten.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(rewritten.ends_with("\r\n"));
    }

    #[test]
    fn test_rewrite_preserves_savp_and_crypto_by_default() {
        let rewritten = rewrite_sdp(SDP_AV, "203.0.113.5", 20000, Some(20002), false);
        assert!(rewritten.contains("m=audio 20000 RTP/SAVP 0"));
        assert!(rewritten.contains("a=crypto:1"));
        assert!(rewritten.contains("m=video 20002 RTP/AVP 96"));
        // both c= lines rewritten
        assert_eq!(rewritten.matches("c=IN IP4 203.0.113.5").count(), 2);
    }

    #[test]
    fn test_force_plain_rtp_downgrades() {
        let rewritten = rewrite_sdp(SDP_AV, "203.0.113.5", 20000, Some(20002), true);
        assert!(rewritten.contains("m=audio 20000 RTP/AVP 0"));
        assert!(!rewritten.contains("a=crypto:"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite_sdp(SDP, "203.0.113.5", 20000, None, false);
        let twice = rewrite_sdp(&once, "203.0.113.5", 20000, None, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_ip_only_keeps_ports() {
        let rewritten = rewrite_sdp_ip(SDP, "198.51.100.7");
        assert!(rewritten.contains("c=IN IP4 198.51.100.7"));
        assert!(rewritten.contains("m=audio 40000 RTP/AVP 0 8"));
    }

    #[test]
    fn test_lf_only_sdp_normalized_to_crlf() {
        let lf = "v=0\nc=IN IP4 10.0.0.1\nm=audio 5004 RTP/AVP 0\n";
        let rewritten = rewrite_sdp(lf, "10.1.1.1", 6000, None, false);
        assert!(rewritten.contains("c=IN IP4 10.1.1.1\r\n"));
        assert!(rewritten.contains("m=audio 6000 RTP/AVP 0\r\n"));
    }
}
