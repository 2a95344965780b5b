//! SIP message codec
//!
//! Parses RFC 3261 messages into a start line, an ordered multimap of
//! lowercased header names to raw values, and an opaque body. The proxy
//! mutates messages in place (Via push/pop, R-URI rewrite, Route handling),
//! so headers keep their arrival order and serialization restores canonical
//! casing from a fixed table.

use crate::error::{RelayError, RelayResult};
use crate::limits::ParserLimits;
use crate::types::Method;

const CRLF: &str = "\r\n";

/// A parsed SIP message
#[derive(Debug, Clone, PartialEq)]
pub struct SipMessage {
    start_line: String,
    /// (lowercased name, raw value), in arrival order
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SipMessage {
    /// Parse a complete message from a datagram or a framed TCP segment
    pub fn parse(data: &[u8]) -> RelayResult<Self> {
        Self::parse_with_limits(data, &ParserLimits::default())
    }

    /// Parse with explicit limits
    pub fn parse_with_limits(data: &[u8], limits: &ParserLimits) -> RelayResult<Self> {
        if data.len() > limits.max_message_size {
            return Err(RelayError::parse_error(
                format!(
                    "Message size {} exceeds maximum {}",
                    data.len(),
                    limits.max_message_size
                ),
                None,
                Some("Message too large".to_string()),
            ));
        }

        let (head, body_raw) = split_head_body(data)?;
        let head_str = std::str::from_utf8(head).map_err(|_| {
            RelayError::parse_error("Header section is not valid UTF-8", None, None)
        })?;

        let mut lines = unfold_lines(head_str);
        if lines.is_empty() {
            return Err(RelayError::parse_error("Missing start line", None, None));
        }
        let start_line = lines.remove(0);
        if start_line.trim().is_empty() {
            return Err(RelayError::parse_error("Missing start line", None, None));
        }
        if start_line.len() > limits.max_start_line_length {
            return Err(RelayError::parse_error(
                "Start line too long",
                Some((1, 0)),
                None,
            ));
        }

        let is_request = !start_line.starts_with("SIP/");
        if is_request {
            let mut parts = start_line.split_whitespace();
            // methods are short uppercase tokens
            let method = parts.next().unwrap_or("");
            if method.is_empty()
                || method.len() > 32
                || !method.bytes().all(|b| b.is_ascii_uppercase())
            {
                return Err(RelayError::parse_error(
                    format!("Invalid method: {}", method),
                    Some((1, 0)),
                    None,
                ));
            }
            if parts.next().is_none() || !parts.next().map_or(false, |v| v.starts_with("SIP/")) {
                return Err(RelayError::parse_error(
                    format!("Malformed request line: {}", start_line),
                    Some((1, 0)),
                    None,
                ));
            }
        }

        let mut headers: Vec<(String, String)> = Vec::with_capacity(lines.len());
        for line in &lines {
            if line.is_empty() {
                continue;
            }
            if line.len() > limits.max_header_line_length {
                return Err(RelayError::parse_error(
                    "Header line too long",
                    None,
                    Some("DoS protection".to_string()),
                ));
            }
            let colon = line.find(':').ok_or_else(|| {
                RelayError::parse_error("No colon in header line", None, Some(line.clone()))
            })?;
            let raw_name = line[..colon].trim();
            if !is_header_token(raw_name) {
                return Err(RelayError::parse_error(
                    format!("Invalid header name: {}", raw_name),
                    None,
                    None,
                ));
            }
            // unfolding already removed CRLFs; strip any other control bytes
            let value: String = line[colon + 1..]
                .trim()
                .chars()
                .filter(|&c| c == '\t' || !c.is_control())
                .collect();
            let name = expand_compact_header(&raw_name.to_lowercase()).to_string();
            headers.push((name, value));
            if headers.len() > limits.max_headers {
                return Err(RelayError::parse_error(
                    format!("Too many headers: exceeds maximum {}", limits.max_headers),
                    None,
                    Some("DoS protection".to_string()),
                ));
            }
        }

        let mut msg = SipMessage {
            start_line,
            headers,
            body: Vec::new(),
        };

        // The body length comes from Content-Length; a datagram may carry
        // trailing padding, a short read is a malformed message.
        let declared = msg.content_length()?;
        match declared {
            Some(len) => {
                if body_raw.len() < len {
                    return Err(RelayError::parse_error(
                        format!("Truncated body: have {}, need {}", body_raw.len(), len),
                        None,
                        None,
                    ));
                }
                msg.body = body_raw[..len].to_vec();
            }
            None => {
                msg.body = body_raw.to_vec();
            }
        }
        if msg.body.len() > limits.max_body_size {
            return Err(RelayError::parse_error(
                "Body too large",
                None,
                Some("DoS protection".to_string()),
            ));
        }

        Ok(msg)
    }

    /// Start a new request
    pub fn request(method: &Method, uri: &str) -> Self {
        SipMessage {
            start_line: format!("{} {} SIP/2.0", method, uri),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a response copying the dialog-identifying headers of `req`
    pub fn response_to(req: &SipMessage, code: u16, reason: &str) -> Self {
        let mut resp = SipMessage {
            start_line: format!("SIP/2.0 {} {}", code, reason),
            headers: Vec::new(),
            body: Vec::new(),
        };
        for name in ["via", "from", "to", "call-id", "cseq"] {
            for value in req.get_all(name) {
                resp.add(name, value);
            }
        }
        resp.add("content-length", "0");
        resp
    }

    /// Serialize with canonical header casing, CRLF line endings
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.start_line.len() + self.headers.len() * 32 + 4);
        out.push_str(&self.start_line);
        out.push_str(CRLF);
        for (name, value) in &self.headers {
            out.push_str(&canonical_name(name));
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        !self.start_line.starts_with("SIP/")
    }

    /// Request method from the start line
    pub fn method(&self) -> Option<Method> {
        if !self.is_request() {
            return None;
        }
        self.start_line
            .split_whitespace()
            .next()
            .and_then(|m| m.parse::<Method>().ok())
    }

    /// Response status code from the status line
    pub fn status_code(&self) -> Option<u16> {
        if self.is_request() {
            return None;
        }
        self.start_line
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
    }

    /// Response reason phrase
    pub fn reason_phrase(&self) -> Option<&str> {
        if self.is_request() {
            return None;
        }
        let mut parts = self.start_line.splitn(3, ' ');
        parts.next()?;
        parts.next()?;
        parts.next()
    }

    /// The R-URI of a request
    pub fn request_uri(&self) -> Option<&str> {
        if !self.is_request() {
            return None;
        }
        self.start_line.split_whitespace().nth(1)
    }

    /// Overwrite the R-URI, keeping method and version
    pub fn set_request_uri(&mut self, uri: &str) {
        if let (Some(method), Some(version)) = (
            self.start_line.split_whitespace().next(),
            self.start_line.split_whitespace().nth(2),
        ) {
            self.start_line = format!("{} {} {}", method, uri, version);
        }
    }

    /// First header value by (case-insensitive) name
    pub fn get(&self, name: &str) -> Option<&str> {
        let lname = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == lname)
            .map(|(_, v)| v.as_str())
    }

    /// All header values by name, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let lname = name.to_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| *n == lname)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Append a header at the end
    pub fn add(&mut self, name: &str, value: &str) {
        self.headers
            .push((name.to_lowercase(), value.to_string()));
    }

    /// Replace the first occurrence of a header, appending if absent
    pub fn set(&mut self, name: &str, value: &str) {
        let lname = name.to_lowercase();
        if let Some(entry) = self.headers.iter_mut().find(|(n, _)| *n == lname) {
            entry.1 = value.to_string();
        } else {
            self.headers.push((lname, value.to_string()));
        }
    }

    /// Insert a header ahead of its first namesake (or at the very top)
    pub fn push_front(&mut self, name: &str, value: &str) {
        let lname = name.to_lowercase();
        let pos = self
            .headers
            .iter()
            .position(|(n, _)| *n == lname)
            .unwrap_or(0);
        self.headers.insert(pos, (lname, value.to_string()));
    }

    /// Remove every header with the given name
    pub fn remove_all(&mut self, name: &str) {
        let lname = name.to_lowercase();
        self.headers.retain(|(n, _)| *n != lname);
    }

    pub fn header_count(&self, name: &str) -> usize {
        let lname = name.to_lowercase();
        self.headers.iter().filter(|(n, _)| *n == lname).count()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Option<&str> {
        if self.body.is_empty() {
            None
        } else {
            std::str::from_utf8(&self.body).ok()
        }
    }

    /// Replace the body and keep Content-Length in sync
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.set("content-length", &body.len().to_string());
        self.body = body;
    }

    /// Declared Content-Length; `Err` on a negative or unparseable value
    pub fn content_length(&self) -> RelayResult<Option<usize>> {
        match self.get("content-length") {
            None => Ok(None),
            Some(raw) => {
                let n: i64 = raw.trim().parse().map_err(|_| {
                    RelayError::parse_error(
                        format!("Invalid Content-Length: {}", raw),
                        None,
                        None,
                    )
                })?;
                if n < 0 {
                    return Err(RelayError::parse_error(
                        format!("Negative Content-Length: {}", n),
                        None,
                        None,
                    ));
                }
                Ok(Some(n as usize))
            }
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("call-id")
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, Method)> {
        let raw = self.get("cseq")?;
        let mut parts = raw.split_whitespace();
        let seq = parts.next()?.parse::<u32>().ok()?;
        let method = parts.next()?.parse::<Method>().ok()?;
        Some((seq, method))
    }

    pub fn has_sdp(&self) -> bool {
        if self.body.is_empty() {
            return false;
        }
        self.get("content-type")
            .map(|ct| ct.to_lowercase().contains("sdp"))
            .unwrap_or_else(|| self.body.starts_with(b"v="))
    }

    // --- Via handling ---------------------------------------------------

    /// All Via entries across headers, comma-carried ones split out
    pub fn vias(&self) -> Vec<String> {
        let mut out = Vec::new();
        for value in self.get_all("via") {
            out.extend(split_via_entries(value));
        }
        out
    }

    /// The topmost Via entry
    pub fn top_via(&self) -> Option<String> {
        self.get("via").and_then(|v| split_via_entries(v).into_iter().next())
    }

    pub fn via_count(&self) -> usize {
        self.vias().len()
    }

    /// Insert a new topmost Via header
    pub fn push_via(&mut self, value: &str) {
        let pos = self
            .headers
            .iter()
            .position(|(n, _)| n == "via")
            .unwrap_or(0);
        self.headers
            .insert(pos, ("via".to_string(), value.to_string()));
    }

    /// Remove and return the topmost Via entry, rejoining any entries that
    /// shared its carrier header value
    pub fn pop_via(&mut self) -> Option<String> {
        let pos = self.headers.iter().position(|(n, _)| n == "via")?;
        let mut entries = split_via_entries(&self.headers[pos].1);
        if entries.is_empty() {
            self.headers.remove(pos);
            return None;
        }
        let top = entries.remove(0);
        if entries.is_empty() {
            self.headers.remove(pos);
        } else {
            self.headers[pos].1 = entries.join(",");
        }
        Some(top)
    }

    // --- Route handling -------------------------------------------------

    /// The topmost Route entry
    pub fn top_route(&self) -> Option<String> {
        self.get("route")
            .and_then(|v| split_route_entries(v).into_iter().next())
    }

    pub fn route_count(&self) -> usize {
        self.get_all("route")
            .iter()
            .map(|v| split_route_entries(v).len())
            .sum()
    }

    /// Remove and return the topmost Route entry
    pub fn pop_route(&mut self) -> Option<String> {
        let pos = self.headers.iter().position(|(n, _)| n == "route")?;
        let mut entries = split_route_entries(&self.headers[pos].1);
        if entries.is_empty() {
            self.headers.remove(pos);
            return None;
        }
        let top = entries.remove(0);
        if entries.is_empty() {
            self.headers.remove(pos);
        } else {
            self.headers[pos].1 = entries.join(", ");
        }
        Some(top)
    }

    // --- Address header helpers ----------------------------------------

    /// URI from the To header
    pub fn to_uri(&self) -> Option<String> {
        self.get("to").map(header_uri)
    }

    /// URI from the From header
    pub fn from_uri(&self) -> Option<String> {
        self.get("from").map(header_uri)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.get("to").and_then(|v| header_param(v, "tag"))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.get("from").and_then(|v| header_param(v, "tag"))
    }

    /// URI from the first Contact header
    pub fn contact_uri(&self) -> Option<String> {
        self.get("contact").map(header_uri)
    }
}

/// Split the head (start line + headers) from the body
///
/// Tolerates LF-only messages; the CRLF separator is preferred.
fn split_head_body(data: &[u8]) -> RelayResult<(&[u8], &[u8])> {
    if let Some(pos) = find_subslice(data, b"\r\n\r\n") {
        return Ok((&data[..pos], &data[pos + 4..]));
    }
    if let Some(pos) = find_subslice(data, b"\n\n") {
        return Ok((&data[..pos], &data[pos + 2..]));
    }
    Err(RelayError::parse_error(
        "No blank line terminating headers",
        None,
        None,
    ))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split the head into lines, joining folded continuations with a space
fn unfold_lines(head: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(line.trim_start());
        } else {
            out.push(line.to_string());
        }
    }
    out
}

/// Header names must be RFC 3261 tokens
fn is_header_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~'
                )
        })
}

/// Expand RFC 3261 compact header names to their full form
fn expand_compact_header(name: &str) -> &str {
    match name {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "m" => "contact",
        "i" => "call-id",
        "e" => "content-encoding",
        "l" => "content-length",
        "c" => "content-type",
        "r" => "refer-to",
        "b" => "referred-by",
        "k" => "supported",
        "o" => "event",        // RFC 3265
        "u" => "allow-events", // RFC 3265
        "x" => "session-expires",
        "s" => "subject",
        _ => name,
    }
}

/// Restore RFC 3261 canonical casing for a lowercased header name
pub fn canonical_name(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        "max-forwards" => "Max-Forwards".to_string(),
        "content-type" => "Content-Type".to_string(),
        "content-length" => "Content-Length".to_string(),
        "record-route" => "Record-Route".to_string(),
        "contact" => "Contact".to_string(),
        "user-agent" => "User-Agent".to_string(),
        "allow" => "Allow".to_string(),
        "supported" => "Supported".to_string(),
        "require" => "Require".to_string(),
        "proxy-require" => "Proxy-Require".to_string(),
        "proxy-authorization" => "Proxy-Authorization".to_string(),
        "authorization" => "Authorization".to_string(),
        "from" => "From".to_string(),
        "to" => "To".to_string(),
        "via" => "Via".to_string(),
        "route" => "Route".to_string(),
        "rseq" => "RSeq".to_string(),
        "rack" => "RAck".to_string(),
        other => other
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Split a Via header value into its entries
///
/// Parameter values may contain commas, so splitting on `,` alone is wrong.
/// Each entry begins with the `SIP/2.0` token; the value is cut at the comma
/// immediately preceding every token after the first.
pub fn split_via_entries(value: &str) -> Vec<String> {
    let lower = value.to_lowercase();
    let bytes = lower.as_bytes();
    let mut starts: Vec<usize> = Vec::new();
    let mut search = 0;
    while let Some(found) = lower[search..].find("sip/2.0") {
        let pos = search + found;
        let bounded = pos == 0 || !bytes[pos - 1].is_ascii_alphanumeric();
        if bounded {
            starts.push(pos);
        }
        search = pos + 7;
    }
    if starts.is_empty() {
        return vec![value.trim().to_string()];
    }

    let mut entries = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = if i + 1 < starts.len() {
            // cut at the separating comma before the next token
            value[start..starts[i + 1]]
                .rfind(',')
                .map(|off| start + off)
                .unwrap_or(starts[i + 1])
        } else {
            value.len()
        };
        entries.push(value[start..end].trim().to_string());
    }
    entries
}

/// Split a Route/Record-Route value at top-level commas (not inside `<>`)
pub fn split_route_entries(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in value.char_indices() {
        match ch {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let entry = value[start..i].trim();
                if !entry.is_empty() {
                    entries.push(entry.to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        entries.push(tail.to_string());
    }
    entries
}

/// Extract the URI from an address header value
///
/// `"Alice" <sip:alice@example.com>;tag=1` -> `sip:alice@example.com`
pub fn header_uri(value: &str) -> String {
    if let (Some(lt), Some(gt)) = (value.find('<'), value.find('>')) {
        if gt > lt {
            return value[lt + 1..gt].to_string();
        }
    }
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Extract a `name=value` parameter from a header value, unquoting it
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let prefix = format!("{}=", name.to_lowercase());
    for part in value.split(';') {
        let part = part.trim();
        if part.to_lowercase().starts_with(&prefix) {
            let raw = part[prefix.len()..].trim();
            let unquoted = if raw.starts_with('"') && raw.ends_with('"') && raw.len() > 1 {
                &raw[1..raw.len() - 1]
            } else {
                raw
            };
            return Some(unquoted.to_string());
        }
    }
    None
}

/// Length of the first complete message in a TCP stream buffer
///
/// `Ok(None)` until the blank line arrives; afterwards the total is
/// `header_bytes + 4 + Content-Length`, whether or not the body bytes are
/// buffered yet. A negative Content-Length poisons the connection.
pub fn frame_length(buf: &[u8]) -> RelayResult<Option<usize>> {
    let pos = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let head = &buf[..pos];
    let mut content_length: i64 = 0;
    for line in head.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("");
        let lower = line.to_lowercase();
        if let Some(rest) = lower.strip_prefix("content-length:") {
            content_length = rest.trim().trim_end_matches('\r').parse().map_err(|_| {
                RelayError::parse_error("Invalid Content-Length in stream", None, None)
            })?;
        } else if let Some(rest) = lower.strip_prefix("l:") {
            content_length = rest.trim().trim_end_matches('\r').parse().map_err(|_| {
                RelayError::parse_error("Invalid Content-Length in stream", None, None)
            })?;
        }
    }
    if content_length < 0 {
        return Err(RelayError::parse_error(
            "Negative Content-Length in stream",
            None,
            None,
        ));
    }
    Ok(Some(pos + 4 + content_length as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_sip_message(msg: &str) -> String {
        msg.replace('\n', "\r\n")
    }

    const INVITE: &str = "INVITE sip:1002@sip.local SIP/2.0\n\
Via: SIP/2.0/UDP 10.0.0.11:5062;branch=z9hG4bK776asdhds;rport\n\
Max-Forwards: 70\n\
From: <sip:1001@sip.local>;tag=1928301774\n\
To: <sip:1002@sip.local>\n\
Call-ID: a84b4c76e66710\n\
CSeq: 314159 INVITE\n\
Contact: <sip:1001@10.0.0.11:5062>\n\
Content-Length: 0\n\
\n";

    #[test]
    fn test_parse_request_basics() {
        let msg = SipMessage::parse(to_sip_message(INVITE).as_bytes()).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(Method::INVITE));
        assert_eq!(msg.request_uri(), Some("sip:1002@sip.local"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710"));
        assert_eq!(msg.cseq(), Some((314159, Method::INVITE)));
        assert_eq!(msg.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.via_count(), 1);
    }

    #[test]
    fn test_serialize_round_trip_preserves_order_and_casing() {
        let msg = SipMessage::parse(to_sip_message(INVITE).as_bytes()).unwrap();
        let bytes = msg.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("Call-ID: a84b4c76e66710"));
        assert!(text.contains("CSeq: 314159 INVITE"));
        assert!(text.contains("Max-Forwards: 70"));
        let reparsed = SipMessage::parse(&bytes).unwrap();
        assert_eq!(reparsed, msg);
        assert_eq!(reparsed.to_bytes(), bytes);
    }

    #[test]
    fn test_lf_only_message_accepted() {
        let msg = SipMessage::parse(INVITE.as_bytes()).unwrap();
        assert_eq!(msg.call_id(), Some("a84b4c76e66710"));
    }

    #[test]
    fn test_compact_headers_expanded() {
        let raw = to_sip_message(
            "INVITE sip:b@h SIP/2.0\n\
v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\n\
f: <sip:a@h>;tag=1\n\
t: <sip:b@h>\n\
i: compact-call\n\
CSeq: 1 INVITE\n\
l: 0\n\
\n",
        );
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.call_id(), Some("compact-call"));
        assert_eq!(msg.via_count(), 1);
        assert_eq!(msg.content_length().unwrap(), Some(0));
    }

    #[test]
    fn test_folded_header_unfolded() {
        let raw = "OPTIONS sip:h SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
Subject: first part\r\n continued here\r\n\
Call-ID: folded\r\nCSeq: 1 OPTIONS\r\n\r\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.get("subject"), Some("first part continued here"));
    }

    #[test]
    fn test_missing_start_line_rejected() {
        assert!(SipMessage::parse(b"\r\nVia: SIP/2.0/UDP h\r\n\r\n").is_err());
    }

    #[test]
    fn test_lowercase_method_rejected() {
        assert!(SipMessage::parse(b"invite sip:b@h SIP/2.0\r\nCall-ID: x\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"IN VITE sip:b@h SIP/2.0\r\nCall-ID: x\r\n\r\n").is_err());
    }

    #[test]
    fn test_header_name_must_be_token() {
        assert!(SipMessage::parse(
            b"OPTIONS sip:h SIP/2.0\r\nBad Header: value\r\n\r\n"
        )
        .is_err());
        assert!(SipMessage::parse(
            b"OPTIONS sip:h SIP/2.0\r\nX-Custom.Header: value\r\n\r\n"
        )
        .is_ok());
    }

    #[test]
    fn test_control_bytes_stripped_from_values() {
        let msg = SipMessage::parse(
            b"OPTIONS sip:h SIP/2.0\r\nSubject: be\x00fore\x01after\r\nCall-ID: x\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.get("subject"), Some("beforeafter"));
    }

    #[test]
    fn test_strict_limits_enforced() {
        let limits = ParserLimits::strict();
        let mut big = String::from("OPTIONS sip:h SIP/2.0\r\n");
        big.push_str(&format!("Subject: {}\r\n", "x".repeat(3000)));
        big.push_str("Call-ID: x\r\n\r\n");
        assert!(SipMessage::parse_with_limits(big.as_bytes(), &limits).is_err());
        assert!(SipMessage::parse(big.as_bytes()).is_ok());

        let oversized = vec![b'x'; limits.max_message_size + 1];
        assert!(SipMessage::parse_with_limits(&oversized, &limits).is_err());
    }

    #[test]
    fn test_missing_blank_line_rejected() {
        assert!(SipMessage::parse(b"INVITE sip:b@h SIP/2.0\r\nCall-ID: x\r\n").is_err());
    }

    #[test]
    fn test_negative_content_length_rejected() {
        let raw = "INVITE sip:b@h SIP/2.0\r\nCall-ID: x\r\nContent-Length: -5\r\n\r\n";
        assert!(SipMessage::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let raw = "INVITE sip:b@h SIP/2.0\r\nCall-ID: x\r\nContent-Length: 100\r\n\r\nshort";
        assert!(SipMessage::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_body_truncated_to_declared_length() {
        let raw = "MESSAGE sip:b@h SIP/2.0\r\nCall-ID: x\r\nContent-Length: 5\r\n\r\nhellotrailing";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.body(), b"hello");
    }

    #[test]
    fn test_split_via_entries_with_comma_in_params() {
        let value = "SIP/2.0/UDP a.com;branch=z9hG4bK1;received=1.2.3.4, \
SIP/2.0/TCP b.com:5061;branch=z9hG4bK2;maddr=x,y";
        let entries = split_via_entries(value);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("SIP/2.0/UDP a.com"));
        assert!(entries[1].ends_with("maddr=x,y"));
    }

    #[test]
    fn test_pop_via_rejoins_remaining_entries() {
        let raw = to_sip_message(
            "SIP/2.0 200 OK\n\
Via: SIP/2.0/UDP proxy.example.com;branch=z9hG4bK1, SIP/2.0/UDP client.example.com;branch=z9hG4bK2\n\
Call-ID: x\nCSeq: 1 INVITE\n\n",
        );
        let mut msg = SipMessage::parse(raw.as_bytes()).unwrap();
        let top = msg.pop_via().unwrap();
        assert!(top.contains("proxy.example.com"));
        assert_eq!(msg.via_count(), 1);
        assert!(msg.top_via().unwrap().contains("client.example.com"));
        assert!(msg.pop_via().is_some());
        assert_eq!(msg.via_count(), 0);
    }

    #[test]
    fn test_push_via_lands_on_top() {
        let mut msg = SipMessage::parse(to_sip_message(INVITE).as_bytes()).unwrap();
        msg.push_via("SIP/2.0/UDP proxy:5060;branch=z9hG4bKnew;rport");
        assert!(msg.top_via().unwrap().contains("z9hG4bKnew"));
        assert_eq!(msg.via_count(), 2);
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        let first_via = text.lines().find(|l| l.starts_with("Via:")).unwrap();
        assert!(first_via.contains("z9hG4bKnew"));
    }

    #[test]
    fn test_route_split_and_pop() {
        let raw = to_sip_message(
            "BYE sip:b@h SIP/2.0\n\
Route: <sip:proxy1:5060;lr>, <sip:proxy2:5060;lr>\n\
Call-ID: x\nCSeq: 2 BYE\n\n",
        );
        let mut msg = SipMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.route_count(), 2);
        assert_eq!(msg.pop_route().unwrap(), "<sip:proxy1:5060;lr>");
        assert_eq!(msg.top_route().unwrap(), "<sip:proxy2:5060;lr>");
    }

    #[test]
    fn test_header_uri_and_param() {
        assert_eq!(
            header_uri("\"Alice\" <sip:alice@example.com>;tag=abc"),
            "sip:alice@example.com"
        );
        assert_eq!(header_uri("sip:bob@example.com;tag=x"), "sip:bob@example.com");
        assert_eq!(
            header_param("Alice <sip:alice@example.com>;tag=abc123", "tag").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            header_param("Digest realm=\"sip.local\"", "realm").as_deref(),
            Some("sip.local")
        );
        assert_eq!(header_param("<sip:a@h>", "tag"), None);
    }

    #[test]
    fn test_response_to_copies_dialog_headers() {
        let req = SipMessage::parse(to_sip_message(INVITE).as_bytes()).unwrap();
        let resp = SipMessage::response_to(&req, 100, "Trying");
        assert!(!resp.is_request());
        assert_eq!(resp.status_code(), Some(100));
        assert_eq!(resp.call_id(), Some("a84b4c76e66710"));
        assert_eq!(resp.get("via"), req.get("via"));
        assert_eq!(resp.get("content-length"), Some("0"));
    }

    #[test]
    fn test_set_body_updates_content_length() {
        let mut msg = SipMessage::request(&Method::MESSAGE, "sip:b@h");
        msg.add("call-id", "x");
        msg.set_body(b"hello world".to_vec());
        assert_eq!(msg.get("content-length"), Some("11"));
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn test_frame_length() {
        assert_eq!(frame_length(b"INVITE sip:b@h SIP/2.0\r\nCall-ID").unwrap(), None);
        let framed = b"INVITE sip:b@h SIP/2.0\r\nContent-Length: 4\r\n\r\nbody extra";
        let head_len = framed
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        assert_eq!(frame_length(framed).unwrap(), Some(head_len + 4));
        assert!(frame_length(b"X sip:b SIP/2.0\r\nContent-Length: -1\r\n\r\n").is_err());
    }

    #[test]
    fn test_canonical_name_table() {
        assert_eq!(canonical_name("call-id"), "Call-ID");
        assert_eq!(canonical_name("cseq"), "CSeq");
        assert_eq!(canonical_name("www-authenticate"), "WWW-Authenticate");
        assert_eq!(canonical_name("rack"), "RAck");
        assert_eq!(canonical_name("x-custom-header"), "X-Custom-Header");
    }
}
