//! RFC 2617 digest authentication for REGISTER
//!
//! The challenge is stateless: a fresh nonce is generated per 401 and is not
//! tracked for staleness on the next round, matching the permissiveness of
//! RFC 3261 §22. Users whose status is not ACTIVE are treated as absent.

use rand::RngCore;

/// Account status in the user directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Active,
    Locked,
    Disabled,
}

/// A directory entry
#[derive(Debug, Clone)]
pub struct UserEntry {
    pub password: String,
    pub status: UserStatus,
}

/// The external username -> credentials lookup
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, username: &str) -> Option<UserEntry>;
}

/// In-memory directory for the standalone binary and tests
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: std::collections::HashMap<String, UserEntry>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, username: &str, password: &str) {
        self.users.insert(
            username.to_string(),
            UserEntry {
                password: password.to_string(),
                status: UserStatus::Active,
            },
        );
    }

    pub fn insert_with_status(&mut self, username: &str, password: &str, status: UserStatus) {
        self.users.insert(
            username.to_string(),
            UserEntry {
                password: password.to_string(),
                status,
            },
        );
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn lookup(&self, username: &str) -> Option<UserEntry> {
        self.users.get(username).cloned()
    }
}

/// Generate a nonce of 16 random bytes, hex encoded
pub fn gen_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the WWW-Authenticate value for a 401 challenge
pub fn challenge(realm: &str) -> String {
    format!(
        "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
        realm,
        gen_nonce()
    )
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compute the digest response a client would send (no qop)
///
/// `HA1 = MD5(user:realm:pass)`, `HA2 = MD5(method:uri)`,
/// `response = MD5(HA1:nonce:HA2)`.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
}

/// Verify an Authorization header value against the user directory
///
/// The realm, nonce and uri are taken from the header itself (stateless
/// verification). With a qop-bearing response the extended RFC 2617 formula
/// applies, otherwise `MD5(HA1:nonce:HA2)`.
pub fn verify(authorization: &str, method: &str, directory: &dyn UserDirectory) -> bool {
    let username = match header_param_comma(authorization, "username") {
        Some(u) => u,
        None => return false,
    };
    let entry = match directory.lookup(&username) {
        Some(e) if e.status == UserStatus::Active => e,
        _ => return false,
    };
    let realm = header_param_comma(authorization, "realm").unwrap_or_default();
    let nonce = header_param_comma(authorization, "nonce").unwrap_or_default();
    let uri = header_param_comma(authorization, "uri").unwrap_or_default();
    let response = match header_param_comma(authorization, "response") {
        Some(r) => r,
        None => return false,
    };

    let expected = match header_param_comma(authorization, "qop") {
        Some(qop) if !qop.is_empty() => {
            let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, entry.password));
            let ha2 = md5_hex(&format!("{}:{}", method, uri));
            let nc = header_param_comma(authorization, "nc").unwrap_or_default();
            let cnonce = header_param_comma(authorization, "cnonce").unwrap_or_default();
            md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        _ => digest_response(&username, &realm, &entry.password, method, &uri, &nonce),
    };

    expected.eq_ignore_ascii_case(&response)
}

/// Digest parameters are comma separated, unlike the `;` of URI parameters
fn header_param_comma(value: &str, name: &str) -> Option<String> {
    let body = value.trim().strip_prefix("Digest").unwrap_or(value);
    let prefix = format!("{}=", name.to_lowercase());
    for part in body.split(',') {
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
