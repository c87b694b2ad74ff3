//! Identity Resolver — derives a stable composite applicant key from weak,
//! spoofable request signals (source address, user-agent, optional
//! client-supplied device signal).
//!
//! The key is deterministic for the same (address, device) pair within a
//! bounded time window and rolls over across windows to limit long-term
//! tracking. No cookies, no accounts. Resolution is infallible: missing
//! signals degrade to a weaker key, never to an error.
//!
//! Known trade-off: distinct applicants behind one NAT with identical
//! browsers can collide on the same key. That is accepted behavior for
//! account-less dedup, not a defect.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Raw request-level metadata collected by the apply endpoint.
#[derive(Debug, Clone, Default)]
pub struct RequestSignals {
    /// Source address as seen by the server: forwarded header value or
    /// peer socket address. May include a port or be absent entirely.
    pub source_addr: Option<String>,
    pub user_agent: Option<String>,
    /// Optional client-supplied device/browser signal.
    pub device_signal: Option<String>,
}

/// Composite applicant key. 16 hex characters of a SHA-256 digest —
/// intentionally not personally identifying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicantFingerprint(String);

impl ApplicantFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ApplicantFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintResolver {
    window_secs: i64,
}

impl FingerprintResolver {
    pub fn new(window_hours: u32) -> Self {
        Self {
            // Window of 0 would make every request its own bucket; floor at 1h.
            window_secs: i64::from(window_hours.max(1)) * 3600,
        }
    }

    /// Derives the composite key for a request. Always succeeds.
    pub fn resolve(&self, signals: &RequestSignals, now: DateTime<Utc>) -> ApplicantFingerprint {
        let addr = signals
            .source_addr
            .as_deref()
            .map(normalize_source_addr)
            .unwrap_or_default();
        let agent = signals
            .user_agent
            .as_deref()
            .map(normalize_agent)
            .unwrap_or_default();
        let device = signals
            .device_signal
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        let bucket = now.timestamp().div_euclid(self.window_secs);

        let mut hasher = Sha256::new();
        hasher.update(addr.as_bytes());
        hasher.update(b"\n");
        hasher.update(agent.as_bytes());
        hasher.update(b"\n");
        hasher.update(device.as_bytes());
        hasher.update(b"\n");
        hasher.update(bucket.to_string().as_bytes());
        let bytes = hasher.finalize();

        let mut hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        hex.truncate(16);
        ApplicantFingerprint(hex)
    }
}

/// Canonicalizes a source address string: strips ports, normalizes IPv6
/// forms, lowercases. Unparseable input is kept verbatim (lowercased) so a
/// weird proxy header still yields a stable key.
fn normalize_source_addr(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return ip.to_string();
    }
    // Bracketed IPv6 without port, e.g. "[::1]"
    let unbracketed = trimmed.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return ip.to_string();
    }
    trimmed.to_ascii_lowercase()
}

fn normalize_agent(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
