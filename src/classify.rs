/// Line classification for OpenVPN client output.
///
/// Each raw output line maps to exactly one `EventTag` by substring
/// containment against a fixed marker list. `PUSH_REPLY` is checked first
/// because it also carries the assigned tunnel address.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

const PUSH_REPLY_MARKER: &str = "PUSH_REPLY";

/// Semantic tag assigned to an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    Connected,
    Disconnected,
    AuthFailed,
    TlsError,
    PushReply,
    InitComplete,
    Error,
    Fatal,
    TcpEstablished,
    PeerInit,
    ConnectionReset,
    Unclassified,
}

/// Marker priority after `PUSH_REPLY`. First match wins, so markers that are
/// substrings of others (`ERROR:` inside `TLS_ERROR:`) come later.
const PRIORITY: [(EventTag, &str); 10] = [
    (EventTag::AuthFailed, "AUTH_FAILED"),
    (EventTag::TlsError, "TLS_ERROR"),
    (EventTag::Fatal, "FATAL:"),
    (EventTag::Error, "ERROR:"),
    (EventTag::InitComplete, "Initialization Sequence Completed"),
    (EventTag::PeerInit, "Peer Connection Initiated"),
    (EventTag::TcpEstablished, "TCP connection established"),
    (EventTag::ConnectionReset, "Connection reset"),
    (EventTag::Disconnected, "DISCONNECT"),
    (EventTag::Connected, "CONNECTED"),
];

impl EventTag {
    /// The literal marker that selects this tag, if any.
    pub fn marker(self) -> Option<&'static str> {
        if self == EventTag::PushReply {
            return Some(PUSH_REPLY_MARKER);
        }
        PRIORITY
            .iter()
            .find(|(tag, _)| *tag == self)
            .map(|(_, marker)| *marker)
    }
}

/// A classified output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub tag: EventTag,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Tunnel address pushed by the server, as a dotted quad.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Accept four `.`-separated groups of one to three digits, each 0-255.
    /// The text is kept exactly as written.
    pub fn parse(text: &str) -> Option<Self> {
        let groups: Vec<&str> = text.split('.').collect();
        if groups.len() != 4 {
            return None;
        }
        let valid = groups.iter().all(|g| {
            (1..=3).contains(&g.len())
                && g.bytes().all(|b| b.is_ascii_digit())
                && g.parse::<u16>().is_ok_and(|n| n <= 255)
        });
        valid.then(|| Address(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ASCII digits only; the address may be followed by anything but another digit.
static ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ifconfig\s+([0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3})(?:[^0-9]|$)").unwrap()
});

/// Tag a line. Pure and total: unmatched lines are `Unclassified`.
pub fn classify_tag(line: &str) -> EventTag {
    if line.contains(PUSH_REPLY_MARKER) {
        return EventTag::PushReply;
    }
    PRIORITY
        .iter()
        .find(|(_, marker)| line.contains(marker))
        .map(|(tag, _)| *tag)
        .unwrap_or(EventTag::Unclassified)
}

/// Classify a line into a timestamped `Event`.
pub fn classify(line: &str) -> Event {
    Event {
        tag: classify_tag(line),
        line: line.to_string(),
        timestamp: Utc::now(),
    }
}

/// Pull the `ifconfig` address out of a `PUSH_REPLY` line.
///
/// Returns `None` for lines that are not push replies, and for push replies
/// without a valid `ifconfig a.b.c.d` token.
pub fn extract_address(line: &str) -> Option<Address> {
    if classify_tag(line) != EventTag::PushReply {
        return None;
    }
    ADDRESS_PATTERN
        .captures_iter(line)
        .find_map(|caps| caps.get(1).and_then(|m| Address::parse(m.as_str())))
}
