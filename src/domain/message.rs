use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Opaque message payload.
///
/// Deserializes from plain JSON values: `null`, booleans, integers, strings
/// and arrays (the latter being what a split step fans out over).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Body {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<Body>),
    Bytes(Vec<u8>),
}

impl Body {
    /// Parses a textual payload as received from a CSV cell or CLI argument.
    ///
    /// Empty text is `Null`, integers become `Int`, JSON arrays become `List`,
    /// anything else is kept as `Text`.
    pub fn parse_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Body::Null;
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return Body::Int(n);
        }
        if trimmed.starts_with('[')
            && let Ok(list @ Body::List(_)) = serde_json::from_str::<Body>(trimmed)
        {
            return list;
        }
        Body::Text(trimmed.to_string())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Body::Int(n) => Some(*n),
            Body::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<i64> for Body {
    fn from(value: i64) -> Self {
        Body::Int(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl<T: Into<Body>> From<Vec<T>> for Body {
    fn from(values: Vec<T>) -> Self {
        Body::List(values.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Null => Ok(()),
            Body::Bool(b) => write!(f, "{}", b),
            Body::Int(n) => write!(f, "{}", n),
            Body::Text(s) => f.write_str(s),
            Body::List(_) | Body::Bytes(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// A message in flight.
///
/// The body is fixed once created; steps may only enrich the headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Shared by a message and every sub-message split from it.
    pub correlation_id: MessageId,
    pub body: Body,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(body: impl Into<Body>) -> Self {
        let id = MessageId::next();
        Self {
            id,
            correlation_id: id,
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(body: impl Into<Body>, headers: BTreeMap<String, String>) -> Self {
        Self {
            headers,
            ..Self::new(body)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Derives a sub-message for one item of a split body.
    pub fn split_child(&self, body: Body, index: usize, size: usize) -> Self {
        let mut headers = self.headers.clone();
        headers.insert(HEADER_SPLIT_INDEX.to_string(), index.to_string());
        headers.insert(HEADER_SPLIT_SIZE.to_string(), size.to_string());
        Self {
            id: MessageId::next(),
            correlation_id: self.correlation_id,
            body,
            headers,
        }
    }
}

pub const HEADER_SPLIT_INDEX: &str = "split.index";
pub const HEADER_SPLIT_SIZE: &str = "split.size";
