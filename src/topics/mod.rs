//! Topic naming and pattern matching
//!
//! Topics are `/`-separated segments led by a family name:
//! - `block`
//! - `transaction/<from>/<to>`
//! - `event/<address>/<topic0>/<topic1>/<topic2>/<topic3>`
//!
//! A pattern segment is either a literal or `*`. The wildcard matches exactly one
//! segment at its position; segment counts are fixed per family, so nothing spans
//! more than one segment:
//! - `transaction/*/0xB` matches `transaction/0xA/0xB`
//! - `event/0xC/*/*/*/*` matches every log emitted by contract `0xC`
//! - `block` matches `block`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Marker for a segment that matches any single value
pub const WILDCARD: &str = "*";

/// Separator between segments
pub const SEPARATOR: char = '/';

/// Number of indexed topic slots carried by a log event
pub const EVENT_TOPIC_SLOTS: usize = 4;

/// Valid characters for a literal segment
fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name cannot be empty")]
    Empty,

    #[error("unknown topic family '{0}': expected block, transaction or event")]
    UnknownFamily(String),

    #[error("`{family}` expects {expected} segment(s) after the family name, got {got}")]
    Arity {
        family: TopicFamily,
        expected: usize,
        got: usize,
    },

    #[error("empty segment at position {0}")]
    EmptySegment(usize),

    #[error("invalid segment '{0}': must be '*' or match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("wildcard '*' is not allowed in a concrete topic")]
    WildcardInTopic,

    #[error("a log event carries at most 4 topics, got {0}")]
    TooManyEventTopics(usize),
}

/// Top level topic family, i.e. the first segment of every topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicFamily {
    Block,
    Transaction,
    Event,
}

impl TopicFamily {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "block" => Some(TopicFamily::Block),
            "transaction" => Some(TopicFamily::Transaction),
            "event" => Some(TopicFamily::Event),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicFamily::Block => "block",
            TopicFamily::Transaction => "transaction",
            TopicFamily::Event => "event",
        }
    }

    /// Number of segments following the family name
    pub fn arity(&self) -> usize {
        match self {
            TopicFamily::Block => 0,
            TopicFamily::Transaction => 2,
            TopicFamily::Event => 1 + EVENT_TOPIC_SLOTS,
        }
    }
}

impl fmt::Display for TopicFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `text` into its family and the raw segments after it, checking arity
fn split_family(text: &str) -> Result<(TopicFamily, Vec<&str>), TopicError> {
    if text.is_empty() {
        return Err(TopicError::Empty);
    }

    let mut parts = text.split(SEPARATOR);
    let head = parts.next().unwrap_or_default();
    let family =
        TopicFamily::parse(head).ok_or_else(|| TopicError::UnknownFamily(head.to_string()))?;

    let rest: Vec<&str> = parts.collect();
    if rest.len() != family.arity() {
        return Err(TopicError::Arity {
            family,
            expected: family.arity(),
            got: rest.len(),
        });
    }

    Ok((family, rest))
}

/// One position of a topic pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Matches any single segment
    Wildcard,
    /// Matches only the identical segment
    Literal(String),
}

impl Segment {
    /// Parse a pattern segment; `position` is only used for error reporting
    fn parse(raw: &str, position: usize) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::EmptySegment(position));
        }

        if raw == WILDCARD {
            return Ok(Segment::Wildcard);
        }

        if !raw.chars().all(is_valid_segment_char) {
            return Err(TopicError::InvalidSegment(raw.to_string()));
        }

        Ok(Segment::Literal(raw.to_string()))
    }

    /// Case-sensitive for literals
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Wildcard => true,
            Segment::Literal(literal) => literal == value,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::Wildcard)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Segment::Wildcard => WILDCARD,
            Segment::Literal(literal) => literal,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional match of pattern segments against concrete segments.
///
/// Differing lengths never match; two empty sequences do.
pub fn matches_segments<S: AsRef<str>>(pattern: &[Segment], topic: &[S]) -> bool {
    pattern.len() == topic.len()
        && pattern
            .iter()
            .zip(topic)
            .all(|(segment, value)| segment.matches(value.as_ref()))
}

/// Does `pattern` select `topic`?
pub fn matches(pattern: &TopicPattern, topic: &Topic) -> bool {
    pattern.matches(topic)
}

/// A validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicPattern {
    Block,
    Transaction {
        from: Segment,
        to: Segment,
    },
    Event {
        address: Segment,
        topics: [Segment; EVENT_TOPIC_SLOTS],
    },
}

impl TopicPattern {
    /// Parse and validate a pattern such as `transaction/0xA/*`
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        let (family, raw) = split_family(pattern)?;

        let segments = raw
            .iter()
            .enumerate()
            .map(|(i, s)| Segment::parse(s, i + 1))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(match family {
            TopicFamily::Block => TopicPattern::Block,
            TopicFamily::Transaction => {
                let [from, to] = into_array(family, segments)?;
                TopicPattern::Transaction { from, to }
            }
            TopicFamily::Event => {
                let [address, t0, t1, t2, t3] = into_array(family, segments)?;
                TopicPattern::Event {
                    address,
                    topics: [t0, t1, t2, t3],
                }
            }
        })
    }

    /// Pattern matching every topic of a family
    pub fn any(family: TopicFamily) -> Self {
        match family {
            TopicFamily::Block => TopicPattern::Block,
            TopicFamily::Transaction => TopicPattern::Transaction {
                from: Segment::Wildcard,
                to: Segment::Wildcard,
            },
            TopicFamily::Event => TopicPattern::Event {
                address: Segment::Wildcard,
                topics: [
                    Segment::Wildcard,
                    Segment::Wildcard,
                    Segment::Wildcard,
                    Segment::Wildcard,
                ],
            },
        }
    }

    pub fn family(&self) -> TopicFamily {
        match self {
            TopicPattern::Block => TopicFamily::Block,
            TopicPattern::Transaction { .. } => TopicFamily::Transaction,
            TopicPattern::Event { .. } => TopicFamily::Event,
        }
    }

    /// Segments after the family name, in wire order
    pub fn segments(&self) -> Vec<&Segment> {
        match self {
            TopicPattern::Block => Vec::new(),
            TopicPattern::Transaction { from, to } => vec![from, to],
            TopicPattern::Event { address, topics } => {
                std::iter::once(address).chain(topics.iter()).collect()
            }
        }
    }

    /// O(segment count); families must agree before segments are compared
    pub fn matches(&self, topic: &Topic) -> bool {
        if self.family() != topic.family() {
            return false;
        }

        let pattern = self.segments();
        let values = topic.segments();
        pattern.len() == values.len()
            && pattern
                .iter()
                .zip(&values)
                .all(|(segment, value)| segment.matches(value))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family().as_str())?;
        for segment in self.segments() {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicPattern::parse(s)
    }
}

impl Serialize for TopicPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TopicPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn into_array<const N: usize, T>(family: TopicFamily, items: Vec<T>) -> Result<[T; N], TopicError> {
    items.try_into().map_err(|items: Vec<T>| TopicError::Arity {
        family,
        expected: N,
        got: items.len(),
    })
}

/// A concrete, fully literal topic produced at publish time.
///
/// Segments may be empty: a contract creation has no `to`, and a log with fewer
/// than four topics leaves the trailing slots empty. Only `*` matches those.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Block,
    Transaction {
        from: String,
        to: String,
    },
    Event {
        address: String,
        topics: [String; EVENT_TOPIC_SLOTS],
    },
}

impl Topic {
    /// Parse and validate a concrete topic such as `transaction/0xA/0xB`
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let (family, raw) = split_family(topic)?;

        for segment in &raw {
            if segment.contains('*') {
                return Err(TopicError::WildcardInTopic);
            }
            if !segment.chars().all(is_valid_segment_char) {
                return Err(TopicError::InvalidSegment(segment.to_string()));
            }
        }

        let segments: Vec<String> = raw.into_iter().map(str::to_string).collect();
        Ok(match family {
            TopicFamily::Block => Topic::Block,
            TopicFamily::Transaction => {
                let [from, to] = into_array(family, segments)?;
                Topic::Transaction { from, to }
            }
            TopicFamily::Event => {
                let [address, t0, t1, t2, t3] = into_array(family, segments)?;
                Topic::Event {
                    address,
                    topics: [t0, t1, t2, t3],
                }
            }
        })
    }

    pub fn block() -> Self {
        Topic::Block
    }

    pub fn transaction(from: impl Into<String>, to: impl Into<String>) -> Self {
        Topic::Transaction {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Build an event topic, padding missing topic slots with empty segments
    pub fn event<S: AsRef<str>>(address: impl Into<String>, topics: &[S]) -> Result<Self, TopicError> {
        if topics.len() > EVENT_TOPIC_SLOTS {
            return Err(TopicError::TooManyEventTopics(topics.len()));
        }

        let mut slots: [String; EVENT_TOPIC_SLOTS] = Default::default();
        for (slot, topic) in slots.iter_mut().zip(topics) {
            *slot = topic.as_ref().to_string();
        }

        Ok(Topic::Event {
            address: address.into(),
            topics: slots,
        })
    }

    pub fn family(&self) -> TopicFamily {
        match self {
            Topic::Block => TopicFamily::Block,
            Topic::Transaction { .. } => TopicFamily::Transaction,
            Topic::Event { .. } => TopicFamily::Event,
        }
    }

    /// Segments after the family name, in wire order
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Topic::Block => Vec::new(),
            Topic::Transaction { from, to } => vec![from.as_str(), to.as_str()],
            Topic::Event { address, topics } => std::iter::once(address.as_str())
                .chain(topics.iter().map(String::as_str))
                .collect(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family().as_str())?;
        for segment in self.segments() {
            write!(f, "{}{}", SEPARATOR, segment)?;
        }
        Ok(())
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Topic::parse(&s).map_err(serde::de::Error::custom)
    }
}
