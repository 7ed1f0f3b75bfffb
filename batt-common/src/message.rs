//! Wire protocol messages.
//!
//! A message is a verb plus a multi-valued key/value mapping, rendered on the
//! wire as a single newline-terminated record:
//!
//! ```text
//! <verb> <query-string>\n
//! ```
//!
//! where `<query-string>` is a URL-encoded form (`key=value&key=value...`).
//! Repeated keys are preserved in order. A record may be verb-only. Binary
//! payloads never travel on this channel; artifacts move over HTTP.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::form_urlencoded;

/// A single protocol message.
///
/// Value lists are non-empty by construction: [`Message::set`] and
/// [`Message::append`] are the only ways to add values, so formatting a
/// message and parsing it back yields an equal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub verb: String,
    values: BTreeMap<String, Vec<String>>,
}

impl Message {
    /// Create a message with no fields.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style [`append`](Self::append).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(key, value);
        self
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.first().map(String::as_str)
    }

    /// All values for `key`, in wire order.
    pub fn values(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace all values for `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), vec![value.into()]);
    }

    /// Add a value for `key`, keeping existing ones.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.entry(key.into()).or_default().push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        if !self.values.is_empty() {
            let mut query = form_urlencoded::Serializer::new(String::new());
            for (key, values) in &self.values {
                for value in values {
                    query.append_pair(key, value);
                }
            }
            write!(f, " {}", query.finish())?;
        }
        Ok(())
    }
}

/// Why a record failed to parse.
///
/// Any parse failure is fatal for the session carrying it; there is no
/// resynchronization on this protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty record")]
    Empty,
    #[error("invalid verb token {0:?}")]
    InvalidVerb(String),
    #[error("trailing data after query string")]
    TrailingData,
}

impl FromStr for Message {
    type Err = ParseError;

    /// Parse one record, without its trailing newline.
    ///
    /// Leading and trailing whitespace is tolerated; the verb token is not:
    /// it must be a non-empty run of `[A-Za-z0-9_-]`.
    fn from_str(s: &str) -> Result<Self, ParseError> {
        let mut tokens = s.split_whitespace();
        let verb = tokens.next().ok_or(ParseError::Empty)?;
        if !is_verb_token(verb) {
            return Err(ParseError::InvalidVerb(verb.to_string()));
        }
        let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(query) = tokens.next() {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                values
                    .entry(key.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }
        if tokens.next().is_some() {
            return Err(ParseError::TrailingData);
        }
        Ok(Message {
            verb: verb.to_string(),
            values,
        })
    }
}

fn is_verb_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
