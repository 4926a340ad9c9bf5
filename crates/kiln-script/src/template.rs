use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const QUERY_PREFIX: &str = "query.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("missing query parameter '{0}'")]
    MissingQuery(String),
    #[error("unterminated placeholder")]
    Unterminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Query(String),
}

/// A route body with option placeholders already filled in.
///
/// `{{key}}` is replaced by the launch option `key` when the template is built;
/// `{{query.name}}` stays open until [`Template::render`] sees a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(text: &str, options: &BTreeMap<String, String>) -> Result<Self, ScriptError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find(OPEN) {
            literal.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let end = after.find(CLOSE).ok_or(ScriptError::Unterminated)?;
            let key = after[..end].trim();

            if let Some(name) = key.strip_prefix(QUERY_PREFIX) {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Query(name.to_owned()));
            } else {
                let value = options
                    .get(key)
                    .ok_or_else(|| ScriptError::UnknownOption(key.to_owned()))?;
                literal.push_str(value);
            }
            rest = &after[end + CLOSE.len()..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// True when the body is the same for every request.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, query: &HashMap<String, String>) -> Result<String, ScriptError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Query(name) => out.push_str(
                    query
                        .get(name)
                        .ok_or_else(|| ScriptError::MissingQuery(name.clone()))?,
                ),
            }
        }
        Ok(out)
    }
}

/// Split a request target into its path and decoded query parameters.
pub fn split_url(url: &str) -> (&str, HashMap<String, String>) {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let params = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect();
    (path, params)
}

/// Percent-decoding with `+` as space. Malformed escapes are kept verbatim.
fn decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = match bytes.get(i + 1..i + 3) {
            Some(&[high, low]) if bytes[i] == b'%' => hex_pair(high, low),
            _ => None,
        };
        match (bytes[i], escaped) {
            (_, Some(byte)) => {
                out.push(byte);
                i += 2;
            }
            (b'+', None) => out.push(b' '),
            (b, None) => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let digit = |b: u8| (b as char).to_digit(16);
    Some((digit(high)? * 16 + digit(low)?) as u8)
}
