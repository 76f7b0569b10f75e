//! Identity keys.
//!
//! An [`IdentityKey`] is one or more `(table, column, value)` triples naming a
//! record by its primary key. Its rendered string is the cache key used by
//! repositories and inside query fingerprints, so the rendering is stable:
//!
//! ```text
//! <tag><table>.<column>|<value>[:<tag><table>.<column>|<value>...]
//! ```
//!
//! where `tag` is `N` (numeric), `S` (text), `D` (date/timestamp) or `U`
//! (anything else). A `\`, `:` or `|` inside a table, column or value is
//! written with a leading `\`, and so is a `.` inside a table name, so
//! distinct keys never render to the same string.

use crate::error::KeyError;
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^([NSDU])((?:[^\\.|:]|\\.)+)\.((?:[^\\|:]|\\.)+)\|((?:[^\\|:]|\\.)*)$")
        .expect("static key pattern compiles")
});

/// One `(table, column, value)` component of an identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPart {
    pub table: String,
    pub column: String,
    pub value: Value,
}

impl KeyPart {
    pub fn new(table: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            value: value.into(),
        }
    }

    fn tag(&self) -> char {
        if self.value.is_numeric() {
            'N'
        } else if self.value.is_temporal() {
            'D'
        } else if matches!(self.value, Value::Text(_)) {
            'S'
        } else {
            'U'
        }
    }
}

// Numerically equal values of different widths name the same row.
impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
            && self.column == other.column
            && (self.value == other.value || self.value.loose_eq(&other.value))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{}|{}",
            self.tag(),
            escape(&self.table, &['.']),
            escape(&self.column, &[]),
            escape(&self.value.to_string(), &[])
        )
    }
}

/// The immutable identity of a record or aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityKey {
    parts: Vec<KeyPart>,
}

impl IdentityKey {
    /// Key over a single primary-key column.
    pub fn single(table: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            parts: vec![KeyPart::new(table, column, value)],
        }
    }

    /// Key over several primary-key columns. At least one part is required.
    pub fn composite(parts: Vec<KeyPart>) -> Result<Self, KeyError> {
        if parts.is_empty() {
            return Err(KeyError {
                input: String::new(),
                message: "identity key needs at least one part".to_string(),
            });
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn is_composite(&self) -> bool {
        self.parts.len() > 1
    }

    /// Table of the first part; every part of a record key shares it.
    pub fn table(&self) -> &str {
        self.parts.first().map_or("", |p| p.table.as_str())
    }

    /// Value of the part for `column`, if any.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.parts
            .iter()
            .find(|p| p.column == column)
            .map(|p| &p.value)
    }

    /// The stable rendered form used as a cache key.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

impl FromStr for IdentityKey {
    type Err = KeyError;

    /// Parse a rendered key back. Values tagged `U` come back as text.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let malformed = |message: &str| KeyError {
            input: input.to_string(),
            message: message.to_string(),
        };

        let mut parts = Vec::new();
        for raw in split_unescaped(input) {
            let caps = PART
                .captures(raw)
                .ok_or_else(|| malformed("malformed key part"))?;
            let text = unescape(&caps[4]);
            let value = match &caps[1] {
                "N" => parse_numeric(&text).ok_or_else(|| malformed("numeric part is not a number"))?,
                "D" => parse_temporal(&text).ok_or_else(|| malformed("date part is not a date"))?,
                _ => Value::Text(text),
            };
            parts.push(KeyPart::new(unescape(&caps[2]), unescape(&caps[3]), value));
        }
        IdentityKey::composite(parts).map_err(|e| KeyError {
            input: input.to_string(),
            message: e.message,
        })
    }
}

fn escape(text: &str, extra: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | ':' | '|') || extra.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            other => out.push(other),
        }
    }
    out
}

/// Split on every `:` not preceded by an escaping `\`.
fn split_unescaped(input: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ':' => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&input[start..]);
    segments
}

fn parse_numeric(text: &str) -> Option<Value> {
    if let Ok(v) = text.parse::<i64>() {
        return Some(Value::BigInt(v));
    }
    text.parse::<f64>().ok().map(Value::Double)
}

fn parse_temporal(text: &str) -> Option<Value> {
    if let Some(zoned) = text.strip_suffix('Z') {
        return match Value::parse_timestamp(zoned)? {
            Value::Timestamp(micros) => Some(Value::TimestampTz(micros)),
            other => Some(other),
        };
    }
    Value::parse_date(text).or_else(|| Value::parse_timestamp(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_single_and_composite_keys() {
        let key = IdentityKey::single("users", "id", 42_i64);
        assert_eq!(key.render(), "Nusers.id|42");

        let key = IdentityKey::composite(vec![
            KeyPart::new("grants", "user", "ann"),
            KeyPart::new("grants", "day", Value::date(2020, 1, 31).unwrap()),
        ])
        .unwrap();
        assert_eq!(key.render(), "Sgrants.user|ann:Dgrants.day|2020-01-31");
        assert!(key.is_composite());
        assert_eq!(key.table(), "grants");
    }

    #[test]
    fn equality_is_structural_and_width_insensitive() {
        let a = IdentityKey::single("users", "id", 42_i32);
        let b = IdentityKey::single("users", "id", 42_i64);
        let c = IdentityKey::single("accounts", "id", 42_i64);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.render(), b.render());
    }

    #[test]
    fn parses_rendered_form_back() {
        let key = IdentityKey::composite(vec![
            KeyPart::new("events", "source", "sensor:7"),
            KeyPart::new("events", "at", Value::timestamp(2022, 5, 6, 7, 8, 9).unwrap()),
            KeyPart::new("events", "seq", 3_i64),
        ])
        .unwrap();
        let rendered = key.render();
        let parsed: IdentityKey = rendered.parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.render(), rendered);
    }

    #[test]
    fn separators_inside_values_keep_keys_distinct() {
        let a = IdentityKey::composite(vec![
            KeyPart::new("St", "c1", "p"),
            KeyPart::new("St", "c2", "q:St.c2|r"),
        ])
        .unwrap();
        let b = IdentityKey::composite(vec![
            KeyPart::new("St", "c1", "p:St.c2|q"),
            KeyPart::new("St", "c2", "r"),
        ])
        .unwrap();
        assert_ne!(a, b);
        assert_ne!(a.render(), b.render());
        assert_eq!(a.render(), r"SSt.c1|p:SSt.c2|q\:St.c2\|r");

        for key in [a, b] {
            let parsed: IdentityKey = key.render().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn escaped_names_and_backslashes_round_trip() {
        let key = IdentityKey::composite(vec![
            KeyPart::new("odd.table", "col|umn", r"back\slash"),
            KeyPart::new("t", "c", r"trailing\"),
        ])
        .unwrap();
        assert_eq!(
            key.render(),
            r"Sodd\.table.col\|umn|back\\slash:St.c|trailing\\"
        );
        let parsed: IdentityKey = key.render().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        assert!("Dpost.id|300000-01-01 00:00:00".parse::<IdentityKey>().is_err());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("".parse::<IdentityKey>().is_err());
        assert!("users.id|1".parse::<IdentityKey>().is_err());
        assert!("Nusers.id|abc".parse::<IdentityKey>().is_err());
        assert!("Dusers.day|not-a-date".parse::<IdentityKey>().is_err());
        assert!("Nusers.id|1:".parse::<IdentityKey>().is_err());
        assert!(r"Susers.id|dangling\".parse::<IdentityKey>().is_err());
        assert!(IdentityKey::composite(vec![]).is_err());
    }

    #[test]
    fn value_lookup_by_column() {
        let key = IdentityKey::single("users", "id", 5_i64);
        assert_eq!(key.value("id"), Some(&Value::BigInt(5)));
        assert_eq!(key.value("name"), None);
    }

    #[test]
    fn serde_roundtrip_keeps_identity() {
        let key = IdentityKey::single("users", "email", "a@b.c");
        let json = serde_json::to_string(&key).unwrap();
        let back: IdentityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
