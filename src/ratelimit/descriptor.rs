//! Descriptors: the operation type used by configuration-driven rule sets.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Result, TurnstileError};

/// A domain plus ordered key/value entries describing one operation.
///
/// Written as `domain:key1=value1,key2=value2`. A `\`, `:`, `,` or `=`
/// inside the domain, a key or a value is escaped with a backslash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Descriptor {
    /// The domain this descriptor belongs to
    pub domain: String,
    /// Key/value pairs in the order they were given
    pub entries: Vec<(String, String)>,
}

impl Descriptor {
    /// Create a descriptor from a domain and entries.
    pub fn new<K, V>(domain: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            domain: domain.into(),
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of the first entry with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Characters with a meaning in the textual form.
const SPECIAL: [char; 4] = ['\\', ':', ',', '='];

fn write_escaped(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    for c in part.chars() {
        if SPECIAL.contains(&c) {
            write!(f, "\\")?;
        }
        write!(f, "{}", c)?;
    }
    Ok(())
}

/// Split `s` at every `sep` that is not escaped.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split `s` at its first unescaped `sep`.
fn split_once_unescaped(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut parts = split_unescaped(s, sep).into_iter();
    let first = parts.next()?;
    parts.next()?;
    Some((first, &s[first.len() + sep.len_utf8()..]))
}

fn unescape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut chars = part.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.domain)?;
        write!(f, ":")?;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write_escaped(f, k)?;
            write!(f, "=")?;
            write_escaped(f, v)?;
        }
        Ok(())
    }
}

impl FromStr for Descriptor {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (domain, rest) = split_once_unescaped(s, ':').ok_or_else(|| {
            TurnstileError::Config(format!("descriptor '{}' is missing a domain", s))
        })?;

        let mut entries = Vec::new();
        for entry in split_unescaped(rest, ',')
            .into_iter()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let (key, value) = split_once_unescaped(entry, '=').ok_or_else(|| {
                TurnstileError::Config(format!("descriptor entry '{}' is not key=value", entry))
            })?;
            if key.trim().is_empty() {
                return Err(TurnstileError::Config(format!(
                    "descriptor entry '{}' has an empty key",
                    entry
                )));
            }
            entries.push((unescape(key), unescape(value)));
        }

        Ok(Self {
            domain: unescape(domain),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_creation() {
        let descriptor = Descriptor::new(
            "test_domain",
            [("source", "client_a"), ("destination", "service_b")],
        );

        assert_eq!(descriptor.domain, "test_domain");
        assert_eq!(descriptor.entries.len(), 2);
        assert_eq!(descriptor.get("source"), Some("client_a"));
        assert_eq!(descriptor.get("destination"), Some("service_b"));
        assert_eq!(descriptor.get("missing"), None);
    }

    #[test]
    fn test_descriptor_to_string() {
        let descriptor = Descriptor::new("domain", [("key1", "value1"), ("key2", "value2")]);
        assert_eq!(descriptor.to_string(), "domain:key1=value1,key2=value2");

        let empty = Descriptor::new("domain", Vec::<(String, String)>::new());
        assert_eq!(empty.to_string(), "domain:");
    }

    #[test]
    fn test_parse_descriptor() {
        let descriptor: Descriptor = "edge: path=/api/foobars, remote_address=10.0.0.1"
            .parse()
            .unwrap();
        assert_eq!(descriptor.domain, "edge");
        assert_eq!(
            descriptor.entries,
            vec![
                ("path".to_string(), "/api/foobars".to_string()),
                ("remote_address".to_string(), "10.0.0.1".to_string()),
            ]
        );
        assert_eq!(descriptor.to_string().parse::<Descriptor>().unwrap(), descriptor);
    }

    #[test]
    fn test_special_characters_survive_printing() {
        let descriptor = Descriptor::new(
            "edge:eu",
            [("query", "a=1,b=2"), ("path", r"C:\tmp"), ("x,y", "")],
        );
        assert_eq!(
            descriptor.to_string(),
            r"edge\:eu:query=a\=1\,b\=2,path=C\:\\tmp,x\,y="
        );
        assert_eq!(descriptor.to_string().parse::<Descriptor>().unwrap(), descriptor);

        let parsed: Descriptor = r"edge:note=x\=y".parse().unwrap();
        assert_eq!(parsed.get("note"), Some("x=y"));
    }

    #[test]
    fn test_parse_invalid_descriptor() {
        assert!("no-domain".parse::<Descriptor>().is_err());
        assert!("edge:path".parse::<Descriptor>().is_err());
        assert!("edge:=value".parse::<Descriptor>().is_err());
        assert!("edge:".parse::<Descriptor>().unwrap().entries.is_empty());
    }
}
