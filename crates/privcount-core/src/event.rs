//! Tagged event feed parsing.
//!
//! The event source emits line-oriented records of the form:
//!
//! ```text
//! 650 PRIVCOUNT_STREAM_ENDED StreamID=4213 ExitPort=443 ReadBW=5120 ...
//! ```
//!
//! Each value passes a type check on access (string, int, float, flag,
//! IP address, comma-list). A missing mandatory key or a duplicate key
//! drops the whole event with a warning; the round continues.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// The control-protocol status prefix carried by every event line.
const EVENT_PREFIX: &str = "650";

/// One parsed `650 PRIVCOUNT_*` record: the event name plus its raw
/// `KEY=VALUE` fields. Field values are type-checked by the accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub name: String,
    fields: BTreeMap<String, String>,
}

/// Parse one feed line into a tagged event.
///
/// Fails on a missing `650` prefix, a non-PRIVCOUNT event name, a field
/// without `=`, or a duplicate key.
pub fn parse_tagged_event_line(line: &str) -> Result<TaggedEvent> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(EVENT_PREFIX) => {}
        other => {
            return Err(Error::Event(format!(
                "event line does not start with {EVENT_PREFIX}: {other:?}"
            )));
        }
    }
    let name = parts
        .next()
        .ok_or_else(|| Error::Event("event line has no event name".into()))?;
    if !name.starts_with("PRIVCOUNT_") {
        return Err(Error::Event(format!("not a PRIVCOUNT event: {name}")));
    }
    let mut fields = BTreeMap::new();
    for part in parts {
        let Some((key, value)) = part.split_once('=') else {
            return Err(Error::Event(format!(
                "field '{part}' in {name} has no '=' separator"
            )));
        };
        if key.is_empty() {
            return Err(Error::Event(format!("empty field key in {name}")));
        }
        if fields.insert(key.to_string(), value.to_string()).is_some() {
            return Err(Error::Event(format!("duplicate key '{key}' in {name}")));
        }
    }
    Ok(TaggedEvent {
        name: name.to_string(),
        fields,
    })
}

impl TaggedEvent {
    /// Number of fields carried by the event.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Whether the event carries a field.
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    fn raw(&self, key: &str) -> Result<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::Event(format!("{} is missing mandatory key {key}", self.name)))
    }

    /// A mandatory string field.
    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.raw(key)
    }

    /// A mandatory integer field.
    pub fn get_int(&self, key: &str) -> Result<i64> {
        let raw = self.raw(key)?;
        raw.parse().map_err(|_| {
            Error::Event(format!("{} key {key} is not an integer: '{raw}'", self.name))
        })
    }

    /// A mandatory unsigned integer field.
    pub fn get_uint(&self, key: &str) -> Result<u64> {
        let raw = self.raw(key)?;
        raw.parse().map_err(|_| {
            Error::Event(format!(
                "{} key {key} is not a non-negative integer: '{raw}'",
                self.name
            ))
        })
    }

    /// A mandatory float field.
    pub fn get_float(&self, key: &str) -> Result<f64> {
        let raw = self.raw(key)?;
        let value: f64 = raw.parse().map_err(|_| {
            Error::Event(format!("{} key {key} is not a float: '{raw}'", self.name))
        })?;
        if value.is_nan() {
            return Err(Error::Event(format!("{} key {key} is NaN", self.name)));
        }
        Ok(value)
    }

    /// A mandatory flag field: exactly `0` or `1`.
    pub fn get_flag(&self, key: &str) -> Result<bool> {
        match self.raw(key)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(Error::Event(format!(
                "{} key {key} is not a 0/1 flag: '{other}'",
                self.name
            ))),
        }
    }

    /// A mandatory IP address field (v4 or v6).
    pub fn get_ip(&self, key: &str) -> Result<IpAddr> {
        let raw = self.raw(key)?;
        raw.parse().map_err(|_| {
            Error::Event(format!(
                "{} key {key} is not an IP address: '{raw}'",
                self.name
            ))
        })
    }

    /// A mandatory comma-list field. An empty value is an empty list.
    pub fn get_list(&self, key: &str) -> Result<Vec<String>> {
        let raw = self.raw(key)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(raw.split(',').map(str::to_string).collect())
    }

    /// An optional field via any mandatory accessor.
    pub fn optional<T>(
        &self,
        key: &str,
        accessor: impl Fn(&Self, &str) -> Result<T>,
    ) -> Result<Option<T>> {
        if self.has_field(key) {
            accessor(self, key).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_stream_event() {
        let line = "650 PRIVCOUNT_STREAM_ENDED ChanID=1 CircID=2 StreamID=3 ExitPort=443 \
                    ReadBW=5120 WriteBW=800 TimeStart=1500000000.1 TimeEnd=1500000009.9 \
                    IsDNS=0 IsDir=1 RemoteIP=203.0.113.7";
        let event = parse_tagged_event_line(line).expect("parses");
        assert_eq!(event.name, "PRIVCOUNT_STREAM_ENDED");
        assert_eq!(event.get_uint("ExitPort").expect("port"), 443);
        assert_eq!(event.get_int("ReadBW").expect("bw"), 5120);
        assert!((event.get_float("TimeStart").expect("time") - 1_500_000_000.1).abs() < 1e-6);
        assert!(!event.get_flag("IsDNS").expect("flag"));
        assert!(event.get_flag("IsDir").expect("flag"));
        assert_eq!(
            event.get_ip("RemoteIP").expect("ip"),
            "203.0.113.7".parse::<IpAddr>().expect("valid")
        );
    }

    #[test]
    fn rejects_duplicate_keys() {
        let line = "650 PRIVCOUNT_STREAM_ENDED ExitPort=443 ExitPort=80";
        assert!(parse_tagged_event_line(line).is_err());
    }

    #[test]
    fn rejects_wrong_prefix_and_name() {
        assert!(parse_tagged_event_line("651 PRIVCOUNT_STREAM_ENDED A=1").is_err());
        assert!(parse_tagged_event_line("650 SOMETHING_ELSE A=1").is_err());
        assert!(parse_tagged_event_line("650").is_err());
    }

    #[test]
    fn rejects_malformed_fields() {
        assert!(parse_tagged_event_line("650 PRIVCOUNT_STREAM_ENDED NoEquals").is_err());
        assert!(parse_tagged_event_line("650 PRIVCOUNT_STREAM_ENDED =5").is_err());
    }

    #[test]
    fn missing_mandatory_key_is_an_error() {
        let event =
            parse_tagged_event_line("650 PRIVCOUNT_CONNECTION_ENDED ChanID=9").expect("parses");
        assert!(event.get_int("TimeStart").is_err());
    }

    #[test]
    fn type_checks_fail_loudly() {
        let event = parse_tagged_event_line(
            "650 PRIVCOUNT_CIRCUIT_ENDED CellsIn=abc Flag=2 Addr=999.1.2.3",
        )
        .expect("parses");
        assert!(event.get_int("CellsIn").is_err());
        assert!(event.get_flag("Flag").is_err());
        assert!(event.get_ip("Addr").is_err());
    }

    #[test]
    fn comma_lists_split() {
        let event = parse_tagged_event_line("650 PRIVCOUNT_HSDIR_CACHE_STORE Flags=a,b,c Empty=")
            .expect("parses");
        assert_eq!(
            event.get_list("Flags").expect("list"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(event.get_list("Empty").expect("list").is_empty());
    }

    #[test]
    fn optional_fields() {
        let event = parse_tagged_event_line("650 PRIVCOUNT_STREAM_ENDED ReadBW=12").expect("ok");
        assert_eq!(
            event
                .optional("ReadBW", TaggedEvent::get_int)
                .expect("present"),
            Some(12)
        );
        assert_eq!(
            event
                .optional("WriteBW", TaggedEvent::get_int)
                .expect("absent"),
            None
        );
    }
}
