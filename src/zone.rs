//! Authoritative zone data.
//!
//! A static, read-only mapping from (origin-relative label, record type) to
//! record values, built from the configuration at startup.

use rustc_hash::FxHashMap;
use std::net::Ipv4Addr;

use crate::config::{Config, ConfigError};
use crate::dns::{DnsRecord, TYPE_A, TYPE_TXT};

/// Read-only zone lookup table plus the served origin suffix.
pub struct Zone {
    origin: String,
    a: FxHashMap<String, Ipv4Addr>,
    txt: FxHashMap<String, String>,
}

impl Zone {
    /// Build the zone from configuration. Invalid A record values fail
    /// startup rather than being served broken.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut a = FxHashMap::default();
        for (label, value) in &config.records.a {
            let addr = value
                .parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidARecord {
                    label: label.clone(),
                    value: value.clone(),
                })?;
            a.insert(label.to_lowercase(), addr);
        }

        let txt = config
            .records
            .txt
            .iter()
            .map(|(label, value)| (label.to_lowercase(), value.clone()))
            .collect();

        Ok(Self {
            origin: config.origin_normalized(),
            a,
            txt,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Strip the origin suffix from a normalized query name. Returns `None`
    /// when the name is outside the served origin; the apex maps to the
    /// empty label.
    pub fn relative_label<'a>(&self, name: &'a str) -> Option<&'a str> {
        if name == self.origin {
            return Some("");
        }
        name.strip_suffix(self.origin.as_str())
            .and_then(|prefix| prefix.strip_suffix('.'))
    }

    /// Produce answer records for a label and query type, with the owner
    /// name echoed from the question.
    pub fn lookup(&self, label: &str, qname: &str, qtype: u16, ttl: u32) -> Option<Vec<DnsRecord>> {
        let (rtype, rdata) = match qtype {
            TYPE_A => (TYPE_A, DnsRecord::a_rdata(*self.a.get(label)?)),
            TYPE_TXT => (TYPE_TXT, DnsRecord::txt_rdata(self.txt.get(label)?)),
            _ => return None,
        };
        Some(vec![DnsRecord {
            name: qname.to_string(),
            rtype,
            class: 1,
            ttl,
            rdata,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Zone {
        let mut config = Config::default();
        config.origin = "example.test.".to_string();
        config
            .records
            .a
            .insert("www".to_string(), "1.2.3.4".to_string());
        config
            .records
            .txt
            .insert("info".to_string(), "hello".to_string());
        Zone::from_config(&config).unwrap()
    }

    #[test]
    fn label_is_stripped_at_origin_boundary() {
        let zone = zone();

        assert_eq!(zone.relative_label("www.example.test"), Some("www"));
        assert_eq!(zone.relative_label("a.b.example.test"), Some("a.b"));
        assert_eq!(zone.relative_label("example.test"), Some(""));
    }

    #[test]
    fn names_outside_origin_are_rejected() {
        let zone = zone();

        assert_eq!(zone.relative_label("www.other.test"), None);
        // Suffix match must respect label boundaries
        assert_eq!(zone.relative_label("badexample.test"), None);
    }

    #[test]
    fn a_lookup_builds_answer() {
        let zone = zone();

        let answers = zone.lookup("www", "www.example.test", TYPE_A, 60).unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name, "www.example.test");
        assert_eq!(answers[0].rdata, vec![1, 2, 3, 4]);
        assert_eq!(answers[0].ttl, 60);
    }

    #[test]
    fn txt_lookup_builds_answer() {
        let zone = zone();

        let answers = zone
            .lookup("info", "info.example.test", TYPE_TXT, 60)
            .unwrap();
        assert_eq!(answers[0].rdata, {
            let mut rdata = vec![5];
            rdata.extend_from_slice(b"hello");
            rdata
        });
    }

    #[test]
    fn missing_label_and_unsupported_type_miss() {
        let zone = zone();

        assert!(zone.lookup("missing", "missing.example.test", TYPE_A, 60).is_none());
        assert!(zone.lookup("www", "www.example.test", 28, 60).is_none());
    }

    #[test]
    fn invalid_a_record_fails_zone_build() {
        let mut config = Config::default();
        config
            .records
            .a
            .insert("www".to_string(), "not-an-ip".to_string());

        assert!(matches!(
            Zone::from_config(&config),
            Err(ConfigError::InvalidARecord { .. })
        ));
    }
}
