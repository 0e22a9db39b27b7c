//! Records returned by read commands.

use std::collections::HashMap;
use std::time::Duration;

use crate::key::Key;
use crate::value::Value;

/// Void time sentinel meaning the record never expires.
const TTL_NONE: u32 = 0;

/// A record decoded from a response frame: optional key, bins, and the
/// server-side metadata counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The record's key, when the response carried one (batch and scan
    /// responses include at least the digest).
    pub key: Option<Key>,
    /// Bin name to value mapping.
    pub bins: HashMap<String, Value>,
    /// Monotonically increasing write counter.
    pub generation: u32,
    /// Seconds until the record expires, 0 meaning never.
    pub expiration: u32,
}

impl Record {
    /// Creates a record from decoded parts.
    pub fn new(
        key: Option<Key>,
        bins: HashMap<String, Value>,
        generation: u32,
        expiration: u32,
    ) -> Self {
        Record {
            key,
            bins,
            generation,
            expiration,
        }
    }

    /// Convenience accessor for a bin value.
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    /// Remaining time to live, `None` when the record never expires.
    pub fn ttl(&self) -> Option<Duration> {
        match self.expiration {
            TTL_NONE => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_lookup() {
        let mut bins = HashMap::new();
        bins.insert("age".to_string(), Value::Int(25));
        let rec = Record::new(None, bins, 3, 0);

        assert_eq!(rec.bin("age"), Some(&Value::Int(25)));
        assert_eq!(rec.bin("name"), None);
        assert_eq!(rec.generation, 3);
    }

    #[test]
    fn ttl_zero_means_never() {
        let rec = Record::new(None, HashMap::new(), 1, 0);
        assert_eq!(rec.ttl(), None);

        let rec = Record::new(None, HashMap::new(), 1, 30);
        assert_eq!(rec.ttl(), Some(Duration::from_secs(30)));
    }
}
