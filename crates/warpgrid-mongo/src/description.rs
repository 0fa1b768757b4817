//! Server description: the immutable snapshot produced by each refresh.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::address::Address;
use crate::message::{Document, MAX_MESSAGE_SIZE};

pub const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 1000;

/// Weight of the newest sample in the round-trip time average.
const ROUND_TRIP_ALPHA: f64 = 0.2;

/// What the server last reported about itself.
///
/// Never mutated after construction; a refresh builds a new one and swaps it
/// in whole.
#[derive(Clone, Debug, PartialEq)]
pub struct Description {
    document: Document,
    round_trip_time: Option<Duration>,
    updated_at: Option<Instant>,
}

impl Default for Description {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Description {
    /// Placeholder held until the first successful refresh.
    pub fn unknown() -> Self {
        Self {
            document: Document::new(),
            round_trip_time: None,
            updated_at: None,
        }
    }

    /// Build a description from a status reply. The round-trip time is
    /// averaged with `previous`'s.
    pub fn from_reply(document: Document, round_trip_time: Duration, previous: &Description) -> Self {
        let round_trip_time = match previous.round_trip_time {
            Some(old) => Duration::from_secs_f64(
                ROUND_TRIP_ALPHA * round_trip_time.as_secs_f64()
                    + (1.0 - ROUND_TRIP_ALPHA) * old.as_secs_f64(),
            ),
            None => round_trip_time,
        };
        Self {
            document,
            round_trip_time: Some(round_trip_time),
            updated_at: Some(Instant::now()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.updated_at.is_none()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    pub fn is_primary(&self) -> bool {
        self.flag("ismaster")
    }

    pub fn is_secondary(&self) -> bool {
        self.flag("secondary")
    }

    pub fn is_arbiter(&self) -> bool {
        self.flag("arbiterOnly")
    }

    pub fn is_hidden(&self) -> bool {
        self.flag("hidden")
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        self.get("setName").and_then(Value::as_str)
    }

    pub fn hosts(&self) -> Vec<Address> {
        self.addresses("hosts")
    }

    pub fn passives(&self) -> Vec<Address> {
        self.addresses("passives")
    }

    pub fn arbiters(&self) -> Vec<Address> {
        self.addresses("arbiters")
    }

    /// Every member the server reported: hosts, passives and arbiters.
    pub fn servers(&self) -> BTreeSet<Address> {
        ["hosts", "passives", "arbiters"]
            .into_iter()
            .flat_map(|key| self.addresses(key))
            .collect()
    }

    pub fn min_wire_version(&self) -> i64 {
        self.integer("minWireVersion").unwrap_or(0)
    }

    pub fn max_wire_version(&self) -> i64 {
        self.integer("maxWireVersion").unwrap_or(0)
    }

    pub fn max_bson_object_size(&self) -> i64 {
        self.integer("maxBsonObjectSize")
            .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE)
    }

    pub fn max_message_size(&self) -> i64 {
        self.integer("maxMessageSizeBytes")
            .unwrap_or(MAX_MESSAGE_SIZE as i64)
    }

    pub fn max_write_batch_size(&self) -> i64 {
        self.integer("maxWriteBatchSize")
            .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE)
    }

    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        }
    }

    fn integer(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        value.as_i64().or_else(|| value.as_f64().map(|v| v as i64))
    }

    // Entries that do not parse as addresses are skipped.
    fn addresses(&self, key: &str) -> Vec<Address> {
        self.get(key)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| Address::parse(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
