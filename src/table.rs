// Message table: id allocation, timestamp stamping, and a live-id index
// kept alongside the record map, all on top of a key/value substrate

use crate::models::{Message, NewMessage, now_ms};
use crate::substrate::Substrate;
use crate::timefmt;
use eyre::{Context, Result, eyre};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

pub const DEFAULT_NAMESPACE: &str = "messages";

/// Value of `currentId` before any id has been allocated
pub const NO_ID: i64 = -1;

/// Substrate keys owned by one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKeys {
    pub current_id: String,
    pub live_ids: String,
    pub records: String,
}

impl TableKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            current_id: format!("{}/currentId", namespace),
            live_ids: format!("{}/liveIds", namespace),
            records: format!("{}/records", namespace),
        }
    }
}

/// Handle to a message table stored in `S`
///
/// Each operation is a sequence of single-key atomic substrate calls. The
/// three keys are not updated together, so a reader running alongside an
/// add or delete can see the index and the record map disagree; they agree
/// again once no operation is in flight.
#[derive(Debug, Clone)]
pub struct MessageTable<S> {
    substrate: S,
    keys: TableKeys,
}

impl<S: Substrate> MessageTable<S> {
    /// Table under the default namespace
    pub fn new(substrate: S) -> Self {
        Self {
            substrate,
            keys: TableKeys::new(DEFAULT_NAMESPACE),
        }
    }

    /// Table under `namespace`, so several tables can share one substrate
    pub fn with_namespace(substrate: S, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        Ok(Self {
            substrate,
            keys: TableKeys::new(namespace),
        })
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn keys(&self) -> &TableKeys {
        &self.keys
    }

    /// Reset the table to empty, discarding anything stored before
    pub fn initialize(&self) -> Result<()> {
        self.substrate.put(&self.keys.current_id, json!(NO_ID))?;
        self.substrate.put(&self.keys.live_ids, json!([]))?;
        self.substrate.put(&self.keys.records, json!({}))?;

        info!(key = %self.keys.records, "Message table initialized");
        Ok(())
    }

    // ========================================================================
    // Allocation and construction
    // ========================================================================

    /// Allocate the next message id
    ///
    /// Ids are never handed out twice, deleted or not.
    pub fn next_id(&self) -> Result<i64> {
        self.substrate.update(&self.keys.current_id, |slot| {
            let current = decode_current_id(slot.as_ref())?;
            let next = current.checked_add(1).ok_or_else(|| eyre!("Message id space exhausted"))?;
            *slot = Some(json!(next));
            Ok(next)
        })
    }

    /// Highest id allocated so far, or `NO_ID`
    pub fn current_id(&self) -> Result<i64> {
        decode_current_id(self.substrate.get(&self.keys.current_id)?.as_ref())
    }

    /// Turn a partial message into a complete one stamped with the current time
    ///
    /// Consumes one id; does not store anything.
    pub fn build_message(&self, new: NewMessage) -> Result<Message> {
        self.build_message_at(new, now_ms())
    }

    fn build_message_at(&self, new: NewMessage, ts: i64) -> Result<Message> {
        let date = timefmt::format_date(ts)?;
        let time = timefmt::format_time(ts)?;
        let id = self.next_id()?;

        Ok(Message {
            id,
            text: new.text,
            ts,
            date,
            time,
        })
    }

    // ========================================================================
    // Table operations
    // ========================================================================

    /// Store a new message and return it
    pub fn add_message(&self, text: impl Into<String>) -> Result<Message> {
        let message = self.build_message(NewMessage::new(text))?;
        self.insert(&message)?;

        debug!(id = message.id, ts = message.ts, "add_message: stored");
        Ok(message)
    }

    fn insert(&self, message: &Message) -> Result<()> {
        let record = serde_json::to_value(message).context("Failed to serialize message")?;
        let id = message.id;

        self.substrate.update(&self.keys.records, |slot| {
            records_mut(slot)?.insert(id.to_string(), record);
            Ok(())
        })?;

        self.substrate.update(&self.keys.live_ids, |slot| {
            ids_mut(slot)?.push(json!(id));
            Ok(())
        })?;

        Ok(())
    }

    /// All stored messages keyed by id
    pub fn list_messages(&self) -> Result<BTreeMap<i64, Message>> {
        let records = self.substrate.get(&self.keys.records)?;

        decode_records(records)?
            .into_iter()
            .map(|(key, value)| -> Result<(i64, Message)> {
                let id = parse_id(&key)?;
                let message: Message = serde_json::from_value(value)
                    .wrap_err_with(|| format!("Failed to deserialize message {}", id))?;
                Ok((id, message))
            })
            .collect()
    }

    /// Look up one message by id
    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let key = id.to_string();
        match self.substrate.get_in(&self.keys.records, &[key.as_str()])? {
            Some(value) => {
                let message =
                    serde_json::from_value(value).wrap_err_with(|| format!("Failed to deserialize message {}", id))?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Ids currently in the live index, in insertion order
    pub fn live_ids(&self) -> Result<Vec<i64>> {
        decode_ids(self.substrate.get(&self.keys.live_ids)?)
    }

    /// Delete a message
    ///
    /// Returns false and changes nothing when no message with this id is
    /// stored, so repeating a delete is harmless. When deletes of one id
    /// overlap, only the call whose removal emptied the record slot gets true.
    pub fn delete_message(&self, id: i64) -> Result<bool> {
        match self.get_message(id)? {
            Some(message) if message.id == id => {}
            Some(message) => {
                warn!(
                    id,
                    stored_id = message.id,
                    "delete_message: record stored under another id, leaving it"
                );
                return Ok(false);
            }
            None => {
                debug!(id, "delete_message: not found, nothing to do");
                return Ok(false);
            }
        }

        self.substrate.update(&self.keys.live_ids, |slot| {
            ids_mut(slot)?.retain(|live| live.as_i64() != Some(id));
            Ok(())
        })?;

        let key = id.to_string();
        let removed = self
            .substrate
            .update(&self.keys.records, |slot| Ok(records_mut(slot)?.remove(&key).is_some()))?;

        debug!(id, removed, "delete_message: done");
        Ok(removed)
    }

    /// Check that the live index and the record map agree
    ///
    /// Only meaningful when no add or delete is in flight. The error names
    /// the first problem found.
    pub fn verify(&self) -> Result<()> {
        let current_id = self.current_id()?;
        let live_ids = self.live_ids()?;
        let records = self.list_messages()?;

        let mut seen = HashSet::new();
        for id in &live_ids {
            if !seen.insert(*id) {
                return Err(eyre!("Id {} appears more than once in the live index", id));
            }
            if *id > current_id {
                return Err(eyre!("Live id {} is above the allocator ({})", id, current_id));
            }
            if !records.contains_key(id) {
                return Err(eyre!("Live id {} has no record", id));
            }
        }

        for (id, message) in &records {
            if !seen.contains(id) {
                return Err(eyre!("Record {} is missing from the live index", id));
            }
            if message.id != *id {
                return Err(eyre!("Record stored under {} carries id {}", id, message.id));
            }
        }

        debug!(records = records.len(), current_id, "verify: table consistent");
        Ok(())
    }
}

fn decode_current_id(value: Option<&Value>) -> Result<i64> {
    match value {
        None => Ok(NO_ID),
        Some(v) => v.as_i64().ok_or_else(|| eyre!("currentId is not an integer: {}", v)),
    }
}

fn decode_ids(value: Option<Value>) -> Result<Vec<i64>> {
    match value {
        None => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v).wrap_err("liveIds is not a list of integers"),
    }
}

fn decode_records(value: Option<Value>) -> Result<Map<String, Value>> {
    match value {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(eyre!("records is not an object: {}", other)),
    }
}

// The `_mut` helpers fail before touching the slot, except to fill an
// absent one with an empty container

fn ids_mut(slot: &mut Option<Value>) -> Result<&mut Vec<Value>> {
    match slot.get_or_insert_with(|| Value::Array(Vec::new())) {
        Value::Array(ids) => Ok(ids),
        other => Err(eyre!("liveIds is not a list: {}", other)),
    }
}

fn records_mut(slot: &mut Option<Value>) -> Result<&mut Map<String, Value>> {
    match slot.get_or_insert_with(|| Value::Object(Map::new())) {
        Value::Object(records) => Ok(records),
        other => Err(eyre!("records is not an object: {}", other)),
    }
}

fn parse_id(key: &str) -> Result<i64> {
    key.parse::<i64>().wrap_err_with(|| format!("Invalid record key: {}", key))
}

fn validate_namespace(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(eyre!("Namespace cannot be empty"));
    }
    if name.len() > 64 {
        return Err(eyre!("Namespace too long: {} (max 64 chars)", name));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(eyre!("Invalid namespace: {} (must be alphanumeric with _/-)", name));
    }
    Ok(())
}
