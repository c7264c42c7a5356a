//! Application State Machine
//!
//! Committed data entries are handed to a [`StateMachine`] in index
//! order. The cluster treats entry payloads as opaque bytes; the
//! key/value machine here is the reference implementation.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wal::LogIndex;

/// Deterministic state machine driven by committed entries
pub trait StateMachine: Send {
    /// Apply a committed data entry
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<()>;

    /// Serialize the full state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the full state
    fn restore(&mut self, state: &[u8]) -> Result<()>;
}

/// Commands for the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// In-memory key-value store
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    last_applied: LogIndex,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode a serialized state image into its key/value pairs
    pub fn decode_image(state: &[u8]) -> Result<BTreeMap<String, String>> {
        if state.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(bincode::deserialize(state)?)
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, data: &[u8]) -> Result<()> {
        if index <= self.last_applied {
            return Err(Error::Internal(format!(
                "entry {} applied twice (last applied {})",
                index, self.last_applied
            )));
        }
        self.last_applied = index;
        match KvCommand::decode(data)? {
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.data)?)
    }

    fn restore(&mut self, state: &[u8]) -> Result<()> {
        self.data = Self::decode_image(state)?;
        self.last_applied = 0;
        Ok(())
    }
}
