//! Persisted state handed to storage.
//!
//! The engine does not own storage. It pushes records through a
//! [`StateSink`] given at construction; [`MemoryStateSink`] keeps them in a
//! keyed map of bincode blobs.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::SinkError;
use crate::node::{NodeKey, NodeState};
use crate::quorum::{Quorum, QuorumType};
use crate::swarm::SwarmId;

/// Per-node state as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: NodeKey,
    pub state: NodeState,
    pub swarm_id: SwarmId,
    /// Decommission credit in blocks.
    pub credit: u64,
    /// Height of the last change to any other field.
    pub height: u64,
}

impl NodeRecord {
    /// Equal apart from `height`.
    pub fn same_state(&self, other: &NodeRecord) -> bool {
        self.key == other.key
            && self.state == other.state
            && self.swarm_id == other.swarm_id
            && self.credit == other.credit
    }
}

/// Receiver for persisted records.
pub trait StateSink {
    fn store_quorum(&mut self, quorum: &Quorum) -> Result<(), SinkError>;

    fn store_node(&mut self, record: &NodeRecord) -> Result<(), SinkError>;

    fn remove_node(&mut self, key: &NodeKey) -> Result<(), SinkError>;

    fn store_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), SinkError>;

    /// Drop quorum snapshots below `height`.
    fn prune_quorums(&mut self, below: u64) -> Result<(), SinkError>;
}

/// In-memory sink.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateSink {
    entries: BTreeMap<String, Vec<u8>>,
}

fn quorum_key(height: u64, quorum_type: QuorumType) -> String {
    // Zero padded so keys sort by height.
    format!("quorum:{height:020}:{}", quorum_type.tag())
}

fn node_key(key: &NodeKey) -> String {
    format!("node:{}", key.to_hex())
}

fn checkpoint_key(height: u64) -> String {
    format!("checkpoint:{height:020}")
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SinkError> {
        match self.entries.get(key) {
            Some(data) => Ok(Some(bincode::deserialize(data)?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, SinkError> {
        let mut values = Vec::new();
        for (key, data) in self.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            values.push(bincode::deserialize(data)?);
        }
        Ok(values)
    }

    pub fn quorum(&self, height: u64, quorum_type: QuorumType) -> Result<Option<Quorum>, SinkError> {
        self.get(&quorum_key(height, quorum_type))
    }

    pub fn node(&self, key: &NodeKey) -> Result<Option<NodeRecord>, SinkError> {
        self.get(&node_key(key))
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord>, SinkError> {
        self.list("node:")
    }

    pub fn checkpoint(&self, height: u64) -> Result<Option<Checkpoint>, SinkError> {
        self.get(&checkpoint_key(height))
    }

    /// Stored checkpoints, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, SinkError> {
        self.list("checkpoint:")
    }

    pub fn quorum_count(&self) -> usize {
        self.entries.keys().filter(|k| k.starts_with("quorum:")).count()
    }
}

impl StateSink for MemoryStateSink {
    fn store_quorum(&mut self, quorum: &Quorum) -> Result<(), SinkError> {
        let value = bincode::serialize(quorum)?;
        self.entries.insert(quorum_key(quorum.height, quorum.quorum_type), value);
        Ok(())
    }

    fn store_node(&mut self, record: &NodeRecord) -> Result<(), SinkError> {
        let value = bincode::serialize(record)?;
        self.entries.insert(node_key(&record.key), value);
        Ok(())
    }

    fn remove_node(&mut self, key: &NodeKey) -> Result<(), SinkError> {
        self.entries.remove(&node_key(key));
        Ok(())
    }

    fn store_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), SinkError> {
        let value = bincode::serialize(checkpoint)?;
        self.entries.insert(checkpoint_key(checkpoint.height), value);
        Ok(())
    }

    fn prune_quorums(&mut self, below: u64) -> Result<(), SinkError> {
        let cutoff = format!("quorum:{below:020}");
        self.entries
            .retain(|k, _| !k.starts_with("quorum:") || k.as_str() >= cutoff.as_str());
        Ok(())
    }
}
