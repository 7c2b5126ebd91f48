//! Reference payload and depot
//!
//! `Parcel` is a keyed byte blob; `MemoryDepot` keeps one map of parcels per
//! registered peer.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use super::{
    Depot, Identity, ItemDescriptor, Registration, Serialized, Transferable, TransferError,
    TransferResult,
};

/// Keyed byte blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    pub key: String,
    pub body: Vec<u8>,
}

impl Parcel {
    pub fn new(key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }
}

impl Transferable for Parcel {
    fn descriptor(&self, batch_size: usize) -> TransferResult<ItemDescriptor> {
        ItemDescriptor::new(self.key.clone(), self.body.len(), batch_size)
    }

    fn serialize(&self, buffer: &mut BytesMut, offset: usize, batch_size: usize) -> Serialized {
        if offset >= self.body.len() {
            return Serialized::Exhausted;
        }
        let end = (offset + batch_size).min(self.body.len());
        buffer.put_slice(&self.body[offset..end]);
        Serialized::Next(end)
    }

    fn deserialize(&mut self, chunk: &[u8]) -> TransferResult<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

/// In-memory depot of parcels keyed by peer id, then parcel key
#[derive(Debug, Default)]
pub struct MemoryDepot {
    targets: RwLock<HashMap<String, HashMap<String, Parcel>>>,
    admitted: Option<HashSet<String>>,
}

impl MemoryDepot {
    /// A depot that registers every peer
    pub fn new() -> Self {
        Self::default()
    }

    /// A depot that only registers the listed peer ids
    pub fn restricted<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: RwLock::new(HashMap::new()),
            admitted: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn get(&self, peer_id: &str, key: &str) -> Option<Parcel> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        targets.get(peer_id)?.get(key).cloned()
    }

    /// Every parcel merged for a peer, sorted by key
    pub fn parcels(&self, peer_id: &str) -> Vec<Parcel> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        let mut parcels: Vec<Parcel> = targets
            .get(peer_id)
            .map(|parcels| parcels.values().cloned().collect())
            .unwrap_or_default();
        parcels.sort_by(|a, b| a.key.cmp(&b.key));
        parcels
    }

    pub fn peers(&self) -> usize {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Depot for MemoryDepot {
    type Item = Parcel;

    fn contains(&self, identity: &Identity) -> bool {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&identity.id)
    }

    fn register(&self, identity: &Identity) -> Registration {
        if let Some(admitted) = &self.admitted {
            if !admitted.contains(&identity.id) {
                return Registration::Rejected(format!(
                    "Registration denied for {} ({})",
                    identity.name, identity.id
                ));
            }
        }

        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.id.clone())
            .or_default();
        Registration::Accepted(format!("Registered {} ({})", identity.name, identity.id))
    }

    fn locate(&self, identity: &Identity, descriptor: &ItemDescriptor) -> TransferResult<Parcel> {
        if !self.contains(identity) {
            return Err(TransferError::MissingTarget(identity.id.clone()));
        }
        let capacity = usize::try_from(descriptor.size).unwrap_or(0);
        Ok(Parcel {
            key: descriptor.key.clone(),
            body: Vec::with_capacity(capacity),
        })
    }

    fn merge(&self, identity: &Identity, item: &Parcel) -> TransferResult<()> {
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        let target = targets
            .get_mut(&identity.id)
            .ok_or_else(|| TransferError::MissingTarget(identity.id.clone()))?;
        target.insert(item.key.clone(), item.clone());
        Ok(())
    }
}
