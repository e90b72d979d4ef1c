//! Capped in-memory blob store
//!
//! Holds at most `capacity_bytes` of payload. Writes past the cap evict the
//! oldest blobs first, so readers must tolerate `None` for old ids.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::BlobId;
use crate::storage_traits::{BlobStore, StorageResult};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug)]
struct Ring {
    blobs: VecDeque<(BlobId, Vec<u8>)>,
    used_bytes: usize,
    next_id: u64,
}

/// Bounded, append-only [`BlobStore`] with oldest-first eviction.
#[derive(Debug)]
pub struct CappedBlobStore {
    capacity_bytes: usize,
    ring: Mutex<Ring>,
}

impl CappedBlobStore {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            ring: Mutex::new(Ring {
                blobs: VecDeque::new(),
                used_bytes: 0,
                next_id: 1,
            }),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently retained.
    pub fn used_bytes(&self) -> usize {
        self.ring.lock().used_bytes
    }

    /// Test hook: overwrite a stored blob in place.
    pub fn corrupt(&self, id: BlobId, bytes: Vec<u8>) -> bool {
        let mut ring = self.ring.lock();
        match ring.blobs.iter_mut().find(|(blob_id, _)| *blob_id == id) {
            Some(slot) => {
                let old_len = slot.1.len();
                slot.1 = bytes;
                let new_len = slot.1.len();
                ring.used_bytes = ring.used_bytes - old_len + new_len;
                true
            }
            None => false,
        }
    }

    fn append(&self, bytes: Vec<u8>) -> StorageResult<BlobId> {
        if bytes.len() > self.capacity_bytes {
            return Err(StorageError::PayloadTooLarge {
                size: bytes.len(),
                capacity: self.capacity_bytes,
            });
        }
        let mut ring = self.ring.lock();
        while ring.used_bytes + bytes.len() > self.capacity_bytes {
            match ring.blobs.pop_front() {
                Some((evicted, old)) => {
                    ring.used_bytes -= old.len();
                    debug!(blob = %evicted, bytes = old.len(), "evicted blob");
                }
                None => break,
            }
        }
        let id = BlobId(ring.next_id);
        ring.next_id += 1;
        ring.used_bytes += bytes.len();
        ring.blobs.push_back((id, bytes));
        Ok(id)
    }

    fn lookup(&self, id: BlobId) -> Option<Vec<u8>> {
        let ring = self.ring.lock();
        // Ids are pushed in increasing order.
        ring.blobs
            .binary_search_by_key(&id, |(blob_id, _)| *blob_id)
            .ok()
            .and_then(|idx| ring.blobs.get(idx))
            .map(|(_, bytes)| bytes.clone())
    }
}

/// Frame messages as `u32` big-endian length followed by the bytes.
fn encode_messages(messages: &[Vec<u8>]) -> StorageResult<Vec<u8>> {
    let total: usize = messages.iter().map(|m| m.len() + LENGTH_PREFIX).sum();
    let mut out = Vec::with_capacity(total);
    for message in messages {
        let len = u32::try_from(message.len()).map_err(|_| {
            StorageError::Serialization(format!("message of {} bytes too long", message.len()))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(message);
    }
    Ok(out)
}

fn decode_messages(id: BlobId, bytes: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
    let mut messages = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (prefix, tail) = rest
            .split_first_chunk::<LENGTH_PREFIX>()
            .ok_or_else(|| StorageError::Serialization(format!("{id}: truncated length prefix")))?;
        let len = u32::from_be_bytes(*prefix) as usize;
        if tail.len() < len {
            return Err(StorageError::Serialization(format!(
                "{id}: message claims {len} bytes, {} remain",
                tail.len()
            )));
        }
        let (message, next) = tail.split_at(len);
        messages.push(message.to_vec());
        rest = next;
    }
    Ok(messages)
}

#[async_trait]
impl BlobStore for CappedBlobStore {
    async fn write(&self, bytes: &[u8]) -> StorageResult<BlobId> {
        self.append(bytes.to_vec())
    }

    async fn write_many(&self, messages: &[Vec<u8>]) -> StorageResult<BlobId> {
        self.append(encode_messages(messages)?)
    }

    async fn read(&self, id: BlobId) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.lookup(id))
    }

    async fn read_many(&self, id: BlobId) -> StorageResult<Option<Vec<Vec<u8>>>> {
        match self.lookup(id) {
            Some(bytes) => decode_messages(id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn smallest_non_expired_id(&self) -> StorageResult<BlobId> {
        let ring = self.ring.lock();
        Ok(ring
            .blobs
            .front()
            .map(|(id, _)| *id)
            .unwrap_or(BlobId(ring.next_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_increase_and_round_trip() {
        let store = CappedBlobStore::new(1024);
        let a = store.write(b"alpha").await.unwrap();
        let b = store.write(b"beta").await.unwrap();
        assert!(b > a);
        assert_eq!(store.read(a).await.unwrap().as_deref(), Some(&b"alpha"[..]));
        assert_eq!(store.used_bytes(), 9);
    }

    #[tokio::test]
    async fn oldest_blobs_are_evicted_first() {
        let store = CappedBlobStore::new(10);
        let a = store.write(&[1; 4]).await.unwrap();
        let b = store.write(&[2; 4]).await.unwrap();
        let c = store.write(&[3; 4]).await.unwrap();
        assert_eq!(store.read(a).await.unwrap(), None);
        assert!(store.read(b).await.unwrap().is_some());
        assert!(store.read(c).await.unwrap().is_some());
        assert_eq!(store.smallest_non_expired_id().await.unwrap(), b);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let store = CappedBlobStore::new(3);
        let err = store.write(&[0; 4]).await.unwrap_err();
        assert_eq!(
            err,
            StorageError::PayloadTooLarge {
                size: 4,
                capacity: 3
            }
        );
    }

    #[tokio::test]
    async fn write_many_preserves_message_boundaries() {
        let store = CappedBlobStore::new(1024);
        let messages = vec![b"one".to_vec(), Vec::new(), b"three".to_vec()];
        let id = store.write_many(&messages).await.unwrap();
        assert_eq!(store.read_many(id).await.unwrap(), Some(messages));
    }

    #[tokio::test]
    async fn truncated_framing_is_a_serialization_error() {
        let store = CappedBlobStore::new(1024);
        let id = store.write(&[0, 0, 0, 9, 1, 2]).await.unwrap();
        let err = store.read_many(id).await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
