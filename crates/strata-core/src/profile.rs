//! Stack-sample profile trees
//!
//! A profile is stored in the blob store as one delimited message per root
//! node. Merging reads every referenced blob, folds the trees together by
//! frame, and writes the result as a new blob. References below the blob
//! store's smallest live id were evicted and are skipped.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use strata_store::{BlobId, BlobStore};
use tracing::debug;

use crate::error::{Result, RollupError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileNode {
    pub frame: String,
    pub sample_count: u64,
    #[serde(default)]
    pub children: Vec<ProfileNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub roots: Vec<ProfileNode>,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn sample_count(&self) -> u64 {
        self.roots.iter().map(|r| r.sample_count).sum()
    }

    pub fn merge(&mut self, other: Profile) {
        merge_nodes(&mut self.roots, other.roots);
    }
}

fn merge_nodes(target: &mut Vec<ProfileNode>, source: Vec<ProfileNode>) {
    for node in source {
        match target.iter_mut().find(|t| t.frame == node.frame) {
            Some(existing) => {
                existing.sample_count += node.sample_count;
                merge_nodes(&mut existing.children, node.children);
            }
            None => target.push(node),
        }
    }
}

/// Write `profile` as one blob; `None` for an empty profile.
pub async fn write_profile(blobs: &dyn BlobStore, profile: &Profile) -> Result<Option<BlobId>> {
    if profile.is_empty() {
        return Ok(None);
    }
    let messages = profile
        .roots
        .iter()
        .map(serde_json::to_vec)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RollupError::corrupt("profile", e))?;
    Ok(Some(blobs.write_many(&messages).await?))
}

/// Read one profile blob. `None` when it was evicted.
pub async fn read_profile(blobs: &dyn BlobStore, id: BlobId) -> Result<Option<Profile>> {
    let Some(messages) = blobs.read_many(id).await? else {
        return Ok(None);
    };
    let roots = messages
        .iter()
        .map(|m| serde_json::from_slice::<ProfileNode>(m))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RollupError::corrupt(format!("profile {id}"), e))?;
    Ok(Some(Profile { roots }))
}

/// Merge every live profile among `ids`.
pub async fn merge_profiles(blobs: &Arc<dyn BlobStore>, ids: &[BlobId]) -> Result<Profile> {
    let mut merged = Profile::default();
    if ids.is_empty() {
        return Ok(merged);
    }
    let smallest = blobs.smallest_non_expired_id().await?;
    let live: Vec<BlobId> = ids.iter().copied().filter(|id| *id >= smallest).collect();
    if live.len() < ids.len() {
        debug!(
            skipped = ids.len() - live.len(),
            "skipping evicted profile references"
        );
    }
    let profiles = try_join_all(live.iter().map(|id| read_profile(blobs.as_ref(), *id))).await?;
    for profile in profiles.into_iter().flatten() {
        merged.merge(profile);
    }
    Ok(merged)
}

/// Merge `ids` and store the result as a new blob.
pub async fn merge_and_store(blobs: &Arc<dyn BlobStore>, ids: &[BlobId]) -> Result<Option<BlobId>> {
    if ids.is_empty() {
        return Ok(None);
    }
    let merged = merge_profiles(blobs, ids).await?;
    write_profile(blobs.as_ref(), &merged).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::CappedBlobStore;

    fn node(frame: &str, samples: u64, children: Vec<ProfileNode>) -> ProfileNode {
        ProfileNode {
            frame: frame.to_string(),
            sample_count: samples,
            children,
        }
    }

    fn blobs(capacity: usize) -> Arc<dyn BlobStore> {
        Arc::new(CappedBlobStore::new(capacity))
    }

    #[test]
    fn merge_folds_matching_frames() {
        let mut a = Profile {
            roots: vec![node("main", 3, vec![node("work", 3, vec![])])],
        };
        let b = Profile {
            roots: vec![
                node("main", 2, vec![node("work", 1, vec![]), node("io", 1, vec![])]),
                node("gc", 4, vec![]),
            ],
        };
        a.merge(b);
        assert_eq!(a.roots.len(), 2);
        assert_eq!(a.roots[0].sample_count, 5);
        assert_eq!(a.roots[0].children[0].sample_count, 4);
        assert_eq!(a.roots[0].children[1].frame, "io");
        assert_eq!(a.sample_count(), 9);
    }

    #[tokio::test]
    async fn merge_and_store_writes_one_blob() {
        let store = blobs(1 << 20);
        let p1 = Profile {
            roots: vec![node("main", 1, vec![])],
        };
        let p2 = Profile {
            roots: vec![node("main", 2, vec![])],
        };
        let id1 = write_profile(store.as_ref(), &p1).await.unwrap().unwrap();
        let id2 = write_profile(store.as_ref(), &p2).await.unwrap().unwrap();

        let merged_id = merge_and_store(&store, &[id1, id2]).await.unwrap().unwrap();
        let merged = read_profile(store.as_ref(), merged_id).await.unwrap().unwrap();
        assert_eq!(merged.sample_count(), 3);
    }

    #[tokio::test]
    async fn evicted_references_are_skipped() {
        let store = blobs(100);
        let big = Profile {
            roots: vec![node("a".repeat(20).as_str(), 1, vec![])],
        };
        let old = write_profile(store.as_ref(), &big).await.unwrap().unwrap();
        let newer = write_profile(store.as_ref(), &big).await.unwrap().unwrap();
        let newest = write_profile(store.as_ref(), &big).await.unwrap().unwrap();
        assert!(store.read(old).await.unwrap().is_none());

        let merged = merge_profiles(&store, &[old, newer, newest]).await.unwrap();
        assert!(store.read(newer).await.unwrap().is_none());
        assert_eq!(merged.sample_count(), 1);
    }

    #[tokio::test]
    async fn corrupt_blob_fails_the_merge() {
        let store = blobs(1 << 20);
        let bad = store.write_many(&[b"not json".to_vec()]).await.unwrap();
        let err = merge_profiles(&store, &[bad]).await.unwrap_err();
        assert!(matches!(err, RollupError::CorruptPayload { .. }));
    }

    #[tokio::test]
    async fn empty_profile_is_not_stored() {
        let store = blobs(1 << 20);
        assert_eq!(write_profile(store.as_ref(), &Profile::default()).await.unwrap(), None);
        assert_eq!(merge_and_store(&store, &[]).await.unwrap(), None);
    }
}
