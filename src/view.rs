//! Group view: ordered members and metadata with a rolling content digest.
//!
//! The digest is the XOR of one 64-bit hash per entry, maintained
//! incrementally on every mutation. Two views holding the same content
//! always report the same digest, which lets the view-sync RPC skip the
//! transfer when nothing changed.

use crate::types::{FlockError, MemberId};

/// One participating endpoint as recorded in a view.
///
/// `rank` is assigned by the backend that added the member and is never
/// reused. `address` is an opaque transport endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub rank: u64,
    pub provider_id: u16,
    pub address: String,
}

impl Member {
    pub fn id(&self) -> MemberId {
        MemberId::new(self.address.clone(), self.provider_id)
    }
}

/// A `(key, value)` pair of UTF-8 strings attached to the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

// =============================================================================
// ENTRY HASHING
// =============================================================================
// Per-entry hashes are XORed into the digest on insert and XORed out on
// removal. XOR is its own inverse, so any sequence of mutations leaves the
// digest equal to the XOR of the hashes of exactly the current entries.

fn djb2(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in bytes {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(b as u64);
    }
    hash
}

/// Continue the djb2 roll over extra bytes, folding each in with XOR.
fn djb2_fold(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash = (hash << 5).wrapping_add(hash) ^ (b as u64);
    }
    hash
}

fn member_hash(rank: u64, provider_id: u16, address: &str) -> u64 {
    let hash = djb2(address.as_bytes());
    let hash = djb2_fold(hash, &rank.to_le_bytes());
    djb2_fold(hash, &provider_id.to_le_bytes())
}

/// The rotation keeps `(k, v)` distinct from `(v, k)`.
fn metadata_hash(key: &str, value: &str) -> u64 {
    djb2(key.as_bytes()) ^ djb2(value.as_bytes()).rotate_left(3)
}

/// In-memory snapshot of a group's members and metadata.
///
/// Members are kept strictly ordered by rank, metadata strictly ordered by
/// key; both orderings admit binary search. The view itself is plain data:
/// owners that share it across tasks wrap it in a mutex and never hold the
/// guard across a suspension point.
#[derive(Debug, Default, Clone)]
pub struct GroupView {
    members: Vec<Member>,
    metadata: Vec<MetadataEntry>,
    digest: u64,
}

impl GroupView {
    pub fn new() -> Self {
        Self::default()
    }

    /// XOR digest over the current content. Zero for an empty view.
    pub fn digest(&self) -> u64 {
        self.digest
    }

    /// Group size as reported to clients: `last.rank + 1`, or 0 when empty.
    ///
    /// Ranks are never reused, so this counts every rank ever assigned, not
    /// the members currently alive. See [`GroupView::live_count`].
    pub fn size(&self) -> u64 {
        self.members.last().map(|m| m.rank + 1).unwrap_or(0)
    }

    /// Number of members currently in the view.
    pub fn live_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.metadata.is_empty()
    }

    /// The rank a backend should assign to the next member it adds.
    pub fn next_rank(&self) -> u64 {
        self.size()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn metadata(&self) -> &[MetadataEntry] {
        &self.metadata
    }

    /// Insert a member at its rank position.
    ///
    /// Rejects a duplicate `(address, provider_id)` identity with
    /// `InvalidArgs` and a duplicate rank with `RankUsed`. On success the
    /// digest absorbs the new entry's hash.
    pub fn add_member(
        &mut self,
        rank: u64,
        provider_id: u16,
        address: impl Into<String>,
    ) -> Result<&Member, FlockError> {
        let address = address.into();

        if self.find_member(&address, provider_id).is_some() {
            return Err(FlockError::InvalidArgs(format!(
                "member {address}#{provider_id} already present"
            )));
        }

        let pos = match self.members.binary_search_by_key(&rank, |m| m.rank) {
            Ok(_) => return Err(FlockError::RankUsed(rank)),
            Err(pos) => pos,
        };

        self.digest ^= member_hash(rank, provider_id, &address);
        self.members.insert(pos, Member { rank, provider_id, address });
        Ok(&self.members[pos])
    }

    /// Remove the member with this identity. Returns whether it was present.
    pub fn remove_member(&mut self, address: &str, provider_id: u16) -> bool {
        let Some(pos) = self
            .members
            .iter()
            .position(|m| m.address == address && m.provider_id == provider_id)
        else {
            return false;
        };
        let member = self.members.remove(pos);
        self.digest ^= member_hash(member.rank, member.provider_id, &member.address);
        true
    }

    /// Remove the member at a position. Returns the removed entry.
    pub fn remove_member_at(&mut self, index: usize) -> Option<Member> {
        if index >= self.members.len() {
            return None;
        }
        let member = self.members.remove(index);
        self.digest ^= member_hash(member.rank, member.provider_id, &member.address);
        Some(member)
    }

    /// Look up a member by identity.
    ///
    /// Members are ordered by rank, so identity lookup is a scan; rank and
    /// positional lookups bisect.
    pub fn find_member(&self, address: &str, provider_id: u16) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.address == address && m.provider_id == provider_id)
    }

    pub fn find_member_by_rank(&self, rank: u64) -> Option<&Member> {
        self.members
            .binary_search_by_key(&rank, |m| m.rank)
            .ok()
            .map(|pos| &self.members[pos])
    }

    /// Bounds-checked positional access.
    pub fn member_at(&self, index: usize) -> Option<&Member> {
        self.members.get(index)
    }

    /// Rank of the member with this identity.
    pub fn rank_of(&self, address: &str, provider_id: u16) -> Result<u64, FlockError> {
        self.find_member(address, provider_id)
            .map(|m| m.rank)
            .ok_or(FlockError::NoMember)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.find_member(&id.address, id.provider_id).is_some()
    }

    /// Insert or replace a metadata entry. Returns true when an existing
    /// value was replaced.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();

        match self.metadata.binary_search_by(|e| e.key.as_str().cmp(&key)) {
            Ok(pos) => {
                let entry = &mut self.metadata[pos];
                self.digest ^= metadata_hash(&entry.key, &entry.value);
                self.digest ^= metadata_hash(&key, &value);
                entry.value = value;
                true
            }
            Err(pos) => {
                self.digest ^= metadata_hash(&key, &value);
                self.metadata.insert(pos, MetadataEntry { key, value });
                false
            }
        }
    }

    /// Remove a metadata entry. Returns whether the key was present.
    pub fn remove_metadata(&mut self, key: &str) -> bool {
        match self.metadata.binary_search_by(|e| e.key.as_str().cmp(key)) {
            Ok(pos) => {
                let entry = self.metadata.remove(pos);
                self.digest ^= metadata_hash(&entry.key, &entry.value);
                true
            }
            Err(_) => false,
        }
    }

    pub fn find_metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .binary_search_by(|e| e.key.as_str().cmp(key))
            .ok()
            .map(|pos| self.metadata[pos].value.as_str())
    }

    /// Drop all content. The digest returns to zero.
    pub fn clear(&mut self) {
        self.members.clear();
        self.metadata.clear();
        self.digest = 0;
    }

    /// Transfer all content into `dst`, assumed empty. The source is left
    /// empty with digest zero.
    pub fn move_into(&mut self, dst: &mut GroupView) {
        debug_assert!(dst.is_empty());
        dst.members = std::mem::take(&mut self.members);
        dst.metadata = std::mem::take(&mut self.metadata);
        dst.digest = self.digest;
        self.digest = 0;
    }
}
