//! Key comparison protocol.
//!
//! All ordered lookups go through [`compare_keys`]: a cheap prefix compare
//! first, then - only when the prefix cannot decide - materialization of
//! the full keys (through the extended-key cache) and the full compare.
//!
//! Compare hooks are installable per database; the defaults implement the
//! engine's on-disk ordering contract.

use std::cmp::Ordering;

use crate::cache::PageManager;
use crate::keys::ExtkeyCache;
use crate::storage::blob;
use crate::common::Result;

/// Verdict of a prefix compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixDecision {
    /// The in-node prefixes already decide the order.
    Decided(Ordering),
    /// The prefixes tie; the full keys must be materialized.
    NeedFullKey,
}

/// Full-key compare hook.
pub type FullCompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Prefix compare hook: `(lhs_prefix, lhs_full_len, rhs_prefix,
/// rhs_full_len)`.
pub type PrefixCompareFn = fn(&[u8], usize, &[u8], usize) -> PrefixDecision;

/// The compare hooks installed on a database.
#[derive(Clone, Copy)]
pub struct CompareHooks {
    pub full: FullCompareFn,
    pub prefix: Option<PrefixCompareFn>,
}

impl Default for CompareHooks {
    fn default() -> Self {
        Self {
            full: default_full_compare,
            prefix: Some(default_prefix_compare),
        }
    }
}

impl std::fmt::Debug for CompareHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompareHooks")
            .field("prefix", &self.prefix.is_some())
            .finish()
    }
}

/// Lexicographic memcmp with the shorter-key-is-greater tiebreak.
///
/// The tiebreak is part of the on-disk ordering contract: when one key is
/// a prefix of the other, the *shorter* key orders after the longer one.
pub fn default_full_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let common = lhs.len().min(rhs.len());
    match lhs[..common].cmp(&rhs[..common]) {
        Ordering::Equal => {
            // Shorter is greater.
            rhs.len().cmp(&lhs.len())
        }
        decided => decided,
    }
}

/// Compare the memcmp'd common prefix, or signal for the full keys when
/// the prefixes tie.
pub fn default_prefix_compare(
    lhs: &[u8],
    _lhs_full_len: usize,
    rhs: &[u8],
    _rhs_full_len: usize,
) -> PrefixDecision {
    let common = lhs.len().min(rhs.len());
    match lhs[..common].cmp(&rhs[..common]) {
        Ordering::Equal => PrefixDecision::NeedFullKey,
        decided => PrefixDecision::Decided(decided),
    }
}

/// A key as the comparator sees it: the in-node bytes, the full length,
/// and whether a suffix blob exists.
///
/// For an extended key the slot is `key_size` bytes: the first
/// `key_size - 8` bytes of the key followed by the little-endian offset of
/// the suffix blob.
#[derive(Debug, Clone)]
pub struct NodeKey {
    pub slot: Vec<u8>,
    pub len: usize,
    pub extended: bool,
}

impl NodeKey {
    /// Wrap a caller-supplied key (never extended).
    pub fn from_user(key: &[u8]) -> Self {
        Self {
            slot: key.to_vec(),
            len: key.len(),
            extended: false,
        }
    }

    /// The in-node prefix bytes.
    pub fn prefix(&self) -> &[u8] {
        if self.extended {
            &self.slot[..self.slot.len() - 8]
        } else {
            &self.slot
        }
    }

    /// The suffix blob offset of an extended key.
    ///
    /// # Panics
    /// Panics if the key is not extended.
    pub fn blob_id(&self) -> u64 {
        assert!(self.extended, "blob_id of a non-extended key");
        let at = self.slot.len() - 8;
        u64::from_le_bytes(self.slot[at..].try_into().unwrap())
    }
}

/// Reassemble the full bytes of a key.
///
/// Extended keys consult the extended-key cache first; on a miss the
/// suffix blob is read and the result is cached best-effort (a full cache
/// just means the caller proceeds uncached). In-memory databases pass
/// `extkeys = None` and always read the arena blob.
pub fn materialize_key(
    pager: &mut PageManager,
    extkeys: Option<&mut ExtkeyCache>,
    key: &NodeKey,
) -> Result<Vec<u8>> {
    if !key.extended {
        return Ok(key.slot.clone());
    }

    let blob_id = key.blob_id();
    if let Some(cache) = &extkeys {
        if let Ok(full) = cache.fetch(blob_id) {
            return Ok(full.to_vec());
        }
    }

    let suffix = blob::blob_read(pager.device_mut(), blob_id)?;
    let mut full = Vec::with_capacity(key.prefix().len() + suffix.len());
    full.extend_from_slice(key.prefix());
    full.extend_from_slice(&suffix);

    if let Some(cache) = extkeys {
        let used = pager.resident_bytes();
        let capacity = pager.capacity();
        let _ = cache.insert(blob_id, full.clone(), used, capacity);
    }

    Ok(full)
}

/// The two-stage compare entry point.
///
/// 1. Neither side extended: straight to the full compare.
/// 2. A prefix hook, if installed, gets a chance to decide on the in-node
///    bytes alone.
/// 3. Otherwise both sides are materialized and the full compare decides.
pub fn compare_keys(
    pager: &mut PageManager,
    mut extkeys: Option<&mut ExtkeyCache>,
    hooks: &CompareHooks,
    lhs: &NodeKey,
    rhs: &NodeKey,
) -> Result<Ordering> {
    if !lhs.extended && !rhs.extended {
        return Ok((hooks.full)(&lhs.slot, &rhs.slot));
    }

    if let Some(prefix_fn) = hooks.prefix {
        match prefix_fn(lhs.prefix(), lhs.len, rhs.prefix(), rhs.len) {
            PrefixDecision::Decided(ordering) => return Ok(ordering),
            PrefixDecision::NeedFullKey => {}
        }
    }

    let lhs_full = materialize_key(pager, extkeys.as_deref_mut(), lhs)?;
    let rhs_full = materialize_key(pager, extkeys.as_deref_mut(), rhs)?;
    Ok((hooks.full)(&lhs_full, &rhs_full))
}
