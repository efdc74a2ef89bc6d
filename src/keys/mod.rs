//! Keys - the extended-key cache and the comparison protocol.

mod compare;
mod extkey_cache;

pub use compare::{
    compare_keys, default_full_compare, default_prefix_compare, materialize_key, CompareHooks,
    FullCompareFn, NodeKey, PrefixCompareFn, PrefixDecision,
};
pub use extkey_cache::ExtkeyCache;
