use ahash::{AHasher, RandomState};
use std::{
    collections::BTreeMap,
    hash::{BuildHasher, Hash, Hasher},
};

/// Returns a hasher that is seeded identically for every caller, so that
/// fingerprints computed at different times in the process are comparable.
pub fn stable_hasher() -> AHasher {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
    .build_hasher()
}

/// Hashes a label map without depending on its iteration order.
pub fn hash_labels(labels: &BTreeMap<String, String>) -> u64 {
    labels.iter().fold(0, |acc, (k, v)| {
        let mut h = stable_hasher();
        k.hash(&mut h);
        0u8.hash(&mut h);
        v.hash(&mut h);
        0u8.hash(&mut h);
        acc ^ h.finish()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn label_hash_is_stable_and_content_sensitive() {
        let a = btreemap! {
            "app".to_string() => "web".to_string(),
            "version".to_string() => "v1".to_string(),
        };
        let b = a.clone();
        assert_eq!(hash_labels(&a), hash_labels(&b));

        let mut c = a.clone();
        c.insert("version".to_string(), "v2".to_string());
        assert_ne!(hash_labels(&a), hash_labels(&c));

        assert_eq!(hash_labels(&BTreeMap::new()), 0);
    }
}
