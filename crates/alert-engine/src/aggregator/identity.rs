//! Alert identity: fingerprints and shard assignment

use crate::models::Labels;
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest
const FINGERPRINT_LEN: usize = 16;

/// Stable identity of a (rule, label group)
pub fn fingerprint(rule_id: &str, group_labels: &Labels) -> String {
    let mut hasher = Sha256::new();
    // Labels are ordered, so the digest does not depend on insertion order.
    // Every part is length prefixed, which keeps `a="b=c"` and `a=b="c"`
    // apart, and likewise the rule id and the first label name.
    let parts = group_labels
        .iter()
        .flat_map(|(name, value)| [name.as_str(), value.as_str()]);
    for part in std::iter::once(rule_id).chain(parts) {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// Shard owning a fingerprint
pub fn shard_index(fingerprint: &str, shards: usize) -> usize {
    let prefix = fingerprint.get(..8).unwrap_or(fingerprint);
    let hash = u64::from_str_radix(prefix, 16).unwrap_or_else(|_| {
        fingerprint
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
    });
    (hash % shards.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_stable_and_scoped() {
        let web01 = labels(&[("host", "web-01")]);
        let fp = fingerprint("R1", &web01);

        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert_eq!(fp, fingerprint("R1", &labels(&[("host", "web-01")])));
        assert_ne!(fp, fingerprint("R2", &web01));
        assert_ne!(fp, fingerprint("R1", &labels(&[("host", "web-02")])));
    }

    #[test]
    fn test_label_boundaries_do_not_collide() {
        let a = labels(&[("a", "b=c")]);
        let b = labels(&[("a=b", "c")]);
        // Same concatenation, different structure
        assert_ne!(fingerprint("R", &a), fingerprint("R", &b));
    }

    #[test]
    fn test_rule_id_and_labels_do_not_collide() {
        // A rule id that spells out the encoding of the label `b=""`
        let spoofed = "a\u{1}\0\0\0\0\0\0\0b\0\0\0\0\0\0\0\0";
        assert_ne!(
            fingerprint(spoofed, &Labels::new()),
            fingerprint("a", &labels(&[("b", "")]))
        );
        assert_ne!(fingerprint("R1", &Labels::new()), fingerprint("R", &labels(&[("1", "")])));
    }

    #[test]
    fn test_shard_index_in_range() {
        for i in 0..100 {
            let fp = fingerprint("R1", &labels(&[("host", &format!("web-{}", i))]));
            assert!(shard_index(&fp, 16) < 16);
        }
        assert_eq!(shard_index("not-hex", 1), 0);
    }
}
