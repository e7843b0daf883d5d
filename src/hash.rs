//! Content fingerprint. Deterministic, not required to be
//! cryptographically collision-resistant — only equal-content-implies-equal-hash
//! and the reverse for practical purposes (second-preimage resistance against
//! accidental duplicates).

use sha2::{Digest, Sha256};

use crate::classifier::find_write_type;
use crate::model::MimePayload;

/// Hash the write-type payload (falling back to hashing every payload's type
/// and bytes if none is found), prefixed by the MIME type length so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn data_hash(payloads: &[MimePayload]) -> String {
    let mut hasher = Sha256::new();

    match find_write_type(payloads) {
        Some(i) => hash_one(&mut hasher, &payloads[i]),
        None => {
            for p in payloads {
                hash_one(&mut hasher, p);
            }
        }
    }

    format!("{:x}", hasher.finalize())
}

fn hash_one(hasher: &mut Sha256, payload: &MimePayload) {
    hasher.update((payload.mime_type.len() as u64).to_le_bytes());
    hasher.update(payload.mime_type.as_bytes());
    hasher.update((payload.bytes.len() as u64).to_le_bytes());
    hasher.update(&payload.bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn equal_content_hashes_equal() {
        let a = vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"foo"))];
        let b = vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"foo"))];
        assert_eq!(data_hash(&a), data_hash(&b));
    }

    #[test]
    fn different_content_hashes_differ() {
        let a = vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"foo"))];
        let b = vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"bar"))];
        assert_ne!(data_hash(&a), data_hash(&b));
    }

    #[test]
    fn mime_type_boundary_does_not_collide() {
        let a = vec![MimePayload::new("ab", Bytes::from_static(b"c"))];
        let b = vec![MimePayload::new("a", Bytes::from_static(b"bc"))];
        assert_ne!(data_hash(&a), data_hash(&b));
    }
}
