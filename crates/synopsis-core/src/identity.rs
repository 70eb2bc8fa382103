//! Content identities for sources, summaries and requests.
//!
//! Every identity is a lowercase SHA-256 hex digest (64 characters).
//! Source and summary identities are pure functions of their inputs, so
//! they are stable across process restarts. Request identities mix in a
//! fresh UUID v4 so that two submissions of identical content never share
//! a handle.
//!
//! ```rust
//! use synopsis_core::identity::{source_identity, summary_identity};
//! use synopsis_core::models::Params;
//!
//! let id = source_identity("Some text.");
//! assert_eq!(id.len(), 64);
//! assert_eq!(summary_identity("a", "t5", &Params::new()),
//!            summary_identity("a", "t5", &Params::new()));
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Params;

/// Separates hashed fields so that `("ab", "c")` and `("a", "bc")` differ.
const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// Identity of a source text.
pub fn source_identity(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of a summary: text, model name and canonical parameters.
pub fn summary_identity(text: &str, model: &str, params: &Params) -> String {
    let hasher = summary_hasher(text, model, params);
    format!("{:x}", hasher.finalize())
}

/// Identity of a single client request. Unique per call.
pub fn request_identity(text: &str, model: &str, params: &Params) -> String {
    let mut hasher = summary_hasher(text, model, params);
    hasher.update(FIELD_SEPARATOR);
    hasher.update(Uuid::new_v4().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether `id` has the shape of an identity produced by this module.
pub fn is_identity(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn summary_hasher(text: &str, model: &str, params: &Params) -> Sha256 {
    // Params is a BTreeMap and serde_json objects are sorted maps, so the
    // serialization is independent of insertion order at every depth.
    let params_json = serde_json::to_vec(params).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(model.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(&params_json);
    hasher
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_source_identity_known_digest() {
        assert_eq!(
            source_identity(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(is_identity(&source_identity("hello")));
    }

    #[test]
    fn test_summary_identity_deterministic() {
        let p = params(&[("num_beams", json!(4))]);
        let a = summary_identity("text", "t5", &p);
        let b = summary_identity("text", "t5", &p.clone());
        assert_eq!(a, b);
        assert!(is_identity(&a));
    }

    #[test]
    fn test_summary_identity_ignores_key_order() {
        let mut forward = Params::new();
        forward.insert("top_k".into(), json!(50));
        forward.insert("do_sample".into(), json!(true));
        let mut backward = Params::new();
        backward.insert("do_sample".into(), json!(true));
        backward.insert("top_k".into(), json!(50));
        assert_eq!(
            summary_identity("text", "t5", &forward),
            summary_identity("text", "t5", &backward)
        );
    }

    #[test]
    fn test_summary_identity_field_boundaries() {
        let p = Params::new();
        assert_ne!(
            summary_identity("ab", "c", &p),
            summary_identity("a", "bc", &p)
        );
    }

    #[test]
    fn test_summary_identity_sensitive_to_every_input() {
        let p = params(&[("num_beams", json!(4))]);
        let base = summary_identity("text", "t5", &p);
        assert_ne!(base, summary_identity("text!", "t5", &p));
        assert_ne!(base, summary_identity("text", "bart", &p));
        assert_ne!(
            base,
            summary_identity("text", "t5", &params(&[("num_beams", json!(5))]))
        );
    }

    #[test]
    fn test_request_identity_unique() {
        let p = Params::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = request_identity("same text", "t5", &p);
            assert!(is_identity(&id));
            assert!(seen.insert(id), "request identity collided");
        }
    }

    #[test]
    fn test_request_identity_differs_from_summary_identity() {
        let p = Params::new();
        assert_ne!(
            request_identity("text", "t5", &p),
            summary_identity("text", "t5", &p)
        );
    }
}
