//! Deterministic node IDs
//!
//! IDs are the first 16 bytes of `BLAKE3("<kind>:<key>")`, little-endian.
//! The same key always maps to the same ID, so a rebuild reproduces the
//! IDs of the previous graph and query results stay stable across builds.

use crate::storage::LabelKind;

/// Kind prefix for image nodes.
pub const IMAGE_KIND: &str = "Image";

/// Hash `kind:key` into a 128-bit node ID.
pub fn compute_node_id(kind: &str, key: &str) -> u128 {
    let hash = blake3::hash(format!("{}:{}", kind, key).as_bytes());
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&hash.as_bytes()[0..16]);
    u128::from_le_bytes(buf)
}

/// ID of the image node keyed by normalized file name.
pub fn image_node_id(key: &str) -> u128 {
    compute_node_id(IMAGE_KIND, key)
}

/// ID of a label node.
pub fn label_node_id(kind: LabelKind, name: &str) -> u128 {
    compute_node_id(kind.as_str(), name)
}

/// Order-independent edge ID: `e{min}-{max}`.
///
/// A mutual similarity edge discovered from either endpoint gets the same ID.
pub fn edge_id(a: u128, b: u128) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("e{}-{}", lo, hi)
}
