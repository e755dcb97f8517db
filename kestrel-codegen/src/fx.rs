//! Fast, non-cryptographic hash maps for interior compiler data.

pub use rustc_hash::{FxHashMap, FxHashSet};
