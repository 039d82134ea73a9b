//! Primary-key indexing: the cuckoo hash table mapping `(table id, key)`
//! to record heads, and the per-GC-pass insert map for keys that still
//! live only in the log.

mod cuckoo;
mod insert_map;

pub use cuckoo::{CuckooHash, InsertOutcome, Modifier};
pub use insert_map::InsertMap;
