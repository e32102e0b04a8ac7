use serde::{Deserialize, Serialize};

use crate::models::load::{Load, LoadId};

/// One accepted mutation, as published on the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadEvent {
    pub sequence: u64,
    pub load_id: LoadId,
    pub load: Load,
}

/// Table contents captured together with the feed position they reflect.
/// The first event a subscriber receives after this snapshot has
/// sequence `as_of + 1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub as_of: u64,
    pub loads: Vec<Load>,
}
