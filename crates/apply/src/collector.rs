//! Latest-status bookkeeping for wait conditions. Owned and mutated only by
//! the runner loop.

use berth_core::{ObjId, ResourceStatus};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Predicate over a set of identifiers, evaluated against the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Condition {
    AllCurrent,
    AllNotFound,
}

pub struct StatusCollector {
    latest: FxHashMap<ObjId, ResourceStatus>,
}

impl StatusCollector {
    pub fn new(identifiers: &[ObjId]) -> Self {
        let mut latest = FxHashMap::default();
        for id in identifiers {
            latest.insert(id.clone(), ResourceStatus::Unknown);
        }
        Self { latest }
    }

    pub fn observe(&mut self, id: &ObjId, status: ResourceStatus) {
        self.latest.insert(id.clone(), status);
    }

    /// Identifiers absent from the map count as Unknown.
    pub fn status_of(&self, id: &ObjId) -> ResourceStatus {
        self.latest.get(id).copied().unwrap_or(ResourceStatus::Unknown)
    }

    pub fn condition_met(&self, identifiers: &[ObjId], condition: Condition) -> bool {
        let wanted = match condition {
            Condition::AllCurrent => ResourceStatus::Current,
            Condition::AllNotFound => ResourceStatus::NotFound,
        };
        identifiers.iter().all(|id| self.status_of(id) == wanted)
    }
}
