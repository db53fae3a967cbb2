//! The single output type of a run: everything a consumer learns about
//! progress arrives as one of these on the event stream.

use crate::error::EngineError;
use berth_core::{ObjId, ResourceStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionType {
    Apply,
    Prune,
}

/// A set of identifiers sharing one planned action, announced up front.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceGroup {
    pub action: ActionType,
    pub identifiers: Vec<ObjId>,
}

/// Per-object outcome inside an apply or prune phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    Init { groups: Vec<ResourceGroup> },
    ApplyItem { id: ObjId, outcome: ItemOutcome },
    ApplyCompleted,
    Status { id: ObjId, status: ResourceStatus },
    StatusCompleted,
    PruneItem { id: ObjId, outcome: ItemOutcome },
    PruneCompleted,
    Error { error: EngineError },
}
