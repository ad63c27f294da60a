//! Trigger conditions for blackboard-driven orchestration.
//!
//! Pure predicates over a [`Blackboard`]; the orchestrator evaluates these
//! to decide when a stage fires.

use super::blackboard::Blackboard;

/// A boxed predicate the orchestrator may evaluate any number of times.
/// Must be pure and side-effect free.
pub type Trigger = Box<dyn Fn(&Blackboard) -> bool + Send + Sync>;

/// Fires immediately — used for the first stage(s) of a protocol.
pub fn always() -> Trigger {
    Box::new(|_bb| true)
}

/// Fires once the named stage has written at least one entry.
pub fn after(stage_name: impl Into<String>) -> Trigger {
    let stage_name = stage_name.into();
    Box::new(move |bb| bb.stages_completed().contains(&stage_name))
}

/// Fires once every listed stage has written at least one entry.
pub fn after_all(stage_names: Vec<String>) -> Trigger {
    Box::new(move |bb| {
        let completed = bb.stages_completed();
        stage_names.iter().all(|s| completed.contains(s))
    })
}

/// Fires once any listed stage has written at least one entry.
pub fn after_any(stage_names: Vec<String>) -> Trigger {
    Box::new(move |bb| {
        let completed = bb.stages_completed();
        stage_names.iter().any(|s| completed.contains(s))
    })
}

/// Fires when `blackboard.conflicts(topic)` is non-empty.
pub fn on_conflict(topic: impl Into<String>) -> Trigger {
    let topic = topic.into();
    Box::new(move |bb| bb.conflicts(&topic).is_some())
}
