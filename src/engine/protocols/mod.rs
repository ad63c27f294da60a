//! The protocol library: each module assembles a [`ProtocolDef`] out of
//! [`crate::engine::stage`] factories and [`crate::engine::trigger`]
//! predicates, plus an `extract` function translating the finished
//! blackboard into a [`ProtocolResult`]. One module per family (see
//! `DESIGN.md` for how each one was built).
//!
//! [`ProtocolDef`]: crate::engine::orchestrator::ProtocolDef
//! [`ProtocolResult`]: crate::engine::orchestrator::ProtocolResult

pub mod json_util;

pub mod ach;
pub mod causal_loop;
pub mod constraint_negotiation;
pub mod cynefin;
pub mod debate;
pub mod delphi;
pub mod falsification_gate;
pub mod ooda;
pub mod parallel_synthesis;
pub mod premortem;
pub mod red_blue_white;
pub mod six_hats;
pub mod voting;

use serde_json::Value;

/// Render a blackboard entry's content as plain text: pass strings through,
/// otherwise fall back to its JSON form. Shared by every protocol's
/// `extract` function.
pub(crate) fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
