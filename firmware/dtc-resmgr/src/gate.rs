//! Validity gate consulted before loaded configuration drives hardware.
//!
//! The decision is recomputed on every call and never cached.

use alloc::vec::Vec;
use log::warn;

use crate::completion::CompletionState;
use crate::platform::PlatformHooks;
use crate::region::WorkingBufferBank;
use crate::ChipId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Configuration set not complete yet
    NotComplete,
    /// Platform vetoed this chip/configuration combination
    Vetoed,
}

/// Evaluate the gate. Invalid banks are never shown to the platform hook.
///
/// A veto wins over completion state.
pub fn evaluate(
    hooks: Option<&dyn PlatformHooks>,
    chip: &ChipId,
    completion: &CompletionState,
    banks: &[WorkingBufferBank],
) -> GateDecision {
    if let Some(hooks) = hooks {
        let valid: Vec<WorkingBufferBank> = banks.iter().filter(|b| b.valid).copied().collect();
        if hooks.veto(chip, completion, &valid) {
            warn!(
                "gate: activation vetoed for {} rev {}",
                chip.family.name(),
                chip.revision
            );
            return GateDecision::Vetoed;
        }
    }
    if completion.complete {
        GateDecision::Allow
    } else {
        GateDecision::NotComplete
    }
}

/// Gate with no platform hook registered: allowed once complete
pub fn may_activate(chip: ChipId, completion: &CompletionState, banks: &[WorkingBufferBank]) -> bool {
    evaluate(None, &chip, completion, banks) == GateDecision::Allow
}
