//! Helpers for working with [`ProcessState`] values.

use crate::proto::process_state::ProcessStateEnum;
use crate::proto::ProcessState;

/// States a job or task never leaves once entered.
pub const TERMINAL_PROCESS_STATES: [ProcessStateEnum; 7] = [
    ProcessStateEnum::Succeeded,
    ProcessStateEnum::RunRequestFailed,
    ProcessStateEnum::PythonException,
    ProcessStateEnum::NonZeroReturnCode,
    ProcessStateEnum::ResourcesNotAvailable,
    ProcessStateEnum::ErrorGettingState,
    ProcessStateEnum::Cancelled,
];

pub fn is_terminal(state: ProcessStateEnum) -> bool {
    TERMINAL_PROCESS_STATES.contains(&state)
}

/// A failure state, i.e. terminal but not SUCCEEDED.
pub fn is_failure(state: ProcessStateEnum) -> bool {
    is_terminal(state) && state != ProcessStateEnum::Succeeded
}

/// A ProcessState carrying only the state enum.
pub fn bare_state(state: ProcessStateEnum) -> ProcessState {
    ProcessState {
        state: state as i32,
        ..Default::default()
    }
}
