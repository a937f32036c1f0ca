// Licensed under the Apache-2.0 license

use log::{debug, info, warn};
use smlang::statemachine;

// `Failed` is reported as `FlashOperationState::Error`
statemachine! {
    derive_states: [Debug, Clone],
    derive_events: [Clone, Debug],
    transitions: {
        *Idle + Start / on_start = Initializing,
        Initializing + SnapshotTaken = BackingUp,
        BackingUp + BackupFinished = WritingTable,
        WritingTable + TableWritten = FlashingFirmware,
        FlashingFirmware + FirmwareFlashed = Verifying,
        Verifying + VerificationFinished / on_complete = Completed,
        Completed + Reset / on_reset = Idle,
        Failed + Reset / on_reset = Idle,

        _ + Fail / on_fail = Failed
    }
}

/// Phase of the flashing engine as seen by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlashOperationState {
    #[default]
    Idle,
    Initializing,
    BackingUp,
    WritingTable,
    FlashingFirmware,
    Verifying,
    Completed,
    Error,
}

impl From<&States> for FlashOperationState {
    fn from(state: &States) -> Self {
        match state {
            States::Idle => FlashOperationState::Idle,
            States::Initializing => FlashOperationState::Initializing,
            States::BackingUp => FlashOperationState::BackingUp,
            States::WritingTable => FlashOperationState::WritingTable,
            States::FlashingFirmware => FlashOperationState::FlashingFirmware,
            States::Verifying => FlashOperationState::Verifying,
            States::Completed => FlashOperationState::Completed,
            States::Failed => FlashOperationState::Error,
        }
    }
}

#[derive(Debug, Default)]
pub struct Context {
    /// Number of runs started so far; doubles as the id of the current run.
    pub runs: u64,
}

impl StateMachineContext for Context {
    fn on_start(&mut self) -> Result<(), ()> {
        self.runs += 1;
        info!("Flash run {} started", self.runs);
        Ok(())
    }

    fn on_complete(&mut self) -> Result<(), ()> {
        info!("Flash run {} completed", self.runs);
        Ok(())
    }

    fn on_fail(&mut self) -> Result<(), ()> {
        warn!("Flash run {} failed", self.runs);
        Ok(())
    }

    fn on_reset(&mut self) -> Result<(), ()> {
        debug!("Flash engine back to idle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(sm: &StateMachine<Context>) -> FlashOperationState {
        sm.state().into()
    }

    #[test]
    fn test_linear_run() {
        let mut sm = StateMachine::new(Context::default());
        for event in [
            Events::Start,
            Events::SnapshotTaken,
            Events::BackupFinished,
            Events::TableWritten,
            Events::FirmwareFlashed,
            Events::VerificationFinished,
        ] {
            sm.process_event(event).unwrap();
        }
        assert_eq!(state(&sm), FlashOperationState::Completed);
        sm.process_event(Events::Reset).unwrap();
        assert_eq!(state(&sm), FlashOperationState::Idle);
        assert_eq!(sm.context().runs, 1);
    }

    #[test]
    fn test_failure_from_any_phase() {
        let mut sm = StateMachine::new(Context::default());
        sm.process_event(Events::Start).unwrap();
        sm.process_event(Events::SnapshotTaken).unwrap();
        sm.process_event(Events::Fail).unwrap();
        assert_eq!(state(&sm), FlashOperationState::Error);

        // No way forward except a reset
        assert!(sm.process_event(Events::Start).is_err());
        sm.process_event(Events::Reset).unwrap();
        assert_eq!(state(&sm), FlashOperationState::Idle);
    }

    #[test]
    fn test_start_only_from_idle() {
        let mut sm = StateMachine::new(Context::default());
        sm.process_event(Events::Start).unwrap();
        assert!(sm.process_event(Events::Start).is_err());
        assert!(sm.process_event(Events::Reset).is_err());
        assert_eq!(state(&sm), FlashOperationState::Initializing);
    }
}
