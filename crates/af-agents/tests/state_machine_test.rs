use af_agents::state_machine::{RoleEvent, RoleState, RoleStateMachine, StateMachineError};

#[test]
fn starts_not_started() {
    let sm = RoleStateMachine::new();
    assert_eq!(sm.state(), RoleState::NotStarted);
    assert_eq!(sm.history().count(), 0);
}

#[test]
fn crash_restart_cycle() {
    let mut sm = RoleStateMachine::new();
    sm.transition(RoleEvent::Start).unwrap();
    sm.transition(RoleEvent::Started).unwrap();
    assert_eq!(sm.transition(RoleEvent::Fail).unwrap(), RoleState::Crashed);
    assert_eq!(sm.transition(RoleEvent::Backoff).unwrap(), RoleState::Backoff);
    assert_eq!(sm.transition(RoleEvent::Start).unwrap(), RoleState::Starting);
    assert_eq!(sm.transition(RoleEvent::Started).unwrap(), RoleState::Running);
    assert_eq!(sm.history().count(), 6);
}

#[test]
fn given_up_is_terminal_until_reset() {
    let mut sm = RoleStateMachine::new();
    sm.transition(RoleEvent::Start).unwrap();
    sm.transition(RoleEvent::Fail).unwrap();
    sm.transition(RoleEvent::GiveUp).unwrap();
    assert_eq!(sm.state(), RoleState::GivenUp);

    for event in [
        RoleEvent::Start,
        RoleEvent::Started,
        RoleEvent::Fail,
        RoleEvent::Backoff,
        RoleEvent::GiveUp,
        RoleEvent::Stop,
    ] {
        assert!(!sm.can_transition(event), "{event} must be rejected");
    }

    assert_eq!(sm.transition(RoleEvent::Reset).unwrap(), RoleState::NotStarted);
}

#[test]
fn graceful_stop() {
    let mut sm = RoleStateMachine::new();
    sm.transition(RoleEvent::Start).unwrap();
    sm.transition(RoleEvent::Started).unwrap();
    assert_eq!(sm.transition(RoleEvent::Stop).unwrap(), RoleState::Stopping);
    assert_eq!(sm.transition(RoleEvent::Stopped).unwrap(), RoleState::Stopped);
    // A stopped role can be started fresh.
    assert!(sm.can_transition(RoleEvent::Start));
}

#[test]
fn stop_while_waiting_to_restart() {
    let mut sm = RoleStateMachine::new();
    sm.transition(RoleEvent::Start).unwrap();
    sm.transition(RoleEvent::Fail).unwrap();
    sm.transition(RoleEvent::Backoff).unwrap();
    assert_eq!(sm.transition(RoleEvent::Stop).unwrap(), RoleState::Stopped);
}

#[test]
fn invalid_transition_reports_state_and_event() {
    let mut sm = RoleStateMachine::new();
    let err = sm.transition(RoleEvent::Started).unwrap_err();
    assert_eq!(
        err,
        StateMachineError::InvalidTransition {
            state: RoleState::NotStarted,
            event: RoleEvent::Started,
        }
    );
    assert_eq!(sm.state(), RoleState::NotStarted);
    assert!(err.to_string().contains("not_started"));
}

#[test]
fn history_is_bounded() {
    let mut sm = RoleStateMachine::new();
    for _ in 0..100 {
        sm.transition(RoleEvent::Start).unwrap();
        sm.transition(RoleEvent::Started).unwrap();
        sm.transition(RoleEvent::Stop).unwrap();
        sm.transition(RoleEvent::Stopped).unwrap();
    }
    assert_eq!(sm.history().count(), 64);
}
