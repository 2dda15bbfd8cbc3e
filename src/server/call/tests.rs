//! Call session tests against a scripted control connection

use super::*;
use std::sync::Mutex;
use std::time::Instant;

/// Command as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cmd {
    Subscribe(String),
    Linger,
    Set(String, String),
    Answer,
    Bridge(String),
    Hangup(String),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Subscribe,
    Linger,
    Set,
    Answer,
    Bridge,
    Hangup,
    Stop,
}

/// Records every command and fails or panics on a chosen step
#[derive(Clone, Default)]
struct ScriptedControl {
    log: Arc<Mutex<Vec<Cmd>>>,
    fail_on: Option<Step>,
    panic_on: Option<Step>,
}

impl ScriptedControl {
    fn failing(step: Step) -> Self {
        Self {
            fail_on: Some(step),
            ..Default::default()
        }
    }

    fn panicking(step: Step) -> Self {
        Self {
            panic_on: Some(step),
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<Cmd> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, step: Step, cmd: Cmd) -> Result<(), EslError> {
        self.log.lock().unwrap().push(cmd);
        if self.panic_on == Some(step) {
            panic!("scripted panic");
        }
        if self.fail_on == Some(step) {
            return Err(EslError::CommandFailed(format!("-ERR scripted {:?}", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl CallControl for ScriptedControl {
    async fn subscribe_events(&mut self, call_id: &str) -> Result<(), EslError> {
        self.record(Step::Subscribe, Cmd::Subscribe(call_id.to_string()))
    }

    async fn linger(&mut self) -> Result<(), EslError> {
        self.record(Step::Linger, Cmd::Linger)
    }

    async fn set_variable(&mut self, name: &str, value: &str) -> Result<(), EslError> {
        self.record(Step::Set, Cmd::Set(name.to_string(), value.to_string()))
    }

    async fn answer(&mut self) -> Result<(), EslError> {
        self.record(Step::Answer, Cmd::Answer)
    }

    async fn bridge(&mut self, dial_string: &str) -> Result<(), EslError> {
        self.record(Step::Bridge, Cmd::Bridge(dial_string.to_string()))
    }

    async fn hangup(&mut self, cause: &str) -> Result<(), EslError> {
        self.record(Step::Hangup, Cmd::Hangup(cause.to_string()))
    }

    async fn stop(&mut self) -> Result<(), EslError> {
        self.record(Step::Stop, Cmd::Stop)
    }
}

fn channel_data(destination: Option<&str>) -> HashMap<String, String> {
    let mut data = HashMap::new();
    data.insert(HEADER_UNIQUE_ID.to_string(), "uuid-1".to_string());
    data.insert(HEADER_CALLER_NUMBER.to_string(), "2125551212".to_string());
    if let Some(destination) = destination {
        data.insert(HEADER_DESTINATION_NUMBER.to_string(), destination.to_string());
    }
    data
}

fn fast_settings() -> CallSettings {
    CallSettings {
        answer_grace: Duration::ZERO,
        ..CallSettings::default()
    }
}

async fn run_call(control: ScriptedControl, destination: Option<&str>) -> (CallOutcome, Vec<Cmd>) {
    let stats = Arc::new(ServerStats::new());
    let session = CallSession::new(
        control.clone(),
        &channel_data(destination),
        Arc::new(RoutingTable::builtin()),
        fast_settings(),
        stats,
    );
    let outcome = session.run().await;
    (outcome, control.commands())
}

fn count(cmds: &[Cmd], pred: impl Fn(&Cmd) -> bool) -> usize {
    cmds.iter().filter(|c| pred(c)).count()
}

fn is_stop(c: &Cmd) -> bool {
    matches!(c, Cmd::Stop)
}

fn is_hangup(c: &Cmd) -> bool {
    matches!(c, Cmd::Hangup(_))
}

#[tokio::test]
async fn test_bridge_call_command_sequence() {
    let (outcome, cmds) = run_call(ScriptedControl::default(), Some("17577828734")).await;

    assert_eq!(outcome.disposition, Disposition::Bridged);
    assert_eq!(outcome.call_id, "uuid-1");
    assert_eq!(
        cmds,
        vec![
            Cmd::Subscribe("uuid-1".to_string()),
            Cmd::Linger,
            Cmd::Set("domain_name".to_string(), "store1.local".to_string()),
            Cmd::Set("ringback".to_string(), "${us-ring}".to_string()),
            Cmd::Set("call_timeout".to_string(), "30".to_string()),
            Cmd::Set("hangup_after_bridge".to_string(), "true".to_string()),
            Cmd::Set("continue_on_fail".to_string(), "true".to_string()),
            Cmd::Answer,
            Cmd::Bridge(
                "{leg_timeout=30,ignore_early_media=true}user/1000@store1.local,user/1001@store1.local"
                    .to_string()
            ),
            Cmd::Stop,
        ]
    );
}

#[tokio::test]
async fn test_states_never_skip() {
    let (outcome, _) = run_call(ScriptedControl::default(), Some("7372449688")).await;
    assert_eq!(
        outcome.states,
        vec![
            CallState::Connected,
            CallState::Subscribed,
            CallState::Lingering,
            CallState::Deciding,
            CallState::Bridging,
            CallState::Closed,
        ]
    );
    for pair in outcome.states.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_unroutable_call_is_rejected_with_reason() {
    let (outcome, cmds) = run_call(ScriptedControl::default(), Some("5551234567")).await;

    assert_eq!(outcome.disposition, Disposition::Rejected);
    assert_eq!(outcome.final_state(), CallState::Closed);
    assert_eq!(
        &cmds[2..],
        &[
            Cmd::Hangup("No route found for 5551234567".to_string()),
            Cmd::Stop
        ]
    );
}

#[tokio::test]
async fn test_missing_destination_rejects_with_empty_number() {
    let (outcome, cmds) = run_call(ScriptedControl::default(), None).await;

    assert_eq!(outcome.disposition, Disposition::Rejected);
    assert!(cmds.contains(&Cmd::Hangup("No route found for ".to_string())));
}

#[tokio::test]
async fn test_empty_handshake_still_completes() {
    let control = ScriptedControl::default();
    let session = CallSession::new(
        control.clone(),
        &HashMap::new(),
        Arc::new(RoutingTable::builtin()),
        fast_settings(),
        Arc::new(ServerStats::new()),
    );
    assert_eq!(session.context(), &SessionContext::default());

    let outcome = session.run().await;
    assert_eq!(outcome.disposition, Disposition::Rejected);
    assert_eq!(control.commands().first(), Some(&Cmd::Subscribe(String::new())));
    assert_eq!(control.commands().last(), Some(&Cmd::Stop));
}

#[tokio::test]
async fn test_answer_failure_hangs_up_then_stops() {
    let (outcome, cmds) = run_call(ScriptedControl::failing(Step::Answer), Some("17577828734")).await;

    assert_eq!(outcome.disposition, Disposition::Failed);
    assert_eq!(outcome.final_state(), CallState::Closed);
    let tail = &cmds[cmds.len() - 3..];
    assert_eq!(
        tail,
        &[
            Cmd::Answer,
            Cmd::Hangup(FAILURE_HANGUP_CAUSE.to_string()),
            Cmd::Stop
        ]
    );
    assert!(!cmds.iter().any(|c| matches!(c, Cmd::Bridge(_))));
}

#[tokio::test]
async fn test_subscribe_and_linger_failures_are_tolerated() {
    for step in [Step::Subscribe, Step::Linger] {
        let stats = Arc::new(ServerStats::new());
        let control = ScriptedControl::failing(step);
        let session = CallSession::new(
            control.clone(),
            &channel_data(Some("7372449688")),
            Arc::new(RoutingTable::builtin()),
            fast_settings(),
            stats.clone(),
        );

        let outcome = session.run().await;
        assert_eq!(outcome.disposition, Disposition::Bridged, "{:?}", step);

        let snap = stats.snapshot();
        match step {
            Step::Subscribe => assert_eq!(snap.subscribe_failures, 1),
            _ => assert_eq!(snap.linger_failures, 1),
        }
        assert_eq!(snap.bridged, 1);
    }
}

#[tokio::test]
async fn test_single_failure_anywhere_still_stops_once() {
    for step in [
        Step::Subscribe,
        Step::Linger,
        Step::Set,
        Step::Answer,
        Step::Bridge,
        Step::Hangup,
        Step::Stop,
    ] {
        for destination in ["17577828734", "5551234567"] {
            let (outcome, cmds) = run_call(ScriptedControl::failing(step), Some(destination)).await;

            assert_eq!(outcome.final_state(), CallState::Closed, "{:?} {}", step, destination);
            assert_eq!(count(&cmds, is_stop), 1, "{:?} {}: {:?}", step, destination, cmds);
            assert_eq!(cmds.last(), Some(&Cmd::Stop));
            assert!(count(&cmds, is_hangup) <= 1, "{:?} {}: {:?}", step, destination, cmds);
        }
    }
}

#[tokio::test]
async fn test_failed_reject_hangup_is_not_repeated() {
    let (outcome, cmds) = run_call(ScriptedControl::failing(Step::Hangup), Some("5551234567")).await;

    assert_eq!(outcome.disposition, Disposition::Failed);
    assert_eq!(count(&cmds, is_hangup), 1);
    assert_eq!(cmds.last(), Some(&Cmd::Stop));
}

#[tokio::test]
async fn test_panic_in_handler_still_tears_down() {
    let (outcome, cmds) =
        run_call(ScriptedControl::panicking(Step::Answer), Some("17577828734")).await;

    assert_eq!(outcome.disposition, Disposition::Failed);
    assert_eq!(count(&cmds, is_hangup), 1);
    assert_eq!(count(&cmds, is_stop), 1);
    assert_eq!(cmds.last(), Some(&Cmd::Stop));
}

#[tokio::test]
async fn test_bridge_is_followed_directly_by_stop() {
    let control = ScriptedControl::default();
    let session = CallSession::new(
        control.clone(),
        &channel_data(Some("17577828734")),
        Arc::new(RoutingTable::builtin()),
        fast_settings(),
        Arc::new(ServerStats::new()),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(1), session.run())
        .await
        .expect("session waited on bridge completion");
    assert_eq!(outcome.disposition, Disposition::Bridged);

    let cmds = control.commands();
    let bridge_at = cmds.iter().position(|c| matches!(c, Cmd::Bridge(_))).unwrap();
    assert_eq!(cmds[bridge_at + 1], Cmd::Stop);
}

#[tokio::test]
async fn test_answer_grace_delays_bridge() {
    let control = ScriptedControl::default();
    let session = CallSession::new(
        control.clone(),
        &channel_data(Some("17577828734")),
        Arc::new(RoutingTable::builtin()),
        CallSettings {
            answer_grace: Duration::from_millis(100),
            ..CallSettings::default()
        },
        Arc::new(ServerStats::new()),
    );

    let started = Instant::now();
    let outcome = session.run().await;
    assert_eq!(outcome.disposition, Disposition::Bridged);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_context_extraction() {
    let mut data = channel_data(Some("737-244-9688"));
    data.insert(HEADER_SIP_PROFILE.to_string(), "external".to_string());

    let ctx = SessionContext::from_channel_data(&data);
    assert_eq!(ctx.call_id, "uuid-1");
    assert_eq!(ctx.destination_number, "737-244-9688");
    assert_eq!(ctx.caller_number, "2125551212");
    assert_eq!(ctx.signaling_profile, "external");
}

#[test]
fn test_closed_is_reachable_from_every_state() {
    use CallState::*;
    for state in [Connected, Subscribed, Lingering, Deciding, Bridging, Rejecting] {
        assert!(state.can_transition_to(Closed));
    }
    assert!(!Closed.can_transition_to(Closed));
    assert!(!Connected.can_transition_to(Deciding));
    assert!(!Bridging.can_transition_to(Rejecting));
}

#[test]
fn test_dial_string() {
    let settings = CallSettings::default();
    assert_eq!(
        settings.dial_string(&["user/1000@a".to_string(), "user/1001@a".to_string()]),
        "{leg_timeout=30,ignore_early_media=true}user/1000@a,user/1001@a"
    );
}
