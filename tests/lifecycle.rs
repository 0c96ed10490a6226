//! Lifecycle and failure-path tests: registration, init barrier,
//! cancellation, protocol violations, transport loss.

mod common;

use common::{run_federation, run_federation_with, Script};
use obnet::{
    registry::RegistryError, BlockDecl, Deadlines, Error, MessageKind, NodeDecl, ProtocolError,
    ReportEvent, StopReason, SystemConfigBuilder,
};

fn quick_deadlines() -> Deadlines {
    Deadlines { init_ms: 300, update_y_ms: 150, update_x_ms: 150, term_ms: 60 }
}

#[test]
fn test_registration_conflict() {
    let config = SystemConfigBuilder::new(1000)
        .workspace("reg")
        .deadlines(quick_deadlines())
        .node(
            NodeDecl::new("a")
                .with_block(BlockDecl::periodic(100))
                .with_block(BlockDecl::periodic(100)),
        )
        .build()
        .unwrap();

    // The peer declares 3 blocks where the configuration says 2.
    let fed = run_federation(config, vec![Script::new("a", 3)]);
    match fed.result {
        Err(Error::Registry(RegistryError::RegistrationConflict {
            expected: 2,
            declared: 3,
            ..
        })) => {}
        other => panic!("expected registration conflict, got {other:?}"),
    }
    assert_eq!(fed.sink.finish_reason(), Some(StopReason::Errored));
}

#[test]
fn test_setup_timeout_when_node_never_connects() {
    let config = SystemConfigBuilder::new(1000)
        .workspace("reg")
        .deadlines(quick_deadlines())
        .node(NodeDecl::new("ghost").with_block(BlockDecl::periodic(100)))
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("ghost", 1).without_connect()]);
    match fed.result {
        Err(Error::Timeout { node: 0, during: MessageKind::SysRequestConnect, .. }) => {}
        other => panic!("expected setup timeout, got {other:?}"),
    }
}

#[test]
fn test_init_timeout_is_fatal_without_resend() {
    let config = SystemConfigBuilder::new(1000)
        .workspace("reg")
        .deadlines(quick_deadlines())
        .node(NodeDecl::new("deaf").with_block(BlockDecl::periodic(100)))
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("deaf", 1).without_init_ack()]);
    match fed.result {
        Err(Error::Timeout { node: 0, during: MessageKind::Init, .. }) => {}
        other => panic!("expected init timeout, got {other:?}"),
    }
    assert!(fed.sink.events().contains(&ReportEvent::NodeTimedOut { id: 0 }));
    // Init never completed, so nothing was scheduled.
    assert!(fed.sink.tick_starts().is_empty());
}

#[test]
fn test_cancellation_stops_before_first_tick() {
    let config = SystemConfigBuilder::new(10_000)
        .workspace("stop")
        .node(NodeDecl::new("a").with_block(BlockDecl::periodic(100)))
        .build()
        .unwrap();

    let fed = run_federation_with(config, vec![Script::new("a", 1)], |coordinator| {
        coordinator.cancel_token().cancel();
    });

    assert!(matches!(fed.result, Ok(StopReason::Cancelled)));
    assert_eq!(fed.sink.finish_reason(), Some(StopReason::Cancelled));
    assert!(fed.sink.tick_starts().is_empty());
    assert_eq!(fed.logs[0].terms(), 1);
}

#[test]
fn test_node_reported_error_terminates_run() {
    let config = SystemConfigBuilder::new(5000)
        .workspace("err")
        .deadlines(quick_deadlines())
        .node(NodeDecl::new("ok").with_block(BlockDecl::periodic(1000)))
        .node(NodeDecl::new("bad").with_block(BlockDecl::periodic(1000)))
        .build()
        .unwrap();

    let fed = run_federation(
        config,
        vec![Script::new("ok", 1), Script::new("bad", 1).failing_y(3)],
    );

    match fed.result {
        Err(Error::Node { id: 1, code: 3, .. }) => {}
        other => panic!("expected node error, got {other:?}"),
    }
    assert!(fed
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, ReportEvent::NodeError { id: 1, .. })));
    assert_eq!(fed.sink.finish_reason(), Some(StopReason::Errored));
    for log in &fed.logs {
        assert_eq!(log.terms(), 1);
    }
}

#[test]
fn test_duplicate_acks_leave_schedule_unchanged() {
    let config = SystemConfigBuilder::new(2000)
        .workspace("dup")
        .node(NodeDecl::new("echo").with_block(BlockDecl::periodic(1000)))
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("echo", 1).double_acking()]);

    assert!(matches!(fed.result, Ok(StopReason::Completed)));
    assert_eq!(fed.sink.tick_starts(), vec![0, 1000, 2000]);
    assert_eq!(fed.logs[0].ys().len(), 3, "no resends were triggered");
}

#[test]
fn test_wrong_mask_ack_is_a_protocol_error() {
    let config = SystemConfigBuilder::new(2000)
        .workspace("mask")
        .deadlines(quick_deadlines())
        .node(
            NodeDecl::new("liar")
                .with_block(BlockDecl::periodic(1000))
                .with_block(BlockDecl::periodic(1000)),
        )
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("liar", 2).acking_wrong_mask(0b1)]);
    match fed.result {
        Err(Error::Protocol(ProtocolError::UnexpectedMask {
            node: 0,
            expected: 0b11,
            got: 0b1,
        })) => {}
        other => panic!("expected mask violation, got {other:?}"),
    }
}

#[test]
fn test_lost_endpoint_cascades_like_timeout() {
    let config = SystemConfigBuilder::new(5000)
        .workspace("down")
        .deadlines(quick_deadlines())
        .node(NodeDecl::new("flaky").with_block(BlockDecl::periodic(1000)))
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("flaky", 1).dropping_after_init()]);

    assert!(matches!(fed.result, Err(Error::Transport(_))));
    assert!(fed.sink.events().contains(&ReportEvent::NodeTimedOut { id: 0 }));
    assert_eq!(fed.sink.finish_reason(), Some(StopReason::Errored));
}

#[test]
fn test_late_event_is_discarded_and_reported() {
    let config = SystemConfigBuilder::new(2000)
        .workspace("late")
        .node(NodeDecl::new("a").with_block(BlockDecl::periodic(1000)))
        .build()
        .unwrap();

    // When UPDATE_Y for t=1000 arrives, the peer requests a firing at 500.
    let fed = run_federation(config, vec![Script::new("a", 1).event_at(1000, 500, 0b1)]);

    assert!(matches!(fed.result, Ok(StopReason::Completed)));
    assert_eq!(fed.sink.tick_starts(), vec![0, 1000, 2000]);
    assert!(fed.sink.events().iter().any(|e| matches!(
        e,
        ReportEvent::LateEvent { node: 0, fire_time: 500, t: 1000, .. }
    )));
}

#[test]
fn test_event_request_piggybacked_on_ack() {
    let config = SystemConfigBuilder::new(2000)
        .workspace("piggy")
        .node(NodeDecl::new("a").with_block(BlockDecl::periodic(1000)))
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("a", 1).piggybacking(1000, 1500, 0b1)]);

    assert!(matches!(fed.result, Ok(StopReason::Completed)));
    assert_eq!(fed.sink.tick_starts(), vec![0, 1000, 1500, 2000]);
    let ys = fed.logs[0].ys();
    assert!(ys.contains(&(1500, 0b1)));
}

#[test]
fn test_port_announcements_are_accepted_during_setup() {
    let config = SystemConfigBuilder::new(1000)
        .workspace("ports")
        .node(
            NodeDecl::new("a")
                .with_output("y")
                .with_block(BlockDecl::periodic(1000).with_output("y")),
        )
        .build()
        .unwrap();

    let fed = run_federation(config, vec![Script::new("a", 1).announcing("y")]);
    assert!(matches!(fed.result, Ok(StopReason::Completed)));
    assert_eq!(fed.sink.tick_starts(), vec![0, 1000]);
}

#[test]
fn test_stateless_node_skips_update_x() {
    let config = SystemConfigBuilder::new(2000)
        .workspace("nox")
        .node(NodeDecl::new("full").with_block(BlockDecl::periodic(1000)))
        .node(
            NodeDecl::new("outputs_only")
                .with_block(BlockDecl::periodic(1000))
                .without_state_update(),
        )
        .build()
        .unwrap();

    let fed = run_federation(
        config,
        vec![Script::new("full", 1), Script::new("outputs_only", 1)],
    );

    assert!(matches!(fed.result, Ok(StopReason::Completed)));
    assert_eq!(fed.logs[0].xs().len(), 3);
    assert!(fed.logs[1].xs().is_empty());
    assert_eq!(fed.logs[1].ys().len(), 3);
}
