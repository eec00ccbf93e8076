mod common;

use common::*;
use knitkit_communication::ExecutionConfig;
use knitkit_core::{Direction, ExecutionEvent, KnittingPattern, MachineState};
use std::time::Duration;

const IDLE: Duration = Duration::from_secs(5);

#[test]
fn test_steps_run_in_order_for_every_repetition() {
    let (controller, sim) = connected(fast_config());
    let run = pattern(
        vec![step(48, Direction::Cw, 1), step(48, Direction::Ccw, 2)],
        2,
    );

    controller.execute(run).unwrap();
    assert!(controller.wait_idle(IDLE));

    assert_eq!(
        sim.motion_commands(),
        vec![
            "NEEDLE_TARGET:48:CW",
            "NEEDLE_TARGET:96:CCW",
            "NEEDLE_TARGET:48:CW",
            "NEEDLE_TARGET:96:CCW",
        ]
    );
    let status = controller.execution_status().unwrap();
    assert!(status.is_complete());
    assert_eq!(status.needles_completed, 288);
    assert!(status.errors.is_empty());
    assert_eq!(controller.state(), MachineState::Connected);
}

#[test]
fn test_turn_mode_scales_by_steps_per_needle() {
    let mut config = fast_config();
    config.execution = ExecutionConfig {
        motion_mode: knitkit_communication::MotionMode::Turn,
        steps_per_needle: 10,
        ..config.execution
    };
    let (controller, sim) = connected(config);

    controller
        .execute(pattern(vec![step(6, Direction::Ccw, 2)], 1))
        .unwrap();
    assert!(controller.wait_idle(IDLE));

    assert_eq!(sim.motion_commands(), vec!["TURN:120:CCW"]);
    assert_eq!(controller.current_needle(), 36);
}

#[test]
fn test_failed_step_does_not_end_the_run() {
    let (controller, sim) = connected(fast_config());
    let events = record_execution(&controller);
    sim.script_reply(["DONE"]);
    sim.script_reply(Vec::<String>::new());
    sim.script_reply(["DONE"]);

    controller
        .execute(pattern(
            vec![
                step(1, Direction::Cw, 1),
                step(2, Direction::Cw, 1),
                step(3, Direction::Cw, 1),
            ],
            1,
        ))
        .unwrap();
    assert!(controller.wait_idle(IDLE));

    assert_eq!(sim.motion_commands().len(), 3);
    let status = controller.execution_status().unwrap();
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.current_step, 2);
    assert_eq!(status.needles_completed, 4);
    assert_eq!(controller.state(), MachineState::Connected);

    let events = events.lock();
    assert!(matches!(events.first(), Some(ExecutionEvent::Started(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::StepFailed { .. })));
    assert!(matches!(events.last(), Some(ExecutionEvent::Completed(_))));
}

#[test]
fn test_rejections_over_the_ceiling_abort_the_run() {
    let mut config = fast_config();
    config.execution.max_failures = Some(1);
    let (controller, sim) = connected(config);
    for _ in 0..3 {
        sim.script_reply(["ERROR: motor fault"]);
    }

    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 3))
        .unwrap();
    assert!(controller.wait_idle(IDLE));

    assert_eq!(sim.motion_commands().len(), 2);
    assert_eq!(controller.execution_status().unwrap().errors.len(), 2);
    assert_eq!(controller.state(), MachineState::Error);
}

#[test]
fn test_empty_pattern_is_refused() {
    let (controller, _sim) = connected(fast_config());
    let empty = KnittingPattern::empty("nothing").unwrap();
    assert!(controller.execute(empty).is_err());
    assert_eq!(controller.state(), MachineState::Connected);
}

#[test]
fn test_second_run_is_refused_while_executing() {
    let (controller, sim) = connected(fast_config());
    sim.set_response_delay(Duration::from_millis(50));
    let run = pattern(vec![step(1, Direction::Cw, 1)], 3);

    controller.execute(run.clone()).unwrap();
    assert!(controller.execute(run).is_err());
    assert!(controller.wait_idle(IDLE));
    assert_eq!(sim.motion_commands().len(), 3);
}

#[test]
fn test_pause_holds_between_steps() {
    let (controller, sim) = connected(fast_config());
    sim.set_response_delay(Duration::from_millis(50));

    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 4))
        .unwrap();
    controller.pause().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(controller.state(), MachineState::Paused);
    assert!(sim.motion_commands().len() <= 1);

    controller.resume().unwrap();
    assert!(controller.wait_idle(IDLE));
    assert_eq!(sim.motion_commands().len(), 4);
    assert!(controller.execution_status().unwrap().is_complete());
}

#[test]
fn test_stop_cancels_and_resets_progress() {
    let (controller, sim) = connected(fast_config());
    let events = record_execution(&controller);
    sim.set_response_delay(Duration::from_millis(60));

    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 10))
        .unwrap();
    std::thread::sleep(Duration::from_millis(150));
    controller.stop();

    assert_eq!(controller.state(), MachineState::Connected);
    let cancelled = events
        .lock()
        .iter()
        .find_map(|e| match e {
            ExecutionEvent::Cancelled(status) => Some(status.clone()),
            _ => None,
        })
        .expect("cancelled event");
    assert!(cancelled.current_step < 10);

    let status = controller.execution_status().unwrap();
    assert_eq!(status.current_step, 0);
    assert_eq!(status.current_repetition, 0);
    assert!(sim.motion_commands().len() < 10);
}

#[test]
fn test_stop_when_idle_is_a_no_op() {
    let (controller, _sim) = connected(fast_config());
    controller.stop();
    controller.stop();
    assert_eq!(controller.state(), MachineState::Connected);

    controller.disconnect();
    controller.stop();
    assert_eq!(controller.state(), MachineState::Disconnected);
}

#[test]
fn test_emergency_stop_halts_and_must_be_cleared() {
    let (controller, sim) = connected(fast_config());
    sim.set_response_delay(Duration::from_millis(60));

    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 10))
        .unwrap();
    std::thread::sleep(Duration::from_millis(30));
    controller.emergency_stop().unwrap();

    assert_eq!(controller.state(), MachineState::Stopped);
    assert!(controller.wait_idle(IDLE));
    assert_eq!(controller.state(), MachineState::Stopped);
    let written = sim.written();
    assert!(written.iter().any(|l| l == "EMERGENCY_STOP"));
    assert!(written.iter().any(|l| l == "HALT"));

    let run = pattern(vec![step(1, Direction::Cw, 1)], 1);
    assert!(controller.execute(run.clone()).is_err());

    controller.clear_stop().unwrap();
    assert_eq!(controller.state(), MachineState::Connected);
    controller.execute(run).unwrap();
    assert!(controller.wait_idle(IDLE));
    assert!(controller.execution_status().unwrap().is_complete());
}

#[test]
fn test_link_loss_moves_to_error() {
    let (controller, sim) = connected(fast_config());
    let events = record_execution(&controller);
    sim.set_response_delay(Duration::from_millis(80));

    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 5))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    sim.fail_link("cable pulled");

    assert!(controller.wait_idle(IDLE));
    assert_eq!(controller.state(), MachineState::Error);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ExecutionEvent::Aborted { .. })));
    assert!(controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 1))
        .is_err());
}

#[test]
fn test_step_timeout_cancels_remaining_chunks() {
    let mut config = fast_config();
    config.dispatcher.max_chunk_size = 10;
    config.execution = ExecutionConfig {
        motion_mode: knitkit_communication::MotionMode::Turn,
        steps_per_needle: 10,
        step_timeout: Duration::from_millis(150),
        ..config.execution
    };
    let (controller, sim) = connected(config);
    sim.set_response_delay(Duration::from_millis(60));

    controller
        .execute(pattern(vec![step(5, Direction::Cw, 1)], 1))
        .unwrap();
    assert!(controller.wait_idle(IDLE));

    let sent = sim.motion_commands();
    assert!(!sent.is_empty() && sent.len() < 5, "{:?}", sent);
    let status = controller.execution_status().unwrap();
    assert_eq!(status.needles_completed, 0);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].contains("did not finish within 150ms"));
    assert_eq!(controller.state(), MachineState::Connected);
    assert_eq!(controller.current_needle(), 0);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sim.motion_commands(), sent);
}

#[test]
fn test_run_after_step_timeout_reports_its_own_replies() {
    let mut config = fast_config();
    config.dispatcher.response_timeout = Duration::from_secs(1);
    config.execution.step_timeout = Duration::from_millis(100);
    let (controller, sim) = connected(config);
    sim.set_response_delay(Duration::from_millis(300));
    let run = pattern(vec![step(5, Direction::Cw, 1)], 1);

    controller.execute(run.clone()).unwrap();
    assert!(controller.wait_idle(IDLE));
    let status = controller.execution_status().unwrap();
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.needles_completed, 0);

    sim.set_response_delay(Duration::ZERO);
    sim.script_reply(["ERROR: jammed"]);
    controller.execute(run).unwrap();
    assert!(controller.wait_idle(IDLE));
    let status = controller.execution_status().unwrap();
    assert_eq!(status.needles_completed, 0);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].contains("ERROR: jammed"));
}
