mod common;

use common::*;
use knitkit_communication::{
    KnittingController, SimulatedTransport, TransportParams, DEFAULT_NEEDLE_COUNT,
};
use knitkit_core::{
    AppEvent, ConnectionEvent, DeviceMessage, Direction, EventFilter, ExecutionStatus,
    MachineListener, MachineState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_connect_and_disconnect_publish_events() {
    let controller = KnittingController::new(fast_config());
    let seen = knitkit_core::thread_safe(Vec::new());
    let sink = seen.clone();
    controller.bus().subscribe(EventFilter::All, move |event| {
        if let AppEvent::Connection(e) = event {
            sink.lock().push(e);
        }
    });

    controller
        .connect_with(Box::new(SimulatedTransport::new()), &TransportParams::simulated())
        .unwrap();
    assert_eq!(controller.state(), MachineState::Connected);
    assert_eq!(controller.connection_info().unwrap().target, "simulator");

    controller.disconnect();
    assert_eq!(controller.state(), MachineState::Disconnected);
    assert!(controller.connection_info().is_none());

    let seen = seen.lock();
    assert_eq!(
        seen.as_slice(),
        &[
            ConnectionEvent::Connected {
                target: "simulator".to_string()
            },
            ConnectionEvent::Disconnected {
                target: "simulator".to_string()
            },
        ]
    );
}

#[test]
fn test_failed_connect_leaves_state_alone() {
    let controller = KnittingController::new(fast_config());
    let failures = knitkit_core::thread_safe(0usize);
    let sink = failures.clone();
    controller.bus().subscribe(EventFilter::All, move |event| {
        if let AppEvent::Connection(ConnectionEvent::ConnectionFailed { .. }) = event {
            *sink.lock() += 1;
        }
    });

    assert!(controller.connect(&TransportParams::tcp("", 1)).is_err());
    assert_eq!(controller.state(), MachineState::Disconnected);
    assert_eq!(*failures.lock(), 1);
}

#[test]
fn test_device_tally_syncs_position_when_idle() {
    let (controller, sim) = connected(fast_config());
    sim.script_reply(["Needle count: 7", "OK"]);

    let rx = {
        let (tx, rx) = std::sync::mpsc::channel();
        controller
            .send_raw(
                "NEEDLE_COUNT",
                Some(Box::new(move |result| {
                    let _ = tx.send(result);
                })),
            )
            .unwrap();
        rx
    };
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());
    assert_eq!(controller.current_needle(), 7);

    let back = controller.home().unwrap().recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(back.is_success());
    assert_eq!(sim.written().last().unwrap(), "TURN:7000:CCW");
    assert_eq!(controller.current_needle(), 0);
}

#[test]
fn test_reset_needle_position_zeroes_tracker_and_device() {
    let (controller, sim) = connected(fast_config());
    let moved = controller.move_to_needle(10).unwrap().recv_timeout(Duration::from_secs(5));
    assert!(moved.unwrap().is_success());

    controller.reset_needle_position();
    assert_eq!(controller.current_needle(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        sim.written().iter().any(|l| l == "RESET_COUNT")
    }));
}

#[test]
fn test_move_refused_during_run() {
    let (controller, sim) = connected(fast_config());
    sim.set_response_delay(Duration::from_millis(50));
    controller
        .execute(pattern(vec![step(1, Direction::Cw, 1)], 3))
        .unwrap();
    assert!(controller.move_to_needle(5).is_err());
    assert!(controller.wait_idle(Duration::from_secs(5)));
}

#[test]
fn test_reconnect_recovers_from_error() {
    let (controller, sim) = connected(fast_config());
    sim.fail_link("unplugged");
    let result = controller
        .move_to_needle(3)
        .unwrap()
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert!(result.is_connection_fault());
    assert!(wait_until(Duration::from_secs(2), || {
        controller.state() == MachineState::Error
    }));

    controller
        .connect_with(Box::new(SimulatedTransport::new()), &TransportParams::simulated())
        .unwrap();
    assert_eq!(controller.state(), MachineState::Connected);
    assert_eq!(controller.current_needle(), 0);
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<MachineState>>,
    progress: Mutex<Vec<ExecutionStatus>>,
    errors: Mutex<Vec<String>>,
    devices: Mutex<Vec<DeviceMessage>>,
}

impl MachineListener for Recorder {
    fn on_state_changed(&self, _from: MachineState, to: MachineState) {
        self.states.lock().push(to);
    }

    fn on_progress(&self, status: &ExecutionStatus) {
        self.progress.lock().push(status.clone());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }

    fn on_device_message(&self, message: &DeviceMessage) {
        self.devices.lock().push(message.clone());
    }
}

#[test]
fn test_listener_sees_a_whole_run() {
    let (controller, _sim) = connected(fast_config());
    let recorder = Arc::new(Recorder::default());
    let handle = controller.add_listener(recorder.clone());

    controller
        .execute(pattern(vec![step(2, Direction::Cw, 1)], 2))
        .unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    assert_eq!(
        recorder.states.lock().as_slice(),
        &[MachineState::Executing, MachineState::Connected]
    );
    let progress = recorder.progress.lock();
    assert!(progress.last().unwrap().is_complete());
    assert!(progress.len() >= 3);
    assert_eq!(
        recorder.devices.lock().as_slice(),
        &[DeviceMessage::NeedleCount(2), DeviceMessage::NeedleCount(4)]
    );
    assert!(recorder.errors.lock().is_empty());

    assert!(controller.remove_listener(handle));
}

#[test]
fn test_status_snapshot_tracks_run() {
    let (controller, _sim) = connected(fast_config());
    controller
        .execute(pattern(vec![step(4, Direction::Cw, 3)], 1))
        .unwrap();
    assert!(controller.wait_idle(Duration::from_secs(5)));

    let snapshot = controller.status_snapshot();
    assert_eq!(snapshot.state, MachineState::Connected);
    assert_eq!(snapshot.needle_count, DEFAULT_NEEDLE_COUNT);
    assert_eq!(snapshot.current_needle, 12);
    assert_eq!(snapshot.queue_len, 0);
    let execution = snapshot.execution.unwrap();
    assert_eq!(execution.needles_completed, 12);
    assert!((execution.progress_percent() - 100.0).abs() < f64::EPSILON);
}
