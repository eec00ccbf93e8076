//! Shared fixtures for controller tests

#![allow(dead_code)]

use knitkit_communication::{
    ControllerConfig, DispatcherConfig, ExecutionConfig, KnittingController, SimulatedTransport,
    SimulatorHandle, TransportParams,
};
use knitkit_core::{
    AppEvent, Direction, EventFilter, ExecutionEvent, KnittingPattern, PatternStep, ThreadSafe,
};
use std::sync::Arc;
use std::time::Duration;

/// Tuning that keeps every wait in the tens of milliseconds
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        needle_count: 48,
        dispatcher: DispatcherConfig {
            response_timeout: Duration::from_millis(100),
            max_retries: 0,
            retry_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            ..DispatcherConfig::default()
        },
        execution: ExecutionConfig {
            step_timeout: Duration::from_secs(2),
            inter_step_delay: Duration::ZERO,
            pause_poll_interval: Duration::from_millis(5),
            ..ExecutionConfig::default()
        },
    }
}

/// Controller connected to a fresh simulator
pub fn connected(config: ControllerConfig) -> (KnittingController, SimulatorHandle) {
    let controller = KnittingController::new(config);
    let sim = SimulatedTransport::new();
    let handle = sim.handle();
    controller
        .connect_with(Box::new(sim), &TransportParams::simulated())
        .expect("simulator connects");
    (controller, handle)
}

pub fn step(needles: u32, direction: Direction, rows: u32) -> PatternStep {
    PatternStep::new(needles, direction, rows, "").expect("valid step")
}

pub fn pattern(steps: Vec<PatternStep>, repetitions: u32) -> Arc<KnittingPattern> {
    Arc::new(KnittingPattern::new("test", steps, repetitions, "").expect("valid pattern"))
}

/// Record every execution event the controller publishes
pub fn record_execution(controller: &KnittingController) -> ThreadSafe<Vec<ExecutionEvent>> {
    let events = knitkit_core::thread_safe(Vec::new());
    let sink = events.clone();
    controller.bus().subscribe(EventFilter::All, move |event| {
        if let AppEvent::Execution(e) = event {
            sink.lock().push(e);
        }
    });
    events
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
