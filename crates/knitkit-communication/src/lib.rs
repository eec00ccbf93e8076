//! # KnitKit Communication
//!
//! Transports (serial, TCP bridge, simulator), the wire protocol, the
//! single-flight command dispatcher and the pattern execution engine.
//! [`KnittingController`] is the entry point for applications.

pub mod communication;
pub mod machine;

pub use communication::{
    chunker::chunk_command,
    create_transport,
    dispatcher::{
        CancelToken, CommandCallback, CommandDispatcher, CommandResult, CommandStatus,
        DispatcherConfig, SharedTransport,
    },
    protocol::MotorCommand,
    response::{interpret, ResponseKind},
    serial::{list_ports, SerialPortInfo},
    simulated::{SimulatedTransport, SimulatorHandle},
    tcp::TcpTransport,
    Transport, TransportKind, TransportParams, DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT,
};

pub use machine::{
    ConnectionInfo, ControllerConfig, ExecutionConfig, KnittingController, MotionMode,
    NeedleTracker, DEFAULT_NEEDLE_COUNT,
};
