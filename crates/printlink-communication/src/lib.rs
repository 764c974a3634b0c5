//! # printlink Communication
//!
//! Serial transport, Marlin protocol handling, command flow control and the
//! print job state machine, tied together by [`PrinterHost`].

pub mod communication;
pub mod firmware;
pub mod host;
pub mod job;

pub use communication::{
    buffered::{Ack, BufferAccounting, CommandFlowController, CommandStatus, FlowConfig, PendingCommand},
    link::{FlowSignal, Link, ReaderConfig},
    serial::{list_ports, RealSerialPort, SerialPortInfo, SerialPortOpener},
    session::{ConnectOptions, LinkSessionManager, SessionConfig, SessionInfo, DEFAULT_BAUD_RATES},
    ConnectionParams, PortOpener, SerialParity, Transport,
};

pub use firmware::marlin::{
    FirmwareInfo, MarlinResponse, MarlinResponseParser, MarlinSettings, ParkMotion,
};

pub use host::{HostConfig, JobHandle, PrinterHost};

pub use job::{
    JobFailure, JobSettings, JobStatus, PrintJob, StreamOptions, StreamSummary, StreamingAdapter,
};
