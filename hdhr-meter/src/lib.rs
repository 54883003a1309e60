//! Single-worker controller for HDHomeRun tuner devices.
//!
//! This crate serializes all access to one tuner behind a dedicated
//! device worker:
//!
//! - [`controller::DeviceController`]: the public command surface; every
//!   command is enqueued and executed in strict FIFO order on the worker
//! - [`driver::TunerDriver`]: the blocking facade over the tuner hardware
//! - [`controller::ControllerEvents`]: per-kind observer channels fed from
//!   a UI-affine dispatch context, never from the worker itself
//!
//! The worker also runs the self-rescheduling tuner-status poll and the
//! cancellable channel-scan sweep; both are ordinary queued tasks, so a
//! long command naturally delays the next poll tick and vice versa.

pub mod config;
pub mod controller;
pub mod driver;
pub mod logging;

pub use config::ControllerConfig;
pub use controller::{
    BusyIndicator, ControllerEvents, DeviceController, NullBusyIndicator, Observable, PollLoop,
    Subscription,
};
pub use driver::{LineupSource, TunerConnector, TunerDriver};
