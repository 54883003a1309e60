//! Shared data model for the HDHomeRun tuner controller.
//!
//! This crate defines the types exchanged between the device worker and
//! its observers:
//!
//! - [`DeviceResponse`]: the uniform outcome envelope every worker-side
//!   operation reports through
//! - [`TunerStatus`] / [`CurrentChannelAndProgram`]: poll-cycle snapshots,
//!   compared structurally to decide whether observers are notified
//! - [`ChannelList`] / [`ProgramsList`]: derived state rebuilt when the
//!   channel map or tuned channel changes
//! - [`DeviceDescriptor`] / [`DeviceType`] / [`CableCardStatus`]: device
//!   identity and CableCard readiness
//! - [`DriverError`] / [`ControllerError`]: the failure taxonomy
//!
//! ```rust
//! use hdhr_types::{ChannelList, DeviceResponse, ScanDirection};
//!
//! let list = ChannelList::from_numbers(vec![2, 5, 12, 69]);
//! assert_eq!(list.min_number(), Some(2));
//! assert_eq!(list.next_position(1, ScanDirection::Forward), Some(2));
//!
//! let resp = DeviceResponse::success().with_action("setting channel");
//! assert!(resp.is_success());
//! ```

pub mod channels;
pub mod device;
pub mod error;
pub mod programs;
pub mod response;
pub mod status;

pub use channels::{channel_number_from_descriptor, ChannelList, ScanDirection, VirtualChannel};
pub use device::{DeviceDescriptor, DeviceType};
pub use error::{ControllerError, DriverError};
pub use programs::{ChannelScanProgram, ProgramsList};
pub use response::{
    Attr, DeviceResponse, KEY_ACTION, KEY_ERROR, KEY_LOCKED, STATUS_COMM_ERROR, STATUS_FAILURE,
    STATUS_SUCCESS,
};
pub use status::{
    CableCardStatus, CurrentChannelAndProgram, TunerStatus, CARD_OOB_WEAK, CARD_READY,
    CARD_SUCCESS,
};
