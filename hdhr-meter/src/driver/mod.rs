//! Driver facade for tuner hardware.
//!
//! The controller never talks to a device directly; it goes through
//! [`TunerDriver`], a synchronous facade whose every call may block
//! briefly and may fail. Device discovery and the wire protocol live
//! behind [`TunerConnector`] and are not this crate's concern.

pub mod sim;

use hdhr_types::{
    CableCardStatus, ChannelList, DeviceDescriptor, DeviceType, DriverError, ProgramsList,
    TunerStatus, VirtualChannel,
};

/// Blocking facade over one bound tuner.
///
/// All calls are issued from the device worker only, so implementations
/// need no internal synchronization beyond being [`Send`]. The
/// lock-lease calls coordinate with *other* controllers of the same
/// hardware, possibly in other processes.
pub trait TunerDriver: Send {
    /// Kind of hardware behind this handle.
    fn device_type(&self) -> DeviceType;

    /// Name of the channel map the tuner is currently using.
    fn current_channel_map(&mut self) -> Result<String, DriverError>;

    /// All channel maps the tuner supports, in driver order.
    fn channel_maps(&mut self) -> Result<Vec<String>, DriverError>;

    /// Switch the tuner to a different channel map.
    fn set_channel_map(&mut self, map: &str) -> Result<(), DriverError>;

    /// Build the list of tunable channel numbers for a channel map.
    fn create_channel_list(&mut self, map: &str) -> Result<ChannelList, DriverError>;

    /// Programs present in the currently tuned transport stream.
    fn tuner_stream_info(&mut self) -> Result<ProgramsList, DriverError>;

    /// Currently tuned channel number, zero when untuned.
    fn current_channel(&mut self) -> Result<u32, DriverError>;

    /// Currently selected program number, as the driver reports it.
    fn tuner_program(&mut self) -> Result<String, DriverError>;

    /// Select a program within the tuned stream.
    fn set_tuner_program(&mut self, program: &str) -> Result<(), DriverError>;

    /// Channel descriptor (`modulation:number`) the tuner reports.
    fn tuner_channel(&mut self) -> Result<String, DriverError>;

    /// Tune to a channel number.
    fn set_tuner_channel(&mut self, channel: &str) -> Result<(), DriverError>;

    /// Tune by CableCard virtual channel number.
    fn set_virtual_channel(&mut self, vchannel: &str) -> Result<(), DriverError>;

    /// Read a fresh front-end status snapshot.
    fn update_tuner_status(&mut self) -> Result<TunerStatus, DriverError>;

    /// Request the tuner's lock token. `Ok(true)` means the lease was
    /// granted; `Ok(false)` means a competing owner holds it.
    fn tuner_lock_request(&mut self) -> Result<bool, DriverError>;

    /// Release the lock token. Safe to call without holding it.
    fn tuner_lock_release(&mut self) -> Result<(), DriverError>;

    /// Identity of whoever currently holds the lock token.
    fn lock_owner(&mut self) -> String;

    /// CableCard slot status. [`DriverError::Unsupported`] on other
    /// device types.
    fn card_status(&mut self) -> Result<CableCardStatus, DriverError>;

    /// Point the tuner's stream output at a network target URI.
    fn set_target_ip(&mut self, uri: &str) -> Result<(), DriverError>;

    /// Tear the handle down. The handle must not be used afterwards.
    fn destroy(&mut self);
}

/// Binds a [`DeviceDescriptor`] to a live driver handle.
///
/// Discovery produced the descriptor elsewhere; this only performs the
/// construction/binding step, which is the one failure that propagates
/// to the caller of device binding.
pub trait TunerConnector: Send + Sync {
    fn connect(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TunerDriver>, DriverError>;
}

/// Supplies the published channel lineup for CableCard full scans.
///
/// The document behind `url` is an opaque external dependency; fetching
/// and parsing happen entirely behind this trait.
pub trait LineupSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<VirtualChannel>, DriverError>;
}
