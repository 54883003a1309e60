//! In-memory simulated tuner backend.
//!
//! Stands in for real hardware the way the real driver binding would,
//! since discovery and the wire protocol are external concerns. The
//! backend is scriptable (external lock owners, limited lock grants,
//! forced communication failures) and journals every driver call, which
//! is what the tests assert serialization against.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use hdhr_types::{
    CableCardStatus, ChannelList, ChannelScanProgram, DeviceDescriptor, DeviceType, DriverError,
    ProgramsList, TunerStatus, VirtualChannel, CARD_READY, CARD_SUCCESS,
};

use crate::driver::{LineupSource, TunerConnector, TunerDriver};

#[derive(Debug)]
struct SimState {
    device_type: DeviceType,
    maps: BTreeMap<String, Vec<u32>>,
    current_map: String,
    /// Currently tuned channel number, zero when untuned.
    current_channel: u32,
    current_program: u32,
    /// Channels that carry signal, with the programs found on them.
    programs: BTreeMap<u32, Vec<ChannelScanProgram>>,
    /// Virtual channel number -> physical channel mapping.
    virtual_channels: BTreeMap<String, u32>,
    /// Competing lock owner; lock requests are denied while set.
    external_owner: Option<String>,
    /// Remaining lock grants before requests are denied; `None` means
    /// unlimited.
    grants_remaining: Option<u32>,
    /// When set, every driver call fails with a communication error.
    comm_failure: bool,
    /// When set, `connect` fails.
    refuse_connect: bool,
    lock_held: bool,
    card_status: CableCardStatus,
    target_uri: Option<String>,
    destroyed: bool,
    calls: Vec<String>,
}

impl SimState {
    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }

    fn check_comm(&self) -> Result<(), DriverError> {
        if self.comm_failure {
            Err(DriverError::Comm("simulated communication failure".into()))
        } else {
            Ok(())
        }
    }

    fn modulation(&self) -> &'static str {
        match self.device_type {
            DeviceType::Atsc => "8vsb",
            DeviceType::CableCard => "qam256",
        }
    }
}

/// Scriptable simulated tuner backend.
///
/// Acts as the [`TunerConnector`]; handles it produces all share the same
/// underlying state, so a test can keep the backend and inspect what the
/// controller did to the device.
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new(device_type: DeviceType) -> Self {
        let card_status = match device_type {
            DeviceType::CableCard => CableCardStatus {
                card: CARD_READY.into(),
                auth: CARD_SUCCESS.into(),
                oob: CARD_SUCCESS.into(),
            },
            DeviceType::Atsc => CableCardStatus::default(),
        };
        Self {
            state: Arc::new(Mutex::new(SimState {
                device_type,
                maps: BTreeMap::new(),
                current_map: String::new(),
                current_channel: 0,
                current_program: 0,
                programs: BTreeMap::new(),
                virtual_channels: BTreeMap::new(),
                external_owner: None,
                grants_remaining: None,
                comm_failure: false,
                refuse_connect: false,
                lock_held: false,
                card_status,
                target_uri: None,
                destroyed: false,
                calls: Vec::new(),
            })),
        }
    }

    /// Register a channel map; the first registered map becomes current.
    pub fn with_map(self, name: &str, channels: Vec<u32>) -> Self {
        {
            let mut state = self.state.lock();
            if state.current_map.is_empty() {
                state.current_map = name.to_string();
            }
            state.maps.insert(name.to_string(), channels);
        }
        self
    }

    /// Put programs (signal) on a channel.
    pub fn with_programs(self, channel: u32, programs: Vec<ChannelScanProgram>) -> Self {
        self.state.lock().programs.insert(channel, programs);
        self
    }

    /// Map a virtual channel number onto a physical channel.
    pub fn with_virtual_channel(self, vchannel: &str, channel: u32) -> Self {
        self.state
            .lock()
            .virtual_channels
            .insert(vchannel.to_string(), channel);
        self
    }

    /// Script a competing lock owner; requests are denied while set.
    pub fn set_external_owner(&self, owner: Option<&str>) {
        self.state.lock().external_owner = owner.map(str::to_string);
    }

    /// Allow only `n` more lock grants, denying afterwards as if `owner`
    /// took the tuner.
    pub fn limit_lock_grants(&self, n: u32, owner: &str) {
        let mut state = self.state.lock();
        state.grants_remaining = Some(n);
        state.external_owner = Some(owner.to_string());
    }

    /// Force every subsequent driver call to fail with a communication
    /// error.
    pub fn set_comm_failure(&self, failing: bool) {
        self.state.lock().comm_failure = failing;
    }

    /// Make `connect` refuse to bind.
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    pub fn set_card_status(&self, status: CableCardStatus) {
        self.state.lock().card_status = status;
    }

    /// Snapshot of every driver call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls whose name starts with `prefix`.
    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn is_lock_held(&self) -> bool {
        self.state.lock().lock_held
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub fn target_uri(&self) -> Option<String> {
        self.state.lock().target_uri.clone()
    }
}

impl TunerConnector for SimBackend {
    fn connect(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn TunerDriver>, DriverError> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(DriverError::Comm(format!(
                "no response from device {descriptor}"
            )));
        }
        debug!("sim: binding tuner {descriptor}");
        state.destroyed = false;
        state.record("connect");
        Ok(Box::new(SimTuner {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Driver handle over the shared simulated state.
pub struct SimTuner {
    state: Arc<Mutex<SimState>>,
}

impl TunerDriver for SimTuner {
    fn device_type(&self) -> DeviceType {
        self.state.lock().device_type
    }

    fn current_channel_map(&mut self) -> Result<String, DriverError> {
        let mut state = self.state.lock();
        state.record("current_channel_map");
        state.check_comm()?;
        Ok(state.current_map.clone())
    }

    fn channel_maps(&mut self) -> Result<Vec<String>, DriverError> {
        let mut state = self.state.lock();
        state.record("channel_maps");
        state.check_comm()?;
        Ok(state.maps.keys().cloned().collect())
    }

    fn set_channel_map(&mut self, map: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record(format!("set_channel_map:{map}"));
        state.check_comm()?;
        if !state.maps.contains_key(map) {
            return Err(DriverError::Rejected(format!("unknown channel map {map}")));
        }
        state.current_map = map.to_string();
        state.current_channel = 0;
        state.current_program = 0;
        Ok(())
    }

    fn create_channel_list(&mut self, map: &str) -> Result<ChannelList, DriverError> {
        let mut state = self.state.lock();
        state.record(format!("create_channel_list:{map}"));
        state.check_comm()?;
        match state.maps.get(map) {
            Some(numbers) => Ok(ChannelList::from_numbers(numbers.clone())),
            None => Err(DriverError::Rejected(format!("unknown channel map {map}"))),
        }
    }

    fn tuner_stream_info(&mut self) -> Result<ProgramsList, DriverError> {
        let mut state = self.state.lock();
        state.record("tuner_stream_info");
        state.check_comm()?;
        let programs = state
            .programs
            .get(&state.current_channel)
            .cloned()
            .unwrap_or_default();
        Ok(ProgramsList::new(programs))
    }

    fn current_channel(&mut self) -> Result<u32, DriverError> {
        let mut state = self.state.lock();
        state.record("current_channel");
        state.check_comm()?;
        Ok(state.current_channel)
    }

    fn tuner_program(&mut self) -> Result<String, DriverError> {
        let mut state = self.state.lock();
        state.record("tuner_program");
        state.check_comm()?;
        Ok(state.current_program.to_string())
    }

    fn set_tuner_program(&mut self, program: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record(format!("set_tuner_program:{program}"));
        state.check_comm()?;
        let number: u32 = program
            .parse()
            .map_err(|_| DriverError::Rejected(format!("bad program number {program:?}")))?;
        state.current_program = number;
        Ok(())
    }

    fn tuner_channel(&mut self) -> Result<String, DriverError> {
        let mut state = self.state.lock();
        state.record("tuner_channel");
        state.check_comm()?;
        if state.current_channel == 0 {
            Ok("none".to_string())
        } else {
            Ok(format!("{}:{}", state.modulation(), state.current_channel))
        }
    }

    fn set_tuner_channel(&mut self, channel: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record(format!("set_tuner_channel:{channel}"));
        state.check_comm()?;
        let number: u32 = channel
            .parse()
            .map_err(|_| DriverError::Rejected(format!("bad channel number {channel:?}")))?;
        state.current_channel = number;
        state.current_program = 0;
        Ok(())
    }

    fn set_virtual_channel(&mut self, vchannel: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record(format!("set_virtual_channel:{vchannel}"));
        state.check_comm()?;
        if state.device_type != DeviceType::CableCard {
            return Err(DriverError::Unsupported);
        }
        match state.virtual_channels.get(vchannel).copied() {
            Some(channel) => {
                state.current_channel = channel;
                state.current_program = 0;
                Ok(())
            }
            None => Err(DriverError::Rejected(format!(
                "no such virtual channel {vchannel}"
            ))),
        }
    }

    fn update_tuner_status(&mut self) -> Result<TunerStatus, DriverError> {
        let mut state = self.state.lock();
        state.record("update_tuner_status");
        state.check_comm()?;
        let tuned = state.current_channel != 0;
        let has_signal = tuned && state.programs.contains_key(&state.current_channel);
        Ok(TunerStatus {
            channel: if tuned {
                format!("{}:{}", state.modulation(), state.current_channel)
            } else {
                "none".to_string()
            },
            lock: if has_signal {
                state.modulation().to_string()
            } else {
                "none".to_string()
            },
            signal_present: has_signal,
            signal_strength: if has_signal { 92 } else { 0 },
            signal_to_noise_quality: if has_signal { 88 } else { 0 },
            symbol_error_quality: if has_signal { 100 } else { 0 },
            return_status: 1,
        })
    }

    fn tuner_lock_request(&mut self) -> Result<bool, DriverError> {
        let mut state = self.state.lock();
        state.record("tuner_lock_request");
        state.check_comm()?;
        if state.lock_held {
            // Re-request by the current holder is granted.
            return Ok(true);
        }
        match state.grants_remaining {
            Some(0) => return Ok(false),
            Some(ref mut n) => *n -= 1,
            None => {
                if state.external_owner.is_some() {
                    return Ok(false);
                }
            }
        }
        state.lock_held = true;
        Ok(true)
    }

    fn tuner_lock_release(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record("tuner_lock_release");
        state.check_comm()?;
        state.lock_held = false;
        Ok(())
    }

    fn lock_owner(&mut self) -> String {
        let state = self.state.lock();
        if state.lock_held {
            "self".to_string()
        } else {
            state
                .external_owner
                .clone()
                .unwrap_or_else(|| "none".to_string())
        }
    }

    fn card_status(&mut self) -> Result<CableCardStatus, DriverError> {
        let mut state = self.state.lock();
        state.record("card_status");
        state.check_comm()?;
        if state.device_type != DeviceType::CableCard {
            return Err(DriverError::Unsupported);
        }
        Ok(state.card_status.clone())
    }

    fn set_target_ip(&mut self, uri: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.record(format!("set_target_ip:{uri}"));
        state.check_comm()?;
        state.target_uri = Some(uri.to_string());
        Ok(())
    }

    fn destroy(&mut self) {
        let mut state = self.state.lock();
        state.record("destroy");
        state.lock_held = false;
        state.destroyed = true;
    }
}

/// Fixed lineup used by the simulated backend.
pub struct SimLineup {
    channels: Vec<VirtualChannel>,
}

impl SimLineup {
    pub fn new(channels: Vec<VirtualChannel>) -> Self {
        Self { channels }
    }
}

impl LineupSource for SimLineup {
    fn fetch(&self, url: &str) -> Result<Vec<VirtualChannel>, DriverError> {
        debug!("sim: serving lineup for {url}");
        Ok(self.channels.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SimBackend {
        SimBackend::new(DeviceType::Atsc).with_map("us-bcast", vec![2, 5, 12, 69])
    }

    #[test]
    fn test_connect_and_tune() {
        let backend = backend();
        let desc = DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0);
        let mut tuner = backend.connect(&desc).unwrap();

        assert_eq!(tuner.current_channel().unwrap(), 0);
        tuner.set_tuner_channel("12").unwrap();
        assert_eq!(tuner.current_channel().unwrap(), 12);
        assert_eq!(tuner.tuner_channel().unwrap(), "8vsb:12");
    }

    #[test]
    fn test_lock_grant_limit() {
        let backend = backend();
        backend.limit_lock_grants(1, "192.168.1.50");
        let desc = DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0);
        let mut tuner = backend.connect(&desc).unwrap();

        assert!(tuner.tuner_lock_request().unwrap());
        tuner.tuner_lock_release().unwrap();
        assert!(!tuner.tuner_lock_request().unwrap());
        assert_eq!(tuner.lock_owner(), "192.168.1.50");
    }

    #[test]
    fn test_comm_failure_scripting() {
        let backend = backend();
        let desc = DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0);
        let mut tuner = backend.connect(&desc).unwrap();

        backend.set_comm_failure(true);
        assert!(matches!(
            tuner.update_tuner_status(),
            Err(DriverError::Comm(_))
        ));
    }

    #[test]
    fn test_virtual_tune_requires_cablecard() {
        let backend = backend().with_virtual_channel("702", 12);
        let desc = DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0);
        let mut tuner = backend.connect(&desc).unwrap();
        assert!(matches!(
            tuner.set_virtual_channel("702"),
            Err(DriverError::Unsupported)
        ));

        let cable = SimBackend::new(DeviceType::CableCard)
            .with_map("us-cable", vec![2, 135])
            .with_virtual_channel("702", 135);
        let mut tuner = cable.connect(&desc).unwrap();
        tuner.set_virtual_channel("702").unwrap();
        assert_eq!(tuner.current_channel().unwrap(), 135);
    }
}
