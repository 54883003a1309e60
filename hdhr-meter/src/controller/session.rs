//! Worker-side device session: the state and handlers behind every task.
//!
//! A session lives on the device worker thread for the lifetime of the
//! controller. It owns the bound driver handle exclusively; nothing
//! outside the worker ever touches the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use hdhr_types::{
    channel_number_from_descriptor, CableCardStatus, ChannelList, ControllerError,
    DeviceDescriptor, DeviceResponse, DeviceType, DriverError, TunerStatus, KEY_ERROR,
};

use crate::config::ControllerConfig;
use crate::controller::events::{
    ChannelChange, ChannelMapChange, Notification, ProgramChange, ProgramListChange,
};
use crate::controller::lease::with_lock;
use crate::controller::poll::PollLoop;
use crate::controller::worker::Task;
use crate::driver::{LineupSource, TunerConnector, TunerDriver};

/// State the worker and the controller facade both need to see.
///
/// Everything here is written on the worker during setup/teardown and
/// read from the caller context for synchronous validation, so each slot
/// is its own lock (or a SeqCst flag).
#[derive(Clone)]
pub(crate) struct SharedState {
    /// Set once a device is bound and usable; public commands guard on
    /// this before enqueueing anything.
    pub device_ready: Arc<AtomicBool>,
    pub device_type: Arc<RwLock<Option<DeviceType>>>,
    pub channel_list: Arc<RwLock<ChannelList>>,
    pub current_map: Arc<RwLock<String>>,
    pub card_status: Arc<RwLock<Option<CableCardStatus>>>,
    pub descriptor: Arc<RwLock<Option<DeviceDescriptor>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            device_ready: Arc::new(AtomicBool::new(false)),
            device_type: Arc::new(RwLock::new(None)),
            channel_list: Arc::new(RwLock::new(ChannelList::default())),
            current_map: Arc::new(RwLock::new(String::new())),
            card_status: Arc::new(RwLock::new(None)),
            descriptor: Arc::new(RwLock::new(None)),
        }
    }
}

/// Everything a task execution can reach.
pub(crate) struct DeviceSession {
    pub(crate) connector: Arc<dyn TunerConnector>,
    pub(crate) lineup: Option<Arc<dyn LineupSource>>,
    pub(crate) device: Option<Box<dyn TunerDriver>>,
    pub(crate) shared: SharedState,
    /// True while this controller holds the tuner's lock token. Sweeps
    /// keep it set across probes; commands hold it transiently.
    pub(crate) lease_held: bool,
    /// Previous poll snapshot; advances every cycle whether or not a
    /// notification fired.
    pub(crate) prev_status: TunerStatus,
    pub(crate) poll: PollLoop,
    /// Self re-enqueue path for poll ticks and scan steps.
    pub(crate) tx: mpsc::UnboundedSender<Task>,
    pub(crate) notifier: mpsc::UnboundedSender<Notification>,
    /// Timer context for the delayed poll re-enqueue.
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) cfg: ControllerConfig,
}

impl DeviceSession {
    /// Run one task to completion. Never panics the worker: failures
    /// become DeviceResponses on the event bus and the next task
    /// proceeds.
    pub(crate) fn execute(&mut self, task: Task) {
        match task {
            Task::Setup { descriptor, ack } => {
                let result = self.setup(descriptor);
                let _ = ack.send(result);
                self.settle();
            }
            Task::Initialize { report_initial } => {
                self.initialize(report_initial);
                self.settle();
            }
            Task::SetChannelMap { map } => {
                self.set_channel_map(map);
                self.settle();
            }
            Task::SetChannel { channel } => {
                self.set_channel(channel);
                self.settle();
            }
            Task::SetVirtualChannel { vchannel } => {
                self.set_virtual_channel(vchannel);
                self.settle();
            }
            Task::SetProgram { program } => {
                self.set_program(program);
                self.settle();
            }
            Task::SetTarget { uri, ack } => {
                let _ = ack.send(self.set_target(uri));
                self.settle();
            }
            Task::Poll => self.poll_cycle(),
            Task::ScanStart { scan, start } => self.scan_start(scan, start),
            Task::ScanStep { scan, position } => self.scan_step(scan, position),
            Task::LineupScan { scan, url } => self.lineup_scan(scan, url),
            Task::LineupStep {
                scan,
                channels,
                index,
            } => self.lineup_step(scan, channels, index),
            Task::Teardown { ack } => {
                self.teardown();
                let _ = ack.send(());
            }
            #[cfg(test)]
            Task::Barrier { ack } => {
                let _ = ack.send(());
            }
            Task::Stop => {}
        }
    }

    /// Worker-exit cleanup: release the lease and the device handle.
    pub(crate) fn shutdown(&mut self) {
        self.teardown();
    }

    pub(crate) fn notify(&self, notification: Notification) {
        let _ = self.notifier.send(notification);
    }

    pub(crate) fn busy(&self, busy: bool) {
        self.notify(Notification::Busy(busy));
    }

    /// The hardware needs a short pause after each command before it
    /// accepts the next one.
    fn settle(&self) {
        if self.cfg.settle_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.cfg.settle_delay_ms));
        }
    }

    pub(crate) fn unavailable_response(action: &str) -> DeviceResponse {
        let mut response = DeviceResponse::failure().with_action(action);
        response.put_text(KEY_ERROR, "no device set");
        response
    }

    /// Bind a device, tearing any previous one down first. The result
    /// travels back to the caller of device binding; everything else the
    /// session does reports through the event bus instead.
    fn setup(&mut self, descriptor: DeviceDescriptor) -> Result<(), ControllerError> {
        self.teardown_current();

        info!("binding device {descriptor}");
        let mut device = match self.connector.connect(&descriptor) {
            Ok(device) => device,
            Err(e) => {
                error!("communications error while setting up device: {e}");
                return Err(ControllerError::Setup(e));
            }
        };

        match Self::prime_device(device.as_mut()) {
            Ok((map, list, status)) => {
                debug!(
                    "channel list for {map}: {} channels, range {:?}..{:?}",
                    list.len(),
                    list.min_number(),
                    list.max_number()
                );
                *self.shared.current_map.write() = map;
                *self.shared.channel_list.write() = list;
                *self.shared.device_type.write() = Some(device.device_type());
                *self.shared.descriptor.write() = Some(descriptor.clone());

                let channel = channel_number_from_descriptor(&status.channel).unwrap_or(0);
                self.prev_status = TunerStatus::default();
                self.device = Some(device);
                self.shared.device_ready.store(true, Ordering::SeqCst);

                self.notify(Notification::ChannelChanged(ChannelChange {
                    response: DeviceResponse::success().with_action("setting device"),
                    channel,
                }));
                Ok(())
            }
            Err(e) => {
                // Roll the partially-constructed device back.
                device.destroy();
                error!("communications error while setting up device: {e}");
                Err(ControllerError::Setup(e))
            }
        }
    }

    fn prime_device(
        device: &mut dyn TunerDriver,
    ) -> Result<(String, ChannelList, TunerStatus), DriverError> {
        let map = device.current_channel_map()?;
        let list = device.create_channel_list(&map)?;
        let status = device.update_tuner_status()?;
        Ok((map, list, status))
    }

    fn teardown_current(&mut self) {
        if let Some(mut device) = self.device.take() {
            // Releasing without holding is fine; the driver treats it as
            // a no-op.
            let _ = device.tuner_lock_release();
            device.destroy();
        }
        self.lease_held = false;
        self.shared.device_ready.store(false, Ordering::SeqCst);
        *self.shared.device_type.write() = None;
        *self.shared.card_status.write() = None;
        *self.shared.descriptor.write() = None;
    }

    /// Release the lease, destroy the handle, stop accepting device
    /// commands.
    pub(crate) fn teardown(&mut self) {
        self.teardown_current();
    }

    /// Discover channel maps, card status, and the initial program list
    /// for a freshly bound device.
    fn initialize(&mut self, report_initial: bool) {
        const ACTION: &str = "initializing device";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            self.busy(false);
            return;
        };

        debug!("initializing the channel map");
        let current = device.current_channel_map();
        let maps = current.and_then(|current| Ok((current, device.channel_maps()?)));
        let (current, maps) = match maps {
            Ok(v) => v,
            Err(e) => {
                let response = DeviceResponse::from_driver(ACTION, Err(e));
                let map = self.shared.current_map.read().clone();
                self.notify(Notification::ChannelMapChanged(ChannelMapChange {
                    response,
                    map,
                }));
                self.busy(false);
                return;
            }
        };

        let active_map = if maps.contains(&current) {
            current
        } else {
            debug!("no initial channel map, falling back to the first");
            maps.first().cloned().unwrap_or(current)
        };

        let card = if device.device_type() == DeviceType::CableCard {
            device.card_status().ok()
        } else {
            None
        };

        let programs = device.tuner_stream_info().unwrap_or_default();
        let channel = device.current_channel().unwrap_or(0);
        let program_number = match device.tuner_program() {
            Ok(p) => p.parse::<u32>().unwrap_or_else(|_| {
                debug!("failed to parse program number from {p:?}");
                0
            }),
            Err(_) => 0,
        };

        *self.shared.current_map.write() = active_map.clone();
        *self.shared.card_status.write() = card;

        self.notify(Notification::ChannelMapListChanged(maps));
        if report_initial {
            self.notify(Notification::ChannelMapChanged(ChannelMapChange {
                response: DeviceResponse::success().with_action(ACTION),
                map: active_map,
            }));
        }

        self.notify(Notification::ProgramListChanged(ProgramListChange {
            programs: programs.clone(),
            channel,
        }));
        if program_number > 0 && report_initial {
            self.notify(Notification::ProgramChanged(ProgramChange {
                response: DeviceResponse::success().with_action(ACTION),
                program: programs.by_number(program_number).cloned(),
            }));
        }

        self.busy(false);
    }

    fn set_channel_map(&mut self, new_map: String) {
        const ACTION: &str = "setting channel map";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            let map = self.shared.current_map.read().clone();
            self.notify(Notification::ChannelMapChanged(ChannelMapChange {
                response: Self::unavailable_response(ACTION),
                map,
            }));
            self.busy(false);
            return;
        };

        let channel_list = Arc::clone(&self.shared.channel_list);
        let current_map = Arc::clone(&self.shared.current_map);

        let response = with_lock(device.as_mut(), &mut self.lease_held, ACTION, |dev| {
            let prev = match dev.current_channel_map() {
                Ok(map) => map,
                Err(e) => return DeviceResponse::from_driver(ACTION, Err(e)),
            };
            debug!("{ACTION}: new map {new_map} old map {prev}");

            if prev != new_map {
                if let Err(e) = dev.set_channel_map(&new_map) {
                    return DeviceResponse::from_driver(ACTION, Err(e));
                }
                match dev.create_channel_list(&new_map) {
                    Ok(list) => {
                        debug!(
                            "{ACTION}: rebuilt channel list, {} channels, range {:?}..{:?}",
                            list.len(),
                            list.min_number(),
                            list.max_number()
                        );
                        *channel_list.write() = list;
                        *current_map.write() = new_map.clone();
                    }
                    Err(e) => return DeviceResponse::from_driver(ACTION, Err(e)),
                }
            }
            DeviceResponse::success().with_action(ACTION)
        });

        let map = self.shared.current_map.read().clone();
        self.notify(Notification::ChannelMapChanged(ChannelMapChange {
            response,
            map,
        }));
        self.busy(false);
    }

    fn set_channel(&mut self, channel: u32) {
        const ACTION: &str = "setting channel";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            self.notify(Notification::ChannelChanged(ChannelChange {
                response: Self::unavailable_response(ACTION),
                channel,
            }));
            self.busy(false);
            return;
        };

        debug!("{ACTION}: channel {channel}");
        let response = with_lock(device.as_mut(), &mut self.lease_held, ACTION, |dev| {
            let current = match dev.current_channel() {
                Ok(current) => current,
                Err(e) => return DeviceResponse::from_driver(ACTION, Err(e)),
            };
            if current == channel {
                // Already tuned here; skip the mutate call.
                return DeviceResponse::success().with_action(ACTION);
            }
            DeviceResponse::from_driver(ACTION, dev.set_tuner_channel(&channel.to_string()))
        });

        let programs = if response.is_success() {
            device.tuner_stream_info().ok()
        } else {
            None
        };

        self.notify(Notification::ChannelChanged(ChannelChange {
            response,
            channel,
        }));
        if let Some(programs) = programs {
            self.notify(Notification::ProgramListChanged(ProgramListChange {
                programs,
                channel,
            }));
        }
        self.busy(false);
    }

    fn set_virtual_channel(&mut self, vchannel: String) {
        const ACTION: &str = "setting virtual channel";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            self.notify(Notification::ChannelChanged(ChannelChange {
                response: Self::unavailable_response(ACTION),
                channel: 0,
            }));
            self.busy(false);
            return;
        };

        debug!("{ACTION}: virtual channel {vchannel}");
        let response = with_lock(device.as_mut(), &mut self.lease_held, ACTION, |dev| {
            DeviceResponse::from_driver(ACTION, dev.set_virtual_channel(&vchannel))
        });

        let (channel, programs) = if response.is_success() {
            let channel = device.current_channel().unwrap_or(0);
            (channel, device.tuner_stream_info().ok())
        } else {
            (0, None)
        };

        self.notify(Notification::ChannelChanged(ChannelChange {
            response,
            channel,
        }));
        if let Some(programs) = programs {
            self.notify(Notification::ProgramListChanged(ProgramListChange {
                programs,
                channel,
            }));
        }
        self.busy(false);
    }

    fn set_program(&mut self, program: u32) {
        const ACTION: &str = "setting program";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            self.notify(Notification::ProgramChanged(ProgramChange {
                response: Self::unavailable_response(ACTION),
                program: None,
            }));
            self.busy(false);
            return;
        };

        // Stream info and the previous selection are plain reads; like
        // the poll reads they need no lease.
        let programs = device.tuner_stream_info().unwrap_or_default();
        let prev_number = device
            .tuner_program()
            .ok()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0);

        let response = with_lock(device.as_mut(), &mut self.lease_held, ACTION, |dev| {
            if prev_number == program {
                return DeviceResponse::success().with_action(ACTION);
            }
            DeviceResponse::from_driver(ACTION, dev.set_tuner_program(&program.to_string()))
        });

        // On contention the previous program is reported back so the UI
        // can snap its selection back.
        let reported = if response.is_success() {
            programs.by_number(program)
        } else {
            programs.by_number(prev_number)
        };

        self.notify(Notification::ProgramChanged(ProgramChange {
            response,
            program: reported.cloned(),
        }));
        self.busy(false);
    }

    fn set_target(&mut self, uri: String) -> DeviceResponse {
        const ACTION: &str = "setting network target";

        let Some(device) = self.device.as_mut() else {
            warn!("{ACTION}: no device set");
            return Self::unavailable_response(ACTION);
        };

        debug!("{ACTION}: {uri}");
        with_lock(device.as_mut(), &mut self.lease_held, ACTION, |dev| {
            DeviceResponse::from_driver(ACTION, dev.set_target_ip(&uri))
        })
    }
}
