//! Device controller: the public command surface over the worker.
//!
//! This module provides:
//! - [`DeviceController`]: enqueues commands onto the single device
//!   worker and performs the synchronous validations that never touch
//!   the device (range checks, device-present guards)
//! - [`ControllerEvents`] / [`Observable`]: per-kind observer channels
//! - [`PollLoop`]: the self-rescheduling tuner-status refresh
//! - [`ScanHandle`]: the cancellable channel sweep

pub mod events;
pub mod lease;
pub mod poll;
pub mod scan;
pub mod session;
pub mod worker;

#[cfg(test)]
mod tests;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use hdhr_types::{
    CableCardStatus, ChannelList, ControllerError, DeviceDescriptor, DeviceResponse, DeviceType,
    ScanDirection, TunerStatus,
};

pub use events::{
    BusyIndicator, ChannelChange, ChannelLocked, ChannelMapChange, ControllerEvents,
    NullBusyIndicator, Observable, ProgramChange, ProgramListChange, ScanComplete, Subscription,
    TunerStatusChange,
};
pub use poll::PollLoop;
pub use scan::ScanHandle;

use crate::config::ControllerConfig;
use crate::controller::events::{dispatch_loop, BusyState, Notification};
use crate::controller::session::{DeviceSession, SharedState};
use crate::controller::worker::{CommandQueue, Task};
use crate::driver::{LineupSource, TunerConnector};

/// Controller over one tuner device.
///
/// Every command is enqueued onto a dedicated worker and executed in
/// strict FIFO submission order; results come back through
/// [`ControllerEvents`] on a UI-affine dispatch context, never on the
/// worker. Exactly one device is active per controller; re-binding tears
/// the previous device down first.
pub struct DeviceController {
    queue: CommandQueue,
    notifier: Option<mpsc::UnboundedSender<Notification>>,
    events: Arc<ControllerEvents>,
    busy: Arc<BusyState>,
    poll: PollLoop,
    scan: Mutex<Option<Arc<ScanHandle>>>,
    shared: SharedState,
    runtime: Option<tokio::runtime::Runtime>,
}

impl DeviceController {
    /// Bind `descriptor` through `connector` and start the worker.
    ///
    /// Binding is synchronous: on failure every partially-constructed
    /// piece is rolled back and the error propagates to this caller —
    /// there is no controller yet to notify through. On success the
    /// initialization pass (channel maps, card status, initial program
    /// list) is already enqueued.
    pub fn new(
        connector: Arc<dyn TunerConnector>,
        descriptor: DeviceDescriptor,
        busy_indicator: Arc<dyn BusyIndicator>,
        lineup: Option<Arc<dyn LineupSource>>,
        cfg: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(cfg.runtime_worker_threads)
            .enable_all()
            .build()
            .map_err(|e| ControllerError::WorkerSpawn(e.to_string()))?;

        let events = Arc::new(ControllerEvents::new());
        let busy = Arc::new(BusyState::new(busy_indicator));
        let (notifier, notifications) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_loop(
            notifications,
            Arc::clone(&events),
            Arc::clone(&busy),
        ));

        let shared = SharedState::new();
        let poll = PollLoop::new(Duration::from_millis(cfg.poll_interval_ms));
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let session = DeviceSession {
            connector,
            lineup,
            device: None,
            shared: shared.clone(),
            lease_held: false,
            prev_status: TunerStatus::default(),
            poll: poll.clone(),
            tx: task_tx.clone(),
            notifier: notifier.clone(),
            runtime: runtime.handle().clone(),
            cfg: cfg.clone(),
        };

        let queue = CommandQueue::spawn(&descriptor.to_string(), session, task_rx, task_tx)?;

        let controller = Self {
            queue,
            notifier: Some(notifier),
            events,
            busy,
            poll,
            scan: Mutex::new(None),
            shared,
            runtime: Some(runtime),
        };

        controller.bind_device(descriptor)?;
        Ok(controller)
    }

    /// Re-bind to a different device: tear the old one down, set the new
    /// one up synchronously, then re-run initialization.
    pub fn set_device(&self, descriptor: DeviceDescriptor) -> Result<(), ControllerError> {
        self.bind_device(descriptor)
    }

    fn bind_device(&self, descriptor: DeviceDescriptor) -> Result<(), ControllerError> {
        self.set_busy(true);

        let (ack, done) = oneshot::channel();
        self.queue.submit(Task::Setup { descriptor, ack })?;
        let result = done
            .blocking_recv()
            .unwrap_or(Err(ControllerError::WorkerGone));

        match result {
            Ok(()) => {
                // Initialization clears the busy indicator when it
                // completes.
                self.queue.submit(Task::Initialize {
                    report_initial: true,
                })?;
                Ok(())
            }
            Err(e) => {
                error!("failed to set device: {e}");
                self.set_busy(false);
                Err(e)
            }
        }
    }

    /// Re-run the initialization pass (channel-map list, card status,
    /// program list), optionally republishing the initial selections.
    pub fn initialize(&self, report_initial_status: bool) -> Result<(), ControllerError> {
        self.ensure_device()?;
        self.set_busy(true);
        self.queue.submit(Task::Initialize {
            report_initial: report_initial_status,
        })
    }

    /// Tune by channel number or, on CableCard devices, by virtual
    /// channel.
    ///
    /// Numeric tuning validates the input against the active channel
    /// map's `[min, max]` range here, synchronously, and issues no
    /// device call when it fails. Virtual tuning bypasses numeric
    /// validation and is delegated to the driver.
    pub fn set_tuner_channel(
        &self,
        channel: &str,
        is_virtual_tune: bool,
    ) -> Result<(), ControllerError> {
        self.ensure_device()?;
        let device_type = self.device_type().ok_or(ControllerError::NoDevice)?;

        if device_type == DeviceType::CableCard && is_virtual_tune {
            debug!("set_tuner_channel: virtual channel {channel}");
            self.set_busy(true);
            return self.queue.submit(Task::SetVirtualChannel {
                vchannel: channel.to_string(),
            });
        }

        let number: u32 = channel
            .trim()
            .parse()
            .map_err(|_| ControllerError::InvalidChannel(channel.to_string()))?;

        {
            let list = self.shared.channel_list.read();
            if !list.in_range(number) {
                return Err(ControllerError::ChannelOutOfRange {
                    channel: number,
                    min: list.min_number().unwrap_or(0),
                    max: list.max_number().unwrap_or(0),
                });
            }
        }

        debug!("set_tuner_channel: channel {number}");
        self.set_busy(true);
        self.queue.submit(Task::SetChannel { channel: number })
    }

    /// Switch the tuner's channel map. Setting the already-active map is
    /// reported as success without touching the device.
    pub fn set_channel_map(&self, map: &str) -> Result<(), ControllerError> {
        self.ensure_device()?;
        debug!("set_channel_map: new map {map}");
        self.set_busy(true);
        self.queue.submit(Task::SetChannelMap {
            map: map.to_string(),
        })
    }

    /// Select a program within the tuned stream.
    pub fn set_program(&self, program_number: u32) -> Result<(), ControllerError> {
        self.ensure_device()?;
        self.set_busy(true);
        self.queue.submit(Task::SetProgram {
            program: program_number,
        })
    }

    /// Point the tuner's stream output at a network target. Synchronous:
    /// the response comes back to this caller instead of the event bus.
    pub fn set_target_ip(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
    ) -> Result<DeviceResponse, ControllerError> {
        self.ensure_device()?;
        let uri = format!("{protocol}://{host}:{port}");
        let (ack, done) = oneshot::channel();
        self.queue.submit(Task::SetTarget { uri, ack })?;
        done.blocking_recv().map_err(|_| ControllerError::WorkerGone)
    }

    /// Start the recurring tuner-status poll. A no-op when already
    /// running.
    pub fn start_tuner_status_updates(&self) {
        if !self.poll.start() {
            return;
        }
        debug!("starting tuner status updates");
        if self.queue.submit(Task::Poll).is_err() {
            self.poll.stop();
        }
    }

    /// Stop the poll chain. Cooperative: one already-scheduled cycle may
    /// still execute.
    pub fn stop_tuner_status_updates(&self) {
        self.poll.stop();
    }

    pub fn is_tuner_status_updates_running(&self) -> bool {
        self.poll.is_running()
    }

    /// Sweep channels upward from `start` (or from the current position).
    ///
    /// Starting a sweep that is already running in the same direction is
    /// a no-op; starting against a sweep running the other way cancels
    /// it and returns to idle without starting a new one.
    pub fn channel_scan_forward(&self, start: Option<u32>) -> Result<(), ControllerError> {
        self.start_scan(ScanDirection::Forward, start)
    }

    /// Sweep channels downward from `start` (or from the current
    /// position).
    pub fn channel_scan_backward(&self, start: Option<u32>) -> Result<(), ControllerError> {
        self.start_scan(ScanDirection::Backward, start)
    }

    fn start_scan(
        &self,
        direction: ScanDirection,
        start: Option<u32>,
    ) -> Result<(), ControllerError> {
        self.ensure_device()?;

        let mut slot = self.scan.lock();
        if let Some(current) = slot.as_ref() {
            if current.is_running() {
                if current.direction() == direction {
                    debug!("channel scan already running {}", direction.as_str());
                    return Ok(());
                }
                // An opposite-direction request only cancels; the caller
                // starts the new sweep once this one has wound down.
                info!("cancelling {} channel scan", current.direction().as_str());
                current.stop();
                return Ok(());
            }
        }

        info!("starting {} channel scan", direction.as_str());
        self.set_busy(true);
        let scan = ScanHandle::new(direction);
        *slot = Some(Arc::clone(&scan));
        self.queue.submit(Task::ScanStart { scan, start })
    }

    /// Cancel whichever sweep is running. Cooperative: the probe already
    /// on the queue finishes the sweep off.
    pub fn cancel_channel_scan(&self) {
        if let Some(scan) = self.scan.lock().as_ref() {
            scan.stop();
        }
    }

    /// Full-spectrum sweep. On an operational CableCard device this
    /// walks the published channel lineup with virtual tunes; otherwise
    /// it is a forward sweep across the whole channel map.
    pub fn full_channel_scan(&self) -> Result<(), ControllerError> {
        self.ensure_device()?;

        let mut slot = self.scan.lock();
        if let Some(current) = slot.as_ref() {
            if current.is_running() {
                debug!("full channel scan requested while a scan is running");
                return Ok(());
            }
        }

        if self.is_cable_card_setup() {
            let descriptor = self
                .shared
                .descriptor
                .read()
                .clone()
                .ok_or(ControllerError::NoDevice)?;
            let url = format!("http://{}/lineup.xml?show=unprotected", descriptor.addr);
            info!("full channel scan over lineup {url}");

            self.set_busy(true);
            let scan = ScanHandle::new(ScanDirection::Forward);
            *slot = Some(Arc::clone(&scan));
            self.queue.submit(Task::LineupScan { scan, url })
        } else {
            let start = self.shared.channel_list.read().min_number();
            info!("full channel scan across the channel map");

            self.set_busy(true);
            let scan = ScanHandle::new(ScanDirection::Forward);
            *slot = Some(Arc::clone(&scan));
            self.queue.submit(Task::ScanStart { scan, start })
        }
    }

    /// Last fetched CableCard status, if any.
    pub fn cable_card_status(&self) -> Option<CableCardStatus> {
        self.shared.card_status.read().clone()
    }

    /// True when the bound device is a CableCard whose card is ready,
    /// authenticated, and has a usable out-of-band channel.
    pub fn is_cable_card_setup(&self) -> bool {
        if self.device_type() != Some(DeviceType::CableCard) {
            return false;
        }
        match self.cable_card_status() {
            Some(status) => {
                debug!("is_cable_card_setup: {status:?}");
                status.is_operational()
            }
            None => false,
        }
    }

    /// Type of the bound device, if any.
    pub fn device_type(&self) -> Option<DeviceType> {
        *self.shared.device_type.read()
    }

    /// Snapshot of the active channel list.
    pub fn channel_list(&self) -> ChannelList {
        self.shared.channel_list.read().clone()
    }

    /// Name of the active channel map.
    pub fn current_channel_map(&self) -> String {
        self.shared.current_map.read().clone()
    }

    /// Observer channels for every event kind.
    pub fn events(&self) -> Arc<ControllerEvents> {
        Arc::clone(&self.events)
    }

    /// Swap the busy indicator, replaying the current busy state onto
    /// the replacement.
    pub fn set_busy_indicator(&self, indicator: Arc<dyn BusyIndicator>) {
        self.busy.replace(indicator);
    }

    /// Release the lease, destroy the device handle, stop accepting
    /// device commands, and detach every observer. Safe to call without
    /// a held lease.
    pub fn destroy_device(&self) {
        self.poll.stop();
        self.cancel_channel_scan();

        let (ack, done) = oneshot::channel();
        if self.queue.submit(Task::Teardown { ack }).is_ok() {
            let _ = done.blocking_recv();
        }
        self.events.unregister_all();
    }

    /// Discard queued tasks, let the in-flight task finish, and block
    /// until the worker has exited.
    pub fn drain_and_stop(&self) {
        self.poll.stop();
        self.cancel_channel_scan();
        self.queue.drain_and_stop();
    }

    fn ensure_device(&self) -> Result<(), ControllerError> {
        if self.shared.device_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControllerError::NoDevice)
        }
    }

    fn set_busy(&self, busy: bool) {
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(Notification::Busy(busy));
        }
    }

    /// Wait until every task submitted so far has executed.
    #[cfg(test)]
    pub(crate) fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.queue.submit(Task::Barrier { ack }).is_ok() {
            let _ = done.blocking_recv();
        }
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        self.drain_and_stop();
        // The worker is gone, so closing our sender ends the dispatch
        // task; the runtime then winds down without waiting the full
        // timeout.
        self.notifier.take();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}
