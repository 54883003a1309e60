//! Cancellable linear channel sweep.
//!
//! A sweep is a chain of worker tasks, one probe per task, so queued
//! commands interleave between probes instead of waiting for the whole
//! sweep. The sweep acquires the lock-lease at its first probe, holds it
//! across the chain, and releases it on every exit path. Cancellation is
//! cooperative: `stop` prevents future probes, it never interrupts one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use hdhr_types::{DeviceResponse, DriverError, ScanDirection, VirtualChannel};

use crate::controller::events::{
    ChannelChange, ChannelLocked, Notification, ProgramListChange, ScanComplete,
};
use crate::controller::session::DeviceSession;
use crate::controller::worker::Task;

/// Action label carried by every scan-related response.
pub(crate) const SCAN_ACTION: &str = "channel scan";

/// Identity of one sweep. At most one per device is running at a time;
/// the controller facade enforces the start rules against this handle.
pub struct ScanHandle {
    direction: ScanDirection,
    running: AtomicBool,
}

impl ScanHandle {
    pub(crate) fn new(direction: ScanDirection) -> Arc<Self> {
        Arc::new(Self {
            direction,
            running: AtomicBool::new(true),
        })
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative cancel: already-queued probes finish the sweep off
    /// instead of probing.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl DeviceSession {
    /// Resolve the sweep's starting cursor and enqueue the first probe.
    pub(crate) fn scan_start(&mut self, scan: Arc<ScanHandle>, start: Option<u32>) {
        if !scan.is_running() {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        }

        let Some(device) = self.device.as_mut() else {
            warn!("{SCAN_ACTION}: no device set");
            scan.stop();
            let response = Self::unavailable_response(SCAN_ACTION);
            self.finish_scan(&scan, response);
            return;
        };

        // The sweep holds the lease across all of its probes.
        if !self.lease_held {
            match device.tuner_lock_request() {
                Ok(true) => self.lease_held = true,
                Ok(false) => {
                    let owner = device.lock_owner();
                    debug!("{SCAN_ACTION}: tuner locked by {owner}");
                    let mut response = DeviceResponse::failure().with_action(SCAN_ACTION);
                    response.mark_locked(&owner);
                    scan.stop();
                    self.finish_scan(&scan, response);
                    return;
                }
                Err(e) => {
                    scan.stop();
                    let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
                    self.finish_scan(&scan, response);
                    return;
                }
            }
        }

        let direction = scan.direction();
        let current = match start {
            Some(_) => 0,
            None => device.current_channel().unwrap_or(0),
        };

        let list = self.shared.channel_list.read().clone();
        let position = match start {
            // An explicit starting channel is itself the first probe.
            Some(channel) => list.start_position(channel, direction),
            // From the current position, the first probe is the next
            // candidate in the sweep direction; an untuned device sweeps
            // the whole range.
            None => match direction {
                ScanDirection::Forward => {
                    if current == 0 {
                        (!list.is_empty()).then_some(0)
                    } else {
                        list.start_position(current.saturating_add(1), direction)
                    }
                }
                ScanDirection::Backward => {
                    if current == 0 {
                        list.len().checked_sub(1)
                    } else {
                        current
                            .checked_sub(1)
                            .and_then(|from| list.start_position(from, direction))
                    }
                }
            },
        };

        match position {
            Some(position) if scan.is_running() => {
                info!(
                    "{SCAN_ACTION}: sweeping {} from position {position}",
                    direction.as_str()
                );
                let _ = self.tx.send(Task::ScanStep { scan, position });
            }
            _ => {
                info!("{SCAN_ACTION}: nothing to sweep");
                self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            }
        }
    }

    /// One linear probe: tune, wait, read, report, re-enqueue.
    pub(crate) fn scan_step(&mut self, scan: Arc<ScanHandle>, position: usize) {
        if !scan.is_running() {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        }

        let Some(channel) = self.shared.channel_list.read().number_at(position) else {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        };

        let Some(device) = self.device.as_mut() else {
            warn!("{SCAN_ACTION}: no device set");
            scan.stop();
            let response = Self::unavailable_response(SCAN_ACTION);
            self.finish_scan(&scan, response);
            return;
        };

        debug!("{SCAN_ACTION}: probing channel {channel}");
        if let Err(e) = device.set_tuner_channel(&channel.to_string()) {
            scan.stop();
            let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
            self.finish_scan(&scan, response);
            return;
        }

        if self.cfg.scan_lock_wait_ms > 0 {
            thread::sleep(Duration::from_millis(self.cfg.scan_lock_wait_ms));
        }

        let status = match device.update_tuner_status() {
            Ok(status) => status,
            Err(e) => {
                scan.stop();
                let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
                self.finish_scan(&scan, response);
                return;
            }
        };

        let programs = if status.is_locked() {
            device.tuner_stream_info().ok()
        } else {
            None
        };

        self.notify(Notification::ChannelChanged(ChannelChange {
            response: DeviceResponse::success().with_action(SCAN_ACTION),
            channel,
        }));
        if status.is_locked() {
            info!("{SCAN_ACTION}: lock at channel {channel} ({})", status.lock);
            self.notify(Notification::ChannelLocked(ChannelLocked {
                status: status.clone(),
            }));
            if let Some(programs) = programs {
                self.notify(Notification::ProgramListChanged(ProgramListChange {
                    programs,
                    channel,
                }));
            }
        }

        let next = self
            .shared
            .channel_list
            .read()
            .next_position(position, scan.direction());
        match next {
            Some(position) if scan.is_running() => {
                let _ = self.tx.send(Task::ScanStep { scan, position });
            }
            _ => self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION)),
        }
    }

    /// Fetch the published lineup and enqueue the first virtual probe.
    pub(crate) fn lineup_scan(&mut self, scan: Arc<ScanHandle>, url: String) {
        if !scan.is_running() {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        }

        let Some(source) = self.lineup.clone() else {
            warn!("{SCAN_ACTION}: no lineup source configured");
            scan.stop();
            self.finish_scan(&scan, DeviceResponse::failure().with_action(SCAN_ACTION));
            return;
        };

        debug!("{SCAN_ACTION}: fetching lineup from {url}");
        match source.fetch(&url) {
            Ok(channels) if channels.is_empty() => {
                info!("{SCAN_ACTION}: lineup is empty");
                self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            }
            Ok(channels) => {
                info!("{SCAN_ACTION}: {} lineup channels", channels.len());
                let _ = self.tx.send(Task::LineupStep {
                    scan,
                    channels: Arc::new(channels),
                    index: 0,
                });
            }
            Err(e) => {
                scan.stop();
                let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
                self.finish_scan(&scan, response);
            }
        }
    }

    /// One virtual-channel probe over a fetched lineup. Applies the same
    /// per-step protocol as the linear sweep, addressed by virtual
    /// channel.
    pub(crate) fn lineup_step(
        &mut self,
        scan: Arc<ScanHandle>,
        channels: Arc<Vec<VirtualChannel>>,
        index: usize,
    ) {
        if !scan.is_running() {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        }

        let Some(entry) = channels.get(index).cloned() else {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
            return;
        };

        let Some(device) = self.device.as_mut() else {
            warn!("{SCAN_ACTION}: no device set");
            scan.stop();
            let response = Self::unavailable_response(SCAN_ACTION);
            self.finish_scan(&scan, response);
            return;
        };

        if !self.lease_held {
            match device.tuner_lock_request() {
                Ok(true) => self.lease_held = true,
                Ok(false) => {
                    let owner = device.lock_owner();
                    let mut response = DeviceResponse::failure().with_action(SCAN_ACTION);
                    response.mark_locked(&owner);
                    scan.stop();
                    self.finish_scan(&scan, response);
                    return;
                }
                Err(e) => {
                    scan.stop();
                    let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
                    self.finish_scan(&scan, response);
                    return;
                }
            }
        }

        debug!(
            "{SCAN_ACTION}: probing virtual channel {} ({})",
            entry.number, entry.name
        );
        match device.set_virtual_channel(&entry.number) {
            Err(DriverError::Comm(reason)) => {
                scan.stop();
                let response =
                    DeviceResponse::from_driver(SCAN_ACTION, Err(DriverError::Comm(reason)));
                self.finish_scan(&scan, response);
                return;
            }
            Err(e) => {
                // Stale lineup entries happen; skip and keep sweeping.
                debug!("{SCAN_ACTION}: skipping {}: {e}", entry.number);
            }
            Ok(()) => {
                if self.cfg.scan_lock_wait_ms > 0 {
                    thread::sleep(Duration::from_millis(self.cfg.scan_lock_wait_ms));
                }
                match device.update_tuner_status() {
                    Ok(status) => {
                        let channel = device.current_channel().unwrap_or(0);
                        let programs = if status.is_locked() {
                            device.tuner_stream_info().ok()
                        } else {
                            None
                        };
                        self.notify(Notification::ChannelChanged(ChannelChange {
                            response: DeviceResponse::success().with_action(SCAN_ACTION),
                            channel,
                        }));
                        if status.is_locked() {
                            info!(
                                "{SCAN_ACTION}: lock at virtual channel {} ({})",
                                entry.number, status.lock
                            );
                            self.notify(Notification::ChannelLocked(ChannelLocked { status }));
                            if let Some(programs) = programs {
                                self.notify(Notification::ProgramListChanged(ProgramListChange {
                                    programs,
                                    channel,
                                }));
                            }
                        }
                    }
                    Err(e) => {
                        scan.stop();
                        let response = DeviceResponse::from_driver(SCAN_ACTION, Err(e));
                        self.finish_scan(&scan, response);
                        return;
                    }
                }
            }
        }

        let next = index + 1;
        if next < channels.len() && scan.is_running() {
            let _ = self.tx.send(Task::LineupStep {
                scan,
                channels,
                index: next,
            });
        } else {
            self.finish_scan(&scan, DeviceResponse::success().with_action(SCAN_ACTION));
        }
    }

    /// Common exit path: release the sweep's lease, report completion,
    /// clear the busy indicator.
    pub(crate) fn finish_scan(&mut self, scan: &ScanHandle, response: DeviceResponse) {
        scan.stop();
        if self.lease_held {
            if let Some(device) = self.device.as_mut() {
                if let Err(e) = device.tuner_lock_release() {
                    debug!("{SCAN_ACTION}: lock release failed: {e}");
                }
            }
            self.lease_held = false;
        }
        info!(
            "{SCAN_ACTION} complete ({})",
            if response.is_success() { "ok" } else { "failed" }
        );
        self.notify(Notification::ScanComplete(ScanComplete { response }));
        self.busy(false);
    }
}
