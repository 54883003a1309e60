//! Self-rescheduling tuner-status poll.
//!
//! Each cycle runs as an ordinary worker task: it reads a fresh status
//! snapshot, notifies observers only when the snapshot changed, and
//! re-enqueues itself after the poll interval for as long as the running
//! flag stays set. `stop` only clears the flag, so at most one
//! already-scheduled cycle still executes afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use hdhr_types::{
    CurrentChannelAndProgram, DeviceResponse, DriverError, TunerStatus, KEY_ERROR,
};

use crate::controller::events::{Notification, TunerStatusChange};
use crate::controller::session::DeviceSession;
use crate::controller::worker::Task;
use crate::driver::TunerDriver;

/// Handle to the poll chain's shared state.
///
/// The running flag is written from the caller context and read on the
/// worker, hence the sequentially-consistent atomic.
#[derive(Clone)]
pub struct PollLoop {
    running: Arc<AtomicBool>,
    interval: Duration,
}

impl PollLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            interval,
        }
    }

    /// Flip to running. Returns false when the chain was already
    /// running, in which case no new chain must be started.
    pub fn start(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Request the chain to end. The poll notices at its next scheduled
    /// wake and simply does not re-enqueue.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }
}

impl DeviceSession {
    /// One poll cycle: refresh, dedup, notify, re-enqueue.
    pub(crate) fn poll_cycle(&mut self) {
        const ACTION: &str = "getting tuner status";

        let Some(device) = self.device.as_mut() else {
            trace!("poll: no device set");
            self.reschedule_poll();
            return;
        };

        trace!("updating tuner status");
        let status = match device.update_tuner_status() {
            Ok(status) => status,
            Err(e) => {
                debug!("poll: status refresh failed: {e}");
                TunerStatus {
                    return_status: e.status_code(),
                    ..TunerStatus::default()
                }
            }
        };

        let mut response = DeviceResponse::new(status.return_status).with_action(ACTION);
        let mut current = CurrentChannelAndProgram::default();

        // Passive reads under an already-granted lease only; the poll
        // never tries to acquire the lease itself.
        if self.lease_held {
            match Self::read_current(device.as_mut()) {
                Ok(read) => current = read,
                Err(e) => {
                    response.set_status(e.status_code());
                    response.put_text(KEY_ERROR, e.to_string());
                }
            }
        }

        if status != self.prev_status {
            self.notify(Notification::TunerStatusChanged(TunerStatusChange {
                response,
                status: status.clone(),
                current,
            }));
        }
        // The previous snapshot advances every cycle, notified or not.
        self.prev_status = status;

        self.reschedule_poll();
    }

    fn read_current(device: &mut dyn TunerDriver) -> Result<CurrentChannelAndProgram, DriverError> {
        let channel = device.tuner_channel()?;
        let program_number = device.tuner_program()?.parse().unwrap_or(0);
        let programs = device.tuner_stream_info()?;
        Ok(CurrentChannelAndProgram {
            channel,
            program_number,
            programs,
        })
    }

    /// Schedule the next cycle iff the chain is still running. The timer
    /// lives on the runtime so the worker queue stays free between
    /// ticks.
    fn reschedule_poll(&self) {
        if !self.poll.is_running() {
            return;
        }
        let tx = self.tx.clone();
        let running = self.poll.running_flag();
        let interval = self.poll.interval();
        self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if running.load(Ordering::SeqCst) {
                let _ = tx.send(Task::Poll);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_edge_triggered() {
        let poll = PollLoop::new(Duration::from_millis(500));
        assert!(!poll.is_running());
        assert!(poll.start());
        // A second start must not spawn a second chain.
        assert!(!poll.start());
        assert!(poll.is_running());

        poll.stop();
        assert!(!poll.is_running());
        assert!(poll.start());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let poll = PollLoop::new(Duration::from_millis(500));
        let clone = poll.clone();
        assert!(poll.start());
        assert!(clone.is_running());
        clone.stop();
        assert!(!poll.is_running());
    }
}
