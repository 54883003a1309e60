//! The device worker: one dedicated thread draining a FIFO task queue.
//!
//! Everything that touches the tuner executes here, one task at a time,
//! in strict submission order. The poll loop and the channel scan are
//! not separate threads; they are tasks that re-enqueue themselves onto
//! this same queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::info;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use hdhr_types::{ControllerError, DeviceDescriptor, DeviceResponse, VirtualChannel};

use crate::controller::scan::ScanHandle;
use crate::controller::session::DeviceSession;

/// One unit of work for the device worker.
pub(crate) enum Task {
    /// Bind (or re-bind) a device; the caller blocks on `ack`.
    Setup {
        descriptor: DeviceDescriptor,
        ack: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Discover channel maps, card status, and the initial program list.
    Initialize { report_initial: bool },
    SetChannelMap {
        map: String,
    },
    SetChannel {
        channel: u32,
    },
    SetVirtualChannel {
        vchannel: String,
    },
    SetProgram {
        program: u32,
    },
    /// Point the stream output at a network target; synchronous for the
    /// caller.
    SetTarget {
        uri: String,
        ack: oneshot::Sender<DeviceResponse>,
    },
    /// One tuner-status poll cycle.
    Poll,
    /// Resolve the sweep start position and enqueue the first probe.
    ScanStart {
        scan: Arc<ScanHandle>,
        start: Option<u32>,
    },
    /// One linear sweep probe at a channel-list position.
    ScanStep {
        scan: Arc<ScanHandle>,
        position: usize,
    },
    /// Fetch the CableCard lineup and enqueue the first virtual probe.
    LineupScan {
        scan: Arc<ScanHandle>,
        url: String,
    },
    /// One virtual-channel probe over a fetched lineup.
    LineupStep {
        scan: Arc<ScanHandle>,
        channels: Arc<Vec<VirtualChannel>>,
        index: usize,
    },
    /// Release the lease, destroy the device handle; the caller blocks
    /// on `ack`.
    Teardown { ack: oneshot::Sender<()> },
    /// Queue flush point for tests.
    #[cfg(test)]
    Barrier { ack: oneshot::Sender<()> },
    /// Terminal marker; nothing enqueued after it runs.
    Stop,
}

/// Handle to the worker thread and its task queue.
///
/// `submit` enqueues and returns immediately. `drain_and_stop` discards
/// every task that has not started, lets the in-flight task finish, and
/// joins the thread.
pub(crate) struct CommandQueue {
    tx: mpsc::UnboundedSender<Task>,
    draining: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CommandQueue {
    /// Spawn the worker thread around a session.
    pub fn spawn(
        name: &str,
        mut session: DeviceSession,
        rx: mpsc::UnboundedReceiver<Task>,
        tx: mpsc::UnboundedSender<Task>,
    ) -> Result<Self, ControllerError> {
        let draining = Arc::new(AtomicBool::new(false));
        let drain_flag = Arc::clone(&draining);

        let mut rx = rx;
        let handle = thread::Builder::new()
            .name(format!("device-{name}"))
            .spawn(move || {
                info!("device worker entering the loop");
                while let Some(task) = rx.blocking_recv() {
                    if matches!(task, Task::Stop) {
                        break;
                    }
                    // Tasks queued before a drain request are discarded;
                    // the one already running when the flag flipped has
                    // finished by the time we get here.
                    if drain_flag.load(Ordering::SeqCst) {
                        continue;
                    }
                    session.execute(task);
                }
                session.shutdown();
                info!("device worker exiting gracefully");
            })
            .map_err(|e| ControllerError::WorkerSpawn(e.to_string()))?;

        Ok(Self {
            tx,
            draining,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a task in FIFO order.
    pub fn submit(&self, task: Task) -> Result<(), ControllerError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(ControllerError::WorkerGone);
        }
        self.tx.send(task).map_err(|_| ControllerError::WorkerGone)
    }

    /// Discard queued tasks, stop behind the running one, and block
    /// until the worker thread has exited. Idempotent.
    pub fn drain_and_stop(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Task::Stop);

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("device worker panicked during shutdown");
            }
        }
    }
}
