//! Observer channels and the UI-affine dispatch context.
//!
//! The worker never calls observers directly: it pushes [`Notification`]
//! values into an unbounded channel drained by a single dispatch task,
//! so publishing can never block a device operation. Each event kind has
//! its own independently-subscribable [`Observable`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hdhr_types::{
    ChannelScanProgram, CurrentChannelAndProgram, DeviceResponse, ProgramsList, TunerStatus,
};

/// Receives busy-state transitions; the progress UI implements this.
pub trait BusyIndicator: Send + Sync {
    fn set_busy(&self, busy: bool);
}

/// Indicator that ignores busy transitions.
pub struct NullBusyIndicator;

impl BusyIndicator for NullBusyIndicator {
    fn set_busy(&self, _busy: bool) {}
}

/// Handle identifying one subscribed observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// One independently-subscribable event channel.
///
/// Dispatch snapshots the subscriber list before iterating, so an
/// observer unsubscribing itself (or anyone else) from inside its own
/// callback neither faults nor affects the remaining deliveries of that
/// dispatch.
pub struct Observable<T> {
    observers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T> Observable<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach an observer; safe at any time, including mid-dispatch.
    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().push((id, Arc::new(observer)));
        Subscription(id)
    }

    /// Detach an observer. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(id, _)| *id != subscription.0);
        observers.len() != before
    }

    /// Detach every observer.
    pub fn unregister_all(&self) {
        self.observers.lock().clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub(crate) fn publish(&self, payload: &T) {
        let snapshot: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer(payload);
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel-map change outcome.
#[derive(Debug, Clone)]
pub struct ChannelMapChange {
    pub response: DeviceResponse,
    pub map: String,
}

/// Channel tune outcome.
#[derive(Debug, Clone)]
pub struct ChannelChange {
    pub response: DeviceResponse,
    pub channel: u32,
}

/// Program selection outcome. On lock contention the payload carries the
/// program that was current before the attempt.
#[derive(Debug, Clone)]
pub struct ProgramChange {
    pub response: DeviceResponse,
    pub program: Option<ChannelScanProgram>,
}

/// Fresh program list for a tuned channel.
#[derive(Debug, Clone)]
pub struct ProgramListChange {
    pub programs: ProgramsList,
    pub channel: u32,
}

/// Deduplicated tuner-status refresh.
#[derive(Debug, Clone)]
pub struct TunerStatusChange {
    pub response: DeviceResponse,
    pub status: TunerStatus,
    pub current: CurrentChannelAndProgram,
}

/// End of a channel sweep.
#[derive(Debug, Clone)]
pub struct ScanComplete {
    pub response: DeviceResponse,
}

/// A sweep probe achieved modulation lock.
#[derive(Debug, Clone)]
pub struct ChannelLocked {
    pub status: TunerStatus,
}

/// One observer channel per event kind.
pub struct ControllerEvents {
    pub channel_map_changed: Observable<ChannelMapChange>,
    pub channel_map_list_changed: Observable<Vec<String>>,
    pub channel_changed: Observable<ChannelChange>,
    pub channel_locked: Observable<ChannelLocked>,
    pub scan_complete: Observable<ScanComplete>,
    pub program_list_changed: Observable<ProgramListChange>,
    pub program_changed: Observable<ProgramChange>,
    pub tuner_status_changed: Observable<TunerStatusChange>,
}

impl ControllerEvents {
    pub fn new() -> Self {
        Self {
            channel_map_changed: Observable::new(),
            channel_map_list_changed: Observable::new(),
            channel_changed: Observable::new(),
            channel_locked: Observable::new(),
            scan_complete: Observable::new(),
            program_list_changed: Observable::new(),
            program_changed: Observable::new(),
            tuner_status_changed: Observable::new(),
        }
    }

    /// Detach every observer on every channel.
    pub fn unregister_all(&self) {
        self.channel_map_changed.unregister_all();
        self.channel_map_list_changed.unregister_all();
        self.channel_changed.unregister_all();
        self.channel_locked.unregister_all();
        self.scan_complete.unregister_all();
        self.program_list_changed.unregister_all();
        self.program_changed.unregister_all();
        self.tuner_status_changed.unregister_all();
    }
}

impl Default for ControllerEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-to-dispatch message, one variant per event kind plus the busy
/// indicator transitions.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Busy(bool),
    ChannelMapChanged(ChannelMapChange),
    ChannelMapListChanged(Vec<String>),
    ChannelChanged(ChannelChange),
    ChannelLocked(ChannelLocked),
    ScanComplete(ScanComplete),
    ProgramListChanged(ProgramListChange),
    ProgramChanged(ProgramChange),
    TunerStatusChanged(TunerStatusChange),
}

/// Busy flag plus the indicator it is mirrored onto.
pub(crate) struct BusyState {
    busy: AtomicBool,
    indicator: Mutex<Arc<dyn BusyIndicator>>,
}

impl BusyState {
    pub fn new(indicator: Arc<dyn BusyIndicator>) -> Self {
        Self {
            busy: AtomicBool::new(false),
            indicator: Mutex::new(indicator),
        }
    }

    pub fn apply(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
        self.indicator.lock().set_busy(busy);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Swap the indicator, replaying the current busy state onto the new
    /// one.
    pub fn replace(&self, indicator: Arc<dyn BusyIndicator>) {
        let busy = self.is_busy();
        indicator.set_busy(busy);
        *self.indicator.lock() = indicator;
    }
}

/// The UI-affine delivery context: a single task draining notifications
/// in order and fanning them out to the observer channels.
pub(crate) async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    events: Arc<ControllerEvents>,
    busy: Arc<BusyState>,
) {
    while let Some(notification) = rx.recv().await {
        trace!("dispatching {notification:?}");
        match notification {
            Notification::Busy(state) => busy.apply(state),
            Notification::ChannelMapChanged(change) => events.channel_map_changed.publish(&change),
            Notification::ChannelMapListChanged(maps) => {
                events.channel_map_list_changed.publish(&maps)
            }
            Notification::ChannelChanged(change) => events.channel_changed.publish(&change),
            Notification::ChannelLocked(locked) => events.channel_locked.publish(&locked),
            Notification::ScanComplete(complete) => events.scan_complete.publish(&complete),
            Notification::ProgramListChanged(change) => {
                events.program_list_changed.publish(&change)
            }
            Notification::ProgramChanged(change) => events.program_changed.publish(&change),
            Notification::TunerStatusChanged(change) => {
                events.tuner_status_changed.publish(&change)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_publish() {
        let observable: Observable<u32> = Observable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let sub = observable.subscribe(move |value| {
            assert_eq!(*value, 7);
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        observable.publish(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(observable.unsubscribe(sub));
        observable.publish(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!observable.unsubscribe(sub));
    }

    #[test]
    fn test_self_unsubscribe_mid_dispatch() {
        let observable: Arc<Observable<ProgramChange>> = Arc::new(Observable::new());
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        // The first observer unsubscribes itself from inside its own
        // callback; the second must still be delivered to in the same
        // dispatch.
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let obs2 = Arc::clone(&observable);
        let first_hits2 = Arc::clone(&first_hits);
        let sub = observable.subscribe(move |_change| {
            first_hits2.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = slot2.lock().take() {
                obs2.unsubscribe(own);
            }
        });
        *slot.lock() = Some(sub);

        let second_hits2 = Arc::clone(&second_hits);
        observable.subscribe(move |_change| {
            second_hits2.fetch_add(1, Ordering::SeqCst);
        });

        let payload = ProgramChange {
            response: DeviceResponse::success(),
            program: None,
        };
        observable.publish(&payload);
        observable.publish(&payload);

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_all() {
        let events = ControllerEvents::new();
        events.channel_changed.subscribe(|_| {});
        events.scan_complete.subscribe(|_| {});
        assert_eq!(events.channel_changed.observer_count(), 1);

        events.unregister_all();
        assert_eq!(events.channel_changed.observer_count(), 0);
        assert_eq!(events.scan_complete.observer_count(), 0);
    }

    #[test]
    fn test_busy_state_replay_on_replace() {
        struct Recorder(AtomicUsize);
        impl BusyIndicator for Recorder {
            fn set_busy(&self, busy: bool) {
                if busy {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let busy = BusyState::new(Arc::new(NullBusyIndicator));
        busy.apply(true);

        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        busy.replace(Arc::clone(&recorder) as Arc<dyn BusyIndicator>);
        // The replacement saw the in-flight busy state.
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }
}
