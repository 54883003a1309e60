//! Whole-actor tests over the simulated tuner backend.
//!
//! These drive the public controller surface and assert against the
//! backend's call journal and the events that reach observers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hdhr_types::{
    ChannelScanProgram, ControllerError, DeviceDescriptor, DeviceType, KEY_ERROR,
};

use crate::config::ControllerConfig;
use crate::controller::{BusyIndicator, DeviceController, NullBusyIndicator};
use crate::driver::sim::{SimBackend, SimLineup};
use hdhr_types::VirtualChannel;

fn test_config() -> ControllerConfig {
    ControllerConfig {
        poll_interval_ms: 10,
        settle_delay_ms: 0,
        scan_lock_wait_ms: 0,
        runtime_worker_threads: 2,
    }
}

fn atsc_backend() -> SimBackend {
    SimBackend::new(DeviceType::Atsc)
        .with_map("us-bcast", vec![2, 5, 12, 69])
        .with_programs(
            12,
            vec![
                ChannelScanProgram::new(1, "WNBC-HD", 4, 1),
                ChannelScanProgram::new(2, "COZI", 4, 2),
            ],
        )
}

fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0)
}

fn controller_over(backend: &SimBackend, cfg: ControllerConfig) -> DeviceController {
    DeviceController::new(
        Arc::new(backend.clone()),
        descriptor(),
        Arc::new(NullBusyIndicator),
        None,
        cfg,
    )
    .expect("device binding")
}

/// Flush the worker queue, then give the dispatch task a moment to
/// drain so earlier notifications cannot leak into a fresh subscriber.
fn quiesce(controller: &DeviceController) {
    controller.flush();
    std::thread::sleep(Duration::from_millis(50));
}

fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_commands_execute_in_submission_order() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();
    backend.clear_calls();

    controller.set_channel_map("us-bcast").unwrap();
    controller.set_tuner_channel("5", false).unwrap();
    controller.set_program(2).unwrap();
    controller.flush();

    let calls = backend.calls();
    let tune = calls
        .iter()
        .position(|c| c == "set_tuner_channel:5")
        .expect("tune call");
    let program = calls
        .iter()
        .position(|c| c == "set_tuner_program:2")
        .expect("program call");
    assert!(tune < program, "side effects out of order: {calls:?}");

    // Setting the already-active map never reaches the mutate call.
    assert_eq!(backend.call_count("set_channel_map"), 0);

    // One release per acquire across all three commands.
    assert_eq!(
        backend.call_count("tuner_lock_request"),
        backend.call_count("tuner_lock_release")
    );
}

#[test]
fn test_out_of_range_channel_never_touches_the_device() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();
    backend.clear_calls();

    let err = controller.set_tuner_channel("99", false).unwrap_err();
    assert_eq!(
        err,
        ControllerError::ChannelOutOfRange {
            channel: 99,
            min: 2,
            max: 69
        }
    );

    let err = controller.set_tuner_channel("abc", false).unwrap_err();
    assert!(matches!(err, ControllerError::InvalidChannel(_)));

    controller.flush();
    assert!(backend.calls().is_empty(), "{:?}", backend.calls());
}

#[test]
fn test_in_range_tune_issues_one_call_and_one_notification() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    let changes: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    controller.set_tuner_channel("12", false).unwrap();
    quiesce(&controller);
    backend.clear_calls();

    let changes2 = Arc::clone(&changes);
    controller.events().channel_changed.subscribe(move |change| {
        assert!(change.response.is_success());
        changes2.lock().push(change.channel);
    });

    controller.set_tuner_channel("5", false).unwrap();
    controller.flush();

    wait_until("channel-changed(5)", || changes.lock().contains(&5));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(changes.lock().iter().filter(|&&c| c == 5).count(), 1);
    assert_eq!(backend.call_count("set_tuner_channel:5"), 1);
}

#[test]
fn test_tuning_to_the_current_channel_skips_the_mutate_call() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    let successes = Arc::new(AtomicUsize::new(0));

    controller.set_tuner_channel("12", false).unwrap();
    quiesce(&controller);
    backend.clear_calls();

    let successes2 = Arc::clone(&successes);
    controller.events().channel_changed.subscribe(move |change| {
        if change.response.is_success() {
            successes2.fetch_add(1, Ordering::SeqCst);
        }
    });

    controller.set_tuner_channel("12", false).unwrap();
    controller.flush();

    wait_until("success notification", || {
        successes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(backend.call_count("set_tuner_channel"), 0);
}

#[test]
fn test_lock_contention_reports_owner_and_skips_the_mutation() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.set_tuner_channel("12", false).unwrap();
    controller.flush();

    // The driver grants exactly one more lease, then a competitor owns
    // the tuner.
    backend.limit_lock_grants(1, "192.168.1.50");
    backend.clear_calls();

    let responses: Arc<Mutex<Vec<hdhr_types::DeviceResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let responses2 = Arc::clone(&responses);
    controller.events().program_changed.subscribe(move |change| {
        responses2.lock().push(change.response.clone());
    });

    controller.set_program(1).unwrap();
    controller.set_program(2).unwrap();
    controller.flush();

    wait_until("two program responses", || responses.lock().len() == 2);
    let responses = responses.lock();

    assert!(responses[0].is_success());
    assert!(responses[1].is_locked());
    assert!(responses[1]
        .text(KEY_ERROR)
        .unwrap()
        .contains("192.168.1.50"));

    assert_eq!(backend.call_count("set_tuner_program:1"), 1);
    assert_eq!(backend.call_count("set_tuner_program:2"), 0);
}

#[test]
fn test_identical_poll_cycles_notify_exactly_once() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();

    let notifications = Arc::new(AtomicUsize::new(0));
    let notifications2 = Arc::clone(&notifications);
    controller
        .events()
        .tuner_status_changed
        .subscribe(move |_change| {
            notifications2.fetch_add(1, Ordering::SeqCst);
        });

    backend.clear_calls();
    controller.start_tuner_status_updates();
    assert!(controller.is_tuner_status_updates_running());

    // Let well over five identical cycles run.
    wait_until("six poll cycles", || {
        backend.call_count("update_tuner_status") >= 6
    });
    controller.stop_tuner_status_updates();
    assert!(!controller.is_tuner_status_updates_running());
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn test_status_change_notifies_again() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();

    let notifications = Arc::new(AtomicUsize::new(0));
    let notifications2 = Arc::clone(&notifications);
    controller
        .events()
        .tuner_status_changed
        .subscribe(move |_change| {
            notifications2.fetch_add(1, Ordering::SeqCst);
        });

    controller.start_tuner_status_updates();
    wait_until("baseline notification", || {
        notifications.load(Ordering::SeqCst) >= 1
    });

    controller.set_tuner_channel("12", false).unwrap();
    wait_until("changed-status notification", || {
        notifications.load(Ordering::SeqCst) >= 2
    });
    controller.stop_tuner_status_updates();
}

#[test]
fn test_forward_scan_probes_the_range_and_reports_locks() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    quiesce(&controller);
    backend.clear_calls();

    let completions = Arc::new(AtomicUsize::new(0));
    let locks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let probed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let completions2 = Arc::clone(&completions);
    controller.events().scan_complete.subscribe(move |complete| {
        assert!(complete.response.is_success());
        completions2.fetch_add(1, Ordering::SeqCst);
    });
    let locks2 = Arc::clone(&locks);
    controller.events().channel_locked.subscribe(move |locked| {
        locks2.lock().push(locked.status.channel.clone());
    });
    let probed2 = Arc::clone(&probed);
    controller.events().channel_changed.subscribe(move |change| {
        probed2.lock().push(change.channel);
    });

    controller.channel_scan_forward(Some(2)).unwrap();
    wait_until("scan completion", || completions.load(Ordering::SeqCst) == 1);

    assert_eq!(*probed.lock(), vec![2, 5, 12, 69]);
    assert_eq!(*locks.lock(), vec!["8vsb:12".to_string()]);

    // The sweep held one lease across all probes.
    assert_eq!(backend.call_count("tuner_lock_request"), 1);
    assert_eq!(backend.call_count("tuner_lock_release"), 1);
}

#[test]
fn test_scan_direction_state_machine() {
    let backend = SimBackend::new(DeviceType::Atsc).with_map("us-bcast", (2..=69).collect());
    let cfg = ControllerConfig {
        scan_lock_wait_ms: 20,
        ..test_config()
    };
    let controller = controller_over(&backend, cfg);
    controller.flush();

    let completions = Arc::new(AtomicUsize::new(0));
    let completions2 = Arc::clone(&completions);
    controller.events().scan_complete.subscribe(move |_| {
        completions2.fetch_add(1, Ordering::SeqCst);
    });

    controller.channel_scan_forward(None).unwrap();
    // Same direction while running: no-op, no second sweep.
    controller.channel_scan_forward(None).unwrap();
    // Opposite direction while running: cancels, does not start its own
    // sweep.
    controller.channel_scan_backward(None).unwrap();

    wait_until("cancelled sweep completion", || {
        completions.load(Ordering::SeqCst) == 1
    });

    let probes_after_cancel = backend.call_count("set_tuner_channel");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.call_count("set_tuner_channel"), probes_after_cancel);

    // Idle again: a fresh backward sweep is allowed now.
    controller.channel_scan_backward(Some(5)).unwrap();
    wait_until("second sweep completion", || {
        completions.load(Ordering::SeqCst) == 2
    });
}

#[test]
fn test_scan_denied_by_competing_owner() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();
    backend.set_external_owner(Some("dvr-box"));
    backend.clear_calls();

    let responses: Arc<Mutex<Vec<hdhr_types::DeviceResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let responses2 = Arc::clone(&responses);
    controller.events().scan_complete.subscribe(move |complete| {
        responses2.lock().push(complete.response.clone());
    });

    controller.channel_scan_forward(Some(2)).unwrap();
    wait_until("denied completion", || responses.lock().len() == 1);

    let responses = responses.lock();
    assert!(responses[0].is_locked());
    assert!(responses[0].text(KEY_ERROR).unwrap().contains("dvr-box"));
    assert_eq!(backend.call_count("set_tuner_channel"), 0);
}

#[test]
fn test_channel_map_switch_rebuilds_derived_state() {
    let backend = SimBackend::new(DeviceType::Atsc)
        .with_map("us-bcast", vec![2, 5, 12, 69])
        .with_map("us-hrc", vec![1, 3, 7]);
    let controller = controller_over(&backend, test_config());
    controller.flush();

    controller.set_channel_map("us-hrc").unwrap();
    controller.flush();

    assert_eq!(controller.current_channel_map(), "us-hrc");
    let list = controller.channel_list();
    assert_eq!(list.min_number(), Some(1));
    assert_eq!(list.max_number(), Some(7));

    // Range validation follows the new map.
    assert!(controller.set_tuner_channel("5", false).is_ok());
    assert!(matches!(
        controller.set_tuner_channel("12", false),
        Err(ControllerError::ChannelOutOfRange { .. })
    ));
}

#[test]
fn test_virtual_tune_bypasses_range_validation() {
    let backend = SimBackend::new(DeviceType::CableCard)
        .with_map("us-cable", vec![2, 135])
        .with_programs(135, vec![ChannelScanProgram::new(2, "AMC-HD", 702, 0)])
        .with_virtual_channel("702", 135);
    let controller = controller_over(&backend, test_config());
    controller.flush();
    backend.clear_calls();

    let tuned: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let tuned2 = Arc::clone(&tuned);
    controller.events().channel_changed.subscribe(move |change| {
        if change.response.is_success() {
            tuned2.lock().push(change.channel);
        }
    });

    // 702 is far outside [2, 135]; the virtual path must not care.
    controller.set_tuner_channel("702", true).unwrap();
    controller.flush();

    wait_until("virtual tune", || tuned.lock().contains(&135));
    assert_eq!(backend.call_count("set_virtual_channel:702"), 1);
    assert_eq!(backend.call_count("set_tuner_channel"), 0);
}

#[test]
fn test_full_scan_walks_the_cablecard_lineup() {
    let backend = SimBackend::new(DeviceType::CableCard)
        .with_map("us-cable", vec![2, 80, 135])
        .with_programs(80, vec![ChannelScanProgram::new(1, "HBO-HD", 501, 0)])
        .with_programs(135, vec![ChannelScanProgram::new(2, "AMC-HD", 702, 0)])
        .with_virtual_channel("501", 80)
        .with_virtual_channel("702", 135);
    let lineup = SimLineup::new(vec![
        VirtualChannel::new("501", "HBO-HD"),
        VirtualChannel::new("702", "AMC-HD"),
    ]);

    let controller = DeviceController::new(
        Arc::new(backend.clone()),
        descriptor(),
        Arc::new(NullBusyIndicator),
        Some(Arc::new(lineup)),
        test_config(),
    )
    .expect("device binding");
    controller.flush();
    assert!(controller.is_cable_card_setup());
    backend.clear_calls();

    let completions = Arc::new(AtomicUsize::new(0));
    let locks = Arc::new(AtomicUsize::new(0));
    let completions2 = Arc::clone(&completions);
    controller.events().scan_complete.subscribe(move |_| {
        completions2.fetch_add(1, Ordering::SeqCst);
    });
    let locks2 = Arc::clone(&locks);
    controller.events().channel_locked.subscribe(move |_| {
        locks2.fetch_add(1, Ordering::SeqCst);
    });

    controller.full_channel_scan().unwrap();
    wait_until("lineup sweep completion", || {
        completions.load(Ordering::SeqCst) == 1
    });

    assert_eq!(backend.call_count("set_virtual_channel"), 2);
    assert_eq!(locks.load(Ordering::SeqCst), 2);
    assert_eq!(
        backend.call_count("tuner_lock_request"),
        backend.call_count("tuner_lock_release")
    );
}

#[test]
fn test_full_scan_on_atsc_sweeps_the_whole_map() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();
    backend.clear_calls();

    let completions = Arc::new(AtomicUsize::new(0));
    let completions2 = Arc::clone(&completions);
    controller.events().scan_complete.subscribe(move |_| {
        completions2.fetch_add(1, Ordering::SeqCst);
    });

    controller.full_channel_scan().unwrap();
    wait_until("full sweep completion", || {
        completions.load(Ordering::SeqCst) == 1
    });

    for channel in [2u32, 5, 12, 69] {
        assert_eq!(backend.call_count(&format!("set_tuner_channel:{channel}")), 1);
    }
}

#[test]
fn test_setup_failure_rolls_back_and_propagates() {
    let backend = atsc_backend();
    backend.refuse_connect(true);
    let result = DeviceController::new(
        Arc::new(backend.clone()),
        descriptor(),
        Arc::new(NullBusyIndicator),
        None,
        test_config(),
    );
    assert!(matches!(result, Err(ControllerError::Setup(_))));

    // Binding that fails after construction rolls the device back.
    let backend = atsc_backend();
    backend.set_comm_failure(true);
    let result = DeviceController::new(
        Arc::new(backend.clone()),
        descriptor(),
        Arc::new(NullBusyIndicator),
        None,
        test_config(),
    );
    assert!(matches!(result, Err(ControllerError::Setup(_))));
    assert!(backend.is_destroyed());
}

#[test]
fn test_rebinding_tears_the_old_device_down() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();

    controller
        .set_device(DeviceDescriptor::new("1038A4C7", "192.168.1.100", 1))
        .unwrap();
    controller.flush();

    let calls = backend.calls();
    let destroy = calls.iter().position(|c| c == "destroy").expect("teardown");
    let reconnect = calls.iter().rposition(|c| c == "connect").expect("rebind");
    assert!(destroy < reconnect, "{calls:?}");
    assert!(controller.set_tuner_channel("5", false).is_ok());
}

#[test]
fn test_destroy_device_releases_and_stops_accepting_commands() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();
    controller.events().channel_changed.subscribe(|_| {});

    controller.destroy_device();

    assert!(backend.is_destroyed());
    assert!(!backend.is_lock_held());
    assert_eq!(controller.events().channel_changed.observer_count(), 0);
    assert_eq!(
        controller.set_tuner_channel("5", false),
        Err(ControllerError::NoDevice)
    );
}

#[test]
fn test_drain_discards_queued_commands() {
    let backend = atsc_backend();
    let cfg = ControllerConfig {
        settle_delay_ms: 100,
        ..test_config()
    };
    let controller = controller_over(&backend, cfg);
    controller.flush();
    backend.clear_calls();

    controller.set_tuner_channel("5", false).unwrap();
    controller.set_tuner_channel("12", false).unwrap();
    controller.set_tuner_channel("69", false).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    controller.drain_and_stop();

    // The in-flight command finished; the queued ones never ran.
    assert!(backend.call_count("set_tuner_channel") <= 1);
    // The worker released the device on its way out, so the caller-side
    // guard rejects further commands.
    assert_eq!(
        controller.set_tuner_channel("5", false),
        Err(ControllerError::NoDevice)
    );
}

#[test]
fn test_set_target_ip_round_trip() {
    let backend = atsc_backend();
    let controller = controller_over(&backend, test_config());
    controller.flush();

    let response = controller.set_target_ip("udp", "10.0.0.5", 5000).unwrap();
    assert!(response.is_success());
    assert_eq!(backend.target_uri().as_deref(), Some("udp://10.0.0.5:5000"));
}

#[test]
fn test_busy_indicator_raised_and_cleared_around_commands() {
    struct Recorder {
        saw_busy: AtomicBool,
        busy_now: AtomicBool,
    }
    impl BusyIndicator for Recorder {
        fn set_busy(&self, busy: bool) {
            if busy {
                self.saw_busy.store(true, Ordering::SeqCst);
            }
            self.busy_now.store(busy, Ordering::SeqCst);
        }
    }

    let recorder = Arc::new(Recorder {
        saw_busy: AtomicBool::new(false),
        busy_now: AtomicBool::new(false),
    });

    let backend = atsc_backend();
    let controller = DeviceController::new(
        Arc::new(backend),
        descriptor(),
        Arc::clone(&recorder) as Arc<dyn BusyIndicator>,
        None,
        test_config(),
    )
    .expect("device binding");

    controller.set_tuner_channel("12", false).unwrap();
    controller.flush();

    wait_until("busy cleared", || !recorder.busy_now.load(Ordering::SeqCst));
    assert!(recorder.saw_busy.load(Ordering::SeqCst));
}
