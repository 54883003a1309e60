//! Cooperative lock-lease around a single device operation.
//!
//! The lease coordinates with other controllers of the same tuner,
//! possibly in other processes; within this program the worker already
//! serializes device access, so no further mutual exclusion is needed.

use log::debug;

use hdhr_types::DeviceResponse;

use crate::driver::TunerDriver;

/// Acquire the tuner's lock token, run `action`, and always release
/// afterward, regardless of the action's outcome.
///
/// On contention the action is skipped entirely and the returned
/// response carries a failure status, the `locked` flag, and the
/// competing owner's identity — an expected outcome, not a fault.
///
/// When the lease is already held (a channel sweep holds it across
/// probes), the action runs under the existing grant and the release is
/// left to whoever acquired it, keeping acquire and release symmetric.
pub(crate) fn with_lock<F>(
    device: &mut dyn TunerDriver,
    lease_held: &mut bool,
    action_label: &str,
    action: F,
) -> DeviceResponse
where
    F: FnOnce(&mut dyn TunerDriver) -> DeviceResponse,
{
    let already_held = *lease_held;

    if !already_held {
        match device.tuner_lock_request() {
            Ok(true) => *lease_held = true,
            Ok(false) => {
                let owner = device.lock_owner();
                debug!("{action_label}: tuner locked by {owner}");
                let mut response = DeviceResponse::failure().with_action(action_label);
                response.mark_locked(&owner);
                return response;
            }
            Err(e) => {
                return DeviceResponse::from_driver(action_label, Err(e));
            }
        }
    }

    let response = action(device);

    if !already_held {
        if let Err(e) = device.tuner_lock_release() {
            debug!("{action_label}: lock release failed: {e}");
        }
        *lease_held = false;
    }

    response
}
