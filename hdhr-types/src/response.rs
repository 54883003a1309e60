//! Outcome envelope reported by every worker-side device operation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Status code for a successful operation.
pub const STATUS_SUCCESS: i32 = 1;

/// Status code for an operation the tuner rejected (including lock
/// contention).
pub const STATUS_FAILURE: i32 = 0;

/// Status code for a communication error with the tuner.
pub const STATUS_COMM_ERROR: i32 = -1;

/// Attribute key naming the operation that produced the response.
pub const KEY_ACTION: &str = "action";

/// Attribute key carrying a human-readable error description.
pub const KEY_ERROR: &str = "error";

/// Attribute key flagging a lock-contention outcome.
pub const KEY_LOCKED: &str = "locked";

/// A single response attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
    Text(String),
    Flag(bool),
    Number(i64),
}

/// Uniform result envelope returned from worker-side operations.
///
/// Carries a raw status code (positive codes mean success, zero means the
/// tuner rejected the operation, negative codes mean a communication
/// failure) plus a small attribute map identifying the action, an error
/// description, and whether the failure was lock contention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResponse {
    status: i32,
    #[serde(default)]
    attrs: HashMap<String, Attr>,
}

impl DeviceResponse {
    /// Create a response with the given raw status code.
    pub fn new(status: i32) -> Self {
        Self {
            status,
            attrs: HashMap::new(),
        }
    }

    /// Create a successful response.
    pub fn success() -> Self {
        Self::new(STATUS_SUCCESS)
    }

    /// Create a rejected-operation response.
    pub fn failure() -> Self {
        Self::new(STATUS_FAILURE)
    }

    /// Build a response from a driver call outcome, labelled with the
    /// action that was attempted.
    pub fn from_driver(action: &str, result: Result<(), DriverError>) -> Self {
        let mut resp = match result {
            Ok(()) => Self::success(),
            Err(ref e) => {
                let mut r = Self::new(e.status_code());
                r.put_text(KEY_ERROR, e.to_string());
                r
            }
        };
        resp.put_text(KEY_ACTION, action);
        resp
    }

    /// Raw status code.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Overwrite the status code.
    pub fn set_status(&mut self, status: i32) {
        self.status = status;
    }

    /// True if the status code indicates success.
    pub fn is_success(&self) -> bool {
        self.status > 0
    }

    /// True if the response carries the lock-contention flag.
    pub fn is_locked(&self) -> bool {
        self.flag(KEY_LOCKED).unwrap_or(false)
    }

    /// Attach a text attribute.
    pub fn put_text(&mut self, key: &str, value: impl Into<String>) {
        self.attrs.insert(key.to_string(), Attr::Text(value.into()));
    }

    /// Attach a boolean attribute.
    pub fn put_flag(&mut self, key: &str, value: bool) {
        self.attrs.insert(key.to_string(), Attr::Flag(value));
    }

    /// Attach a numeric attribute.
    pub fn put_number(&mut self, key: &str, value: i64) {
        self.attrs.insert(key.to_string(), Attr::Number(value));
    }

    /// Read a text attribute.
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(Attr::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Read a boolean attribute.
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.attrs.get(key) {
            Some(Attr::Flag(b)) => Some(*b),
            _ => None,
        }
    }

    /// Read a numeric attribute.
    pub fn number(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(Attr::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Builder-style action label.
    pub fn with_action(mut self, action: &str) -> Self {
        self.put_text(KEY_ACTION, action);
        self
    }

    /// Mark this response as a lock-contention outcome, recording the
    /// identity of the competing owner.
    pub fn mark_locked(&mut self, owner: &str) {
        self.put_text(KEY_ERROR, format!("tuner locked by {owner}"));
        self.put_flag(KEY_LOCKED, true);
    }
}

impl Default for DeviceResponse {
    fn default() -> Self {
        Self::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(DeviceResponse::success().is_success());
        assert!(!DeviceResponse::failure().is_success());
        assert!(!DeviceResponse::new(STATUS_COMM_ERROR).is_success());
        // Raw driver codes above zero also count as success.
        assert!(DeviceResponse::new(7).is_success());
    }

    #[test]
    fn test_locked_response() {
        let mut resp = DeviceResponse::failure().with_action("setting channel map");
        resp.mark_locked("192.168.1.50");

        assert!(resp.is_locked());
        assert_eq!(resp.text(KEY_ACTION), Some("setting channel map"));
        assert_eq!(resp.text(KEY_ERROR), Some("tuner locked by 192.168.1.50"));
    }

    #[test]
    fn test_from_driver() {
        let ok = DeviceResponse::from_driver("setting program", Ok(()));
        assert!(ok.is_success());
        assert_eq!(ok.text(KEY_ACTION), Some("setting program"));

        let rejected =
            DeviceResponse::from_driver("setting program", Err(DriverError::Rejected("busy".into())));
        assert_eq!(rejected.status(), STATUS_FAILURE);
        assert!(rejected.text(KEY_ERROR).unwrap().contains("busy"));

        let comm =
            DeviceResponse::from_driver("setting program", Err(DriverError::Comm("timeout".into())));
        assert_eq!(comm.status(), STATUS_COMM_ERROR);
    }

    #[test]
    fn test_attr_kinds() {
        let mut resp = DeviceResponse::success();
        resp.put_number("channel", 12);
        assert_eq!(resp.number("channel"), Some(12));
        // Wrong-kind reads return None instead of panicking.
        assert_eq!(resp.flag("channel"), None);
        assert_eq!(resp.text("missing"), None);
    }
}
