//! User-facing failure notifications.
//!
//! Handlers report failures they recover from through an injected
//! [`Notifier`] instead of a process-wide UI handle.

use crate::error::ServicemapError;
use serde::Serialize;
use std::sync::Mutex;

/// How long a notification stays visible, in milliseconds
pub const NOTIFICATION_LIFETIME_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub lifetime_ms: u64,
}

pub trait Notifier: Send + Sync {
    fn notify_error(&self, title: &str, error: &ServicemapError);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_error(&self, title: &str, error: &ServicemapError) {
        log::error!("{}: {}", title, error);
    }
}

/// Collects notifications so they can be returned alongside partial data.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    entries: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        match self.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for CollectingNotifier {
    fn notify_error(&self, title: &str, error: &ServicemapError) {
        log::error!("{}: {}", title, error);
        let notification = Notification {
            title: title.to_string(),
            message: error.to_string(),
            lifetime_ms: NOTIFICATION_LIFETIME_MS,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(notification);
        }
    }
}
