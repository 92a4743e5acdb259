//! User-visible alerts
//!
//! Everything is logged. Dialogs are shown only when a GUI sink is attached
//! and the `nogui` preference is off at the moment of the alert.

use crate::config::RuntimePrefs;
use std::sync::Arc;
use tracing::{error, warn};

/// Front-end that can show alert dialogs.
pub trait AlertSink: Send + Sync {
    fn error_alert(&self, text: &str);
    fn warning_alert(&self, text: &str);

    /// Leave full-screen mode so a dialog is visible.
    fn quit_full_screen(&self) {}
}

#[derive(Clone)]
pub struct Alerts {
    prefs: Arc<RuntimePrefs>,
    sink: Option<Arc<dyn AlertSink>>,
}

impl Alerts {
    pub fn new(prefs: Arc<RuntimePrefs>, sink: Option<Arc<dyn AlertSink>>) -> Self {
        Self { prefs, sink }
    }

    /// Log-only alerts.
    pub fn headless(prefs: Arc<RuntimePrefs>) -> Self {
        Self::new(prefs, None)
    }

    fn gui(&self) -> Option<&Arc<dyn AlertSink>> {
        if self.prefs.nogui() {
            None
        } else {
            self.sink.as_ref()
        }
    }

    pub fn error(&self, text: &str) {
        error!("{}", text);
        if let Some(sink) = self.gui() {
            sink.quit_full_screen();
            sink.error_alert(text);
        }
    }

    pub fn warning(&self, text: &str) {
        warn!("{}", text);
        if let Some(sink) = self.gui() {
            sink.warning_alert(text);
        }
    }
}
