use std::time::Duration;

use crate::{error::Error, profile::PrinterProfile};

/// Hooks into the application driving the printer
///
/// Upload callbacks fire from the upload worker thread, never while connection locks are held.
pub trait HostCallbacks: Send + Sync {
    fn on_connect(&self, profile: &PrinterProfile);

    fn on_disconnect(&self);

    fn upload_started(&self, local: &str, remote: &str);

    fn upload_succeeded(&self, local: &str, remote: &str, elapsed: Duration);

    fn upload_failed(&self, local: &str, remote: &str, error: &Error, elapsed: Duration);

    /// Percent complete after each chunk
    fn upload_progress(&self, _remote: &str, _percent: u8) {}

    /// Names already on printer storage, used to pick a free upload name
    fn existing_remote_files(&self) -> Vec<String>;

    /// Select `remote` on printer storage, starting the print when `print` is set
    fn select_file(&self, remote: &str, print: bool);
}

/// Host that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostCallbacks for NullHost {
    fn on_connect(&self, _: &PrinterProfile) {}

    fn on_disconnect(&self) {}

    fn upload_started(&self, _: &str, _: &str) {}

    fn upload_succeeded(&self, _: &str, _: &str, _: Duration) {}

    fn upload_failed(&self, _: &str, _: &str, _: &Error, _: Duration) {}

    fn existing_remote_files(&self) -> Vec<String> {
        Vec::new()
    }

    fn select_file(&self, _: &str, _: bool) {}
}
