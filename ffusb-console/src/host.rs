use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use ffusb_core::{Error, HostCallbacks, PrinterProfile};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Notifications from the connection, forwarded to the console loop
#[derive(Debug, PartialEq)]
pub enum ConsoleEvent {
    Connected(String),
    Disconnected,
    UploadStarted { local: String, remote: String },
    UploadProgress { remote: String, percent: u8 },
    UploadSucceeded { remote: String, elapsed: Duration },
    UploadFailed { remote: String, error: String, elapsed: Duration },
    SelectFile { remote: String, print: bool },
}

/// Progress is reported in steps of this many percent
const PROGRESS_STEP: u8 = 10;

#[derive(Debug)]
pub struct ConsoleHost {
    events: UnboundedSender<ConsoleEvent>,
    files: Mutex<Vec<String>>,
    last_progress: AtomicU8,
}

impl ConsoleHost {
    pub fn new(events: UnboundedSender<ConsoleEvent>) -> Self {
        Self {
            events,
            files: Mutex::new(Vec::new()),
            last_progress: AtomicU8::new(0),
        }
    }

    /// Replace the known printer storage listing
    pub fn set_files(&self, files: Vec<String>) {
        *self.files.lock() = files;
    }

    fn send(&self, event: ConsoleEvent) {
        // console loop already exited, nobody left to tell
        let _ = self.events.send(event);
    }
}

impl HostCallbacks for ConsoleHost {
    fn on_connect(&self, profile: &PrinterProfile) {
        self.send(ConsoleEvent::Connected(profile.name.to_owned()));
    }

    fn on_disconnect(&self) {
        self.files.lock().clear();
        self.send(ConsoleEvent::Disconnected);
    }

    fn upload_started(&self, local: &str, remote: &str) {
        self.last_progress.store(0, Ordering::Relaxed);
        self.send(ConsoleEvent::UploadStarted {
            local: local.to_owned(),
            remote: remote.to_owned(),
        });
    }

    fn upload_succeeded(&self, _local: &str, remote: &str, elapsed: Duration) {
        self.files.lock().push(remote.to_owned());
        self.send(ConsoleEvent::UploadSucceeded {
            remote: remote.to_owned(),
            elapsed,
        });
    }

    fn upload_failed(&self, _local: &str, remote: &str, error: &Error, elapsed: Duration) {
        self.send(ConsoleEvent::UploadFailed {
            remote: remote.to_owned(),
            error: error.to_string(),
            elapsed,
        });
    }

    fn upload_progress(&self, remote: &str, percent: u8) {
        let step = percent - percent % PROGRESS_STEP;
        if step > self.last_progress.swap(step, Ordering::Relaxed) {
            self.send(ConsoleEvent::UploadProgress {
                remote: remote.to_owned(),
                percent: step,
            });
        }
    }

    fn existing_remote_files(&self) -> Vec<String> {
        self.files.lock().clone()
    }

    fn select_file(&self, remote: &str, print: bool) {
        self.send(ConsoleEvent::SelectFile {
            remote: remote.to_owned(),
            print,
        });
    }
}
