//! Shared helpers for integration tests: tracing setup, progress recording and
//! spill-directory inspection.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use xhttp_client::{ProgressEvent, ProgressEventType, ProgressListener};

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener that keeps every event it receives.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("recorder lock poisoned").clone()
    }

    pub fn types(&self) -> Vec<ProgressEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl ProgressListener for Recorder {
    fn progress_changed(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .expect("recorder lock poisoned")
            .push(*event);
    }
}

/// Names of the files currently in `dir`.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("read spill dir")
        .map(|entry| {
            entry
                .expect("dir entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

// base64(md5("hello world"))
pub const HELLO_MD5: &str = "XrY7u+Ae7tCTyyK7j1rNww==";
