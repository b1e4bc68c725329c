//! Test helpers: a scripted in-process dispatcher and image folder builders

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tempfile::TempDir;

use vision_tagger::{
    app_state::{AppState, RunSettings},
    config::ApprovalPolicy,
    models::attempt::DispatchFailure,
    services::{
        dispatcher::{CaptionRequest, Dispatcher},
        manifest::{ManifestStore, MANIFEST_FILE_NAME},
        rate_limit::RateLimiter,
        retry::{RetryController, RetryPolicy},
        stop::StopSignal,
    },
};

use crate::fixtures::PNG_1X1;

/// Dispatcher that replays scripted replies and otherwise captions each image
/// as `a photo of <name>`, where `<name>` is recovered from the image bytes.
#[derive(Default)]
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<Result<Vec<String>, DispatchFailure>>>,
    always_fail: Option<DispatchFailure>,
    stop_on_call: Option<StopSignal>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `failure`.
    pub fn failing(failure: DispatchFailure) -> Self {
        Self {
            always_fail: Some(failure),
            ..Self::default()
        }
    }

    /// Raise `stop` from inside every call.
    pub fn stopping(stop: StopSignal) -> Self {
        Self {
            stop_on_call: Some(stop),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue replies consumed one per call before falling back to the default.
    pub fn then(self, reply: Result<Vec<String>, DispatchFailure>) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Names of every image sent so far, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: &CaptionRequest) -> Result<Vec<String>, DispatchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(stop) = &self.stop_on_call {
            stop.stop();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let names: Vec<String> = request
            .images
            .iter()
            .map(|image| image_name(&image.data_url))
            .collect();
        self.seen.lock().unwrap().extend(names.iter().cloned());

        if let Some(failure) = &self.always_fail {
            return Err(failure.clone());
        }
        if let Some(reply) = self.script.lock().unwrap().pop_front() {
            return reply;
        }
        Ok(names.iter().map(|name| format!("a photo of {name}")).collect())
    }
}

/// Recover the tag appended by [`write_image`] from a data URL.
pub fn image_name(data_url: &str) -> String {
    let payload = data_url.split_once(',').map_or("", |(_, payload)| payload);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .expect("fake dispatcher received invalid base64");
    String::from_utf8_lossy(&bytes[PNG_1X1.len().min(bytes.len())..]).into_owned()
}

/// Write a PNG tagged with its own relative path so replies can be matched to files.
pub fn write_image(dir: &Path, relative: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create image directory");
    }
    let mut bytes = PNG_1X1.to_vec();
    bytes.extend_from_slice(relative.as_bytes());
    std::fs::write(path, bytes).expect("Failed to write image");
}

/// Temp folder holding `count` images named `img_00.png`, `img_01.png`, ...
pub fn image_folder(count: usize) -> (TempDir, Vec<String>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let names: Vec<String> = (0..count).map(|i| format!("img_{i:02}.png")).collect();
    for name in &names {
        write_image(dir.path(), name);
    }
    (dir, names)
}

/// Manifest for `dir` with every image imported and saved.
pub fn imported_manifest(dir: &Path) -> ManifestStore {
    let mut store =
        ManifestStore::open(dir.join(MANIFEST_FILE_NAME)).expect("Failed to open manifest");
    store.import_images().expect("Failed to import images");
    store.save().expect("Failed to save manifest");
    store
}

pub fn reload(dir: &Path) -> ManifestStore {
    ManifestStore::open(dir.join(MANIFEST_FILE_NAME)).expect("Failed to reload manifest")
}

pub fn settings(concurrency: usize, max_batch_size_bytes: u64) -> RunSettings {
    RunSettings {
        prompt: "Describe the image for a training caption.".to_string(),
        system_prompt: None,
        concurrency,
        max_batch_size_bytes,
        approval_policy: ApprovalPolicy::Review,
    }
}

/// App state with short real-time backoff so retry tests stay fast.
pub fn state(
    dispatcher: Arc<ScriptedDispatcher>,
    settings: RunSettings,
    max_attempts: u32,
) -> AppState {
    let policy = RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    };
    AppState::new(
        dispatcher,
        RetryController::new(policy),
        RateLimiter::disabled(),
        settings,
    )
}
