//! Scripted in-memory backend and judge.
//!
//! Used by the test suite and by `editbias run --dry-run`. Behavior is fully
//! deterministic: edited outputs are noise images seeded by the record key.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{EditBackend, EditRequest, EditResponse, EditStatus};
use crate::ensemble::judge::{Judge, JudgeRequest};
use crate::error::{BackendError, JudgeError};
use crate::refusal::perceptual::encode_png;
use crate::types::RecordKey;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which records a scripted rule applies to.
#[derive(Debug, Clone)]
struct Matcher {
    prompt_id: String,
    source_image_id: Option<String>,
}

impl Matcher {
    fn matches(&self, key: &RecordKey) -> bool {
        key.prompt_id == self.prompt_id
            && self
                .source_image_id
                .as_ref()
                .is_none_or(|s| s == &key.source_image_id)
    }
}

/// What a [`ScriptedBackend`] does for a matching request.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return a fresh image unrelated to the source.
    Edit,
    /// Return the source image untouched.
    Unchanged,
    /// Return an all-black frame.
    Blank,
    /// Return bytes that are not an image.
    Garbage,
    /// Decline the edit.
    Refuse,
    /// Answer with a policy-violation error status.
    PolicyError,
    /// Fail the call.
    Fail(BackendError),
}

/// Deterministic image-editing backend.
pub struct ScriptedBackend {
    name: String,
    rules: Mutex<Vec<(Matcher, Script)>>,
    transient_failures: AtomicU32,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Mutex::new(Vec::new()),
            transient_failures: AtomicU32::new(0),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Apply `script` to `prompt_id`, for one source image or all of them.
    pub fn script(&self, prompt_id: &str, source_image_id: Option<&str>, script: Script) {
        lock(&self.rules).push((
            Matcher {
                prompt_id: prompt_id.to_string(),
                source_image_id: source_image_id.map(str::to_string),
            },
            script,
        ));
    }

    /// The next `n` calls fail with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Every call sleeps for `delay` before answering.
    pub fn delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most calls ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, request: EditRequest) -> Result<EditResponse, BackendError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BackendError::Connection {
                message: "scripted transient failure".into(),
            });
        }

        match self.script_for(&request.key) {
            Script::Edit => Ok(EditResponse::success(png(noise_image(&request.key))?)),
            Script::Unchanged => match request.source_image {
                Some(source) => Ok(EditResponse::success(source.to_vec())),
                None => Ok(EditResponse::success(png(noise_image(&request.key))?)),
            },
            Script::Blank => Ok(EditResponse::success(png(RgbImage::from_pixel(
                64,
                64,
                Rgb([0, 0, 0]),
            ))?)),
            Script::Garbage => Ok(EditResponse::success(b"not an image".to_vec())),
            Script::Refuse => Ok(EditResponse::refused("request declined by safety policy")),
            Script::PolicyError => Ok(EditResponse {
                image: None,
                status: EditStatus::Error,
                message: Some("content policy violation".into()),
            }),
            Script::Fail(error) => Err(error),
        }
    }

    fn script_for(&self, key: &RecordKey) -> Script {
        lock(&self.rules)
            .iter()
            .rev()
            .find(|(m, _)| m.matches(key))
            .map(|(_, s)| s.clone())
            .unwrap_or(Script::Edit)
    }
}

/// A 64×64 noise image derived from `key`.
pub fn noise_image(key: &RecordKey) -> RgbImage {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let seed = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    RgbImage::from_fn(64, 64, |x, y| {
        let v = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663) ^ seed)
            .wrapping_mul(2_654_435_761)
            >> 24;
        Rgb([v as u8, (v as u8).wrapping_mul(3), (v as u8).wrapping_add(91)])
    })
}

fn png(image: RgbImage) -> Result<Vec<u8>, BackendError> {
    encode_png(image).map_err(|e| BackendError::Terminal {
        message: format!("mock image encoding failed: {e}"),
    })
}

#[async_trait]
impl EditBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn edit(&self, request: EditRequest) -> Result<EditResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.respond(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Deterministic judge. Answers agree with each other unless overridden.
pub struct ScriptedJudge {
    name: String,
    default_answer: Value,
    overrides: Mutex<Vec<(Matcher, Value)>>,
    fail_remaining: AtomicU32,
    fail_always: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default_answer: json!({
                "attribute_presence": "present",
                "identity_drift": 1,
                "edit_fidelity": 5,
                "stereotype_alignment": "resisted",
            }),
            overrides: Mutex::new(Vec::new()),
            fail_remaining: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Merge `fields` over the default answer for every source of `prompt_id`.
    pub fn answer_for(&self, prompt_id: &str, fields: Value) {
        self.answer_for_source(prompt_id, None, fields);
    }

    pub fn answer_for_source(&self, prompt_id: &str, source_image_id: Option<&str>, fields: Value) {
        lock(&self.overrides).push((
            Matcher {
                prompt_id: prompt_id.to_string(),
                source_image_id: source_image_id.map(str::to_string),
            },
            fields,
        ));
    }

    pub fn fail_times(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn judge(&self, request: JudgeRequest) -> Result<Value, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.fail_always.load(Ordering::SeqCst)
            || self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(JudgeError::Request {
                name: self.name.clone(),
                message: "scripted failure".into(),
            });
        }

        let mut answer = self.default_answer.clone();
        for (matcher, fields) in lock(&self.overrides).iter() {
            if !matcher.matches(&request.key) {
                continue;
            }
            if let (Value::Object(target), Value::Object(source)) = (&mut answer, fields) {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(answer)
    }
}
