// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stop Conditions
//!
//! Worker listeners that stop the worker once a threshold is reached. Count based
//! conditions reset their counter when they fire; memory and wall time are checked
//! against absolute values and never reset.

use crate::{
    envelope::Envelope,
    errors::ConfigError,
    worker::{HandlerFailure, WorkerHandle, WorkerListener},
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::info;

/// Reads the resident memory of the process, in bytes.
pub type MemoryProbe = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    MessageCount,
    FailureCount,
    MemoryBytes,
    WallTime,
}

pub struct StopCondition {
    kind: StopKind,
    threshold: u64,
    counter: AtomicU64,
    deadline: Mutex<Option<Instant>>,
    probe: MemoryProbe,
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopCondition")
            .field("kind", &self.kind)
            .field("threshold", &self.threshold)
            .field("counter", &self.counter())
            .finish()
    }
}

impl StopCondition {
    fn new(kind: StopKind, threshold: u64, option: &'static str) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::NonPositiveLimit(option));
        }

        Ok(StopCondition {
            kind,
            threshold,
            counter: AtomicU64::new(0),
            deadline: Mutex::new(None),
            probe: Arc::new(resident_memory),
        })
    }

    /// Stops after `limit` received messages.
    pub fn message_limit(limit: u64) -> Result<Self, ConfigError> {
        StopCondition::new(StopKind::MessageCount, limit, "limit")
    }

    /// Stops after `limit` failed messages.
    pub fn failure_limit(limit: u64) -> Result<Self, ConfigError> {
        StopCondition::new(StopKind::FailureCount, limit, "failure-limit")
    }

    /// Stops once the resident memory exceeds `bytes`.
    pub fn memory_limit(bytes: u64) -> Result<Self, ConfigError> {
        StopCondition::new(StopKind::MemoryBytes, bytes, "memory-limit")
    }

    /// Stops once the worker ran for `limit`.
    pub fn time_limit(limit: Duration) -> Result<Self, ConfigError> {
        let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        StopCondition::new(StopKind::WallTime, millis, "time-limit")
    }

    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn kind(&self) -> StopKind {
        self.kind
    }

    /// Current value of the message or failure counter.
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    fn fire(&self, worker: &WorkerHandle, reason: &str) {
        info!(threshold = self.threshold, reason, "worker stopped");
        worker.stop();
    }
}

impl WorkerListener for StopCondition {
    fn on_started(&self, _worker: &WorkerHandle) {
        if self.kind == StopKind::WallTime {
            let deadline = Instant::now() + Duration::from_millis(self.threshold);
            *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(deadline);
        }
    }

    fn on_running(&self, idle: bool, worker: &WorkerHandle) {
        match self.kind {
            StopKind::MessageCount => {
                if idle {
                    return;
                }
                let received = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
                if received >= self.threshold {
                    self.counter.store(0, Ordering::Release);
                    self.fire(worker, "message limit reached");
                }
            }
            StopKind::FailureCount => {
                if !idle && self.counter() >= self.threshold {
                    self.counter.store(0, Ordering::Release);
                    self.fire(worker, "failure limit reached");
                }
            }
            StopKind::MemoryBytes => {
                if (self.probe)().is_some_and(|used| used > self.threshold) {
                    self.fire(worker, "memory limit exceeded");
                }
            }
            StopKind::WallTime => {
                let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    self.fire(worker, "time limit reached");
                }
            }
        }
    }

    fn on_message_failed(&self, envelope: Envelope, _failure: &HandlerFailure) -> Envelope {
        if self.kind == StopKind::FailureCount {
            self.counter.fetch_add(1, Ordering::AcqRel);
        }
        envelope
    }
}

/// Stops the worker after a failure flagged `stop_worker`.
#[derive(Debug, Default)]
pub struct StopOnFailureMarker {
    requested: AtomicBool,
}

impl WorkerListener for StopOnFailureMarker {
    fn on_running(&self, _idle: bool, worker: &WorkerHandle) {
        if self.requested.swap(false, Ordering::AcqRel) {
            info!("worker stopped by a failed message");
            worker.stop();
        }
    }

    fn on_message_failed(&self, envelope: Envelope, failure: &HandlerFailure) -> Envelope {
        if failure.stop_worker {
            self.requested.store(true, Ordering::Release);
        }
        envelope
    }
}

/// Parses a memory amount such as `128M`, `1g`, `512kb` or `0x100000`.
///
/// Suffixes are powers of 1024; a leading `0x` reads the digits as hex, a
/// leading `0` as octal.
pub fn parse_memory_limit(raw: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidMemoryLimit(raw.to_owned());
    let lower = raw.trim().to_ascii_lowercase();
    let value = lower.trim_start_matches('+');

    let (digits, radix) = match value.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None if value.starts_with('0') && value.len() > 1 => (&value[1..], 8),
        None => (value, 10),
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    let mut bytes = match &digits[..end] {
        "" if radix == 8 => 0,
        "" => return Err(invalid()),
        number => u64::from_str_radix(number, radix).map_err(|_| invalid())?,
    };

    let power = match value.trim_end_matches('b').chars().last() {
        Some('t') => 4,
        Some('g') => 3,
        Some('m') => 2,
        Some('k') => 1,
        _ => 0,
    };
    for _ in 0..power {
        bytes = bytes.checked_mul(1024).ok_or_else(invalid)?;
    }

    if bytes == 0 {
        return Err(invalid());
    }

    Ok(bytes)
}

/// Resident set size of the current process, read from procfs.
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;

    Some(kb * 1024)
}
