//! In-process test doubles for the collaborator traits.
//!
//! Enabled for downstream crates through the `testing` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::notify::{Notification, Notifier, Severity};
use crate::service::{ServiceControl, ServiceError, ServiceResult};
use crate::types::{BoxFuture, HealthVerdict, ProbeFailureKind, Prober};

/// Service double that records every call and fails on demand.
#[derive(Debug, Default)]
pub struct ScriptedService {
    calls: Mutex<Vec<&'static str>>,
    restart_failures: Mutex<VecDeque<bool>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    inactive: AtomicBool,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue restart outcomes: `true` fails that restart. Unqueued restarts succeed.
    pub fn with_restart_failures(self, failures: &[bool]) -> Self {
        self.restart_failures
            .lock()
            .unwrap()
            .extend(failures.iter().copied());
        self
    }

    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_stop(self) -> Self {
        self.fail_stop.store(true, Ordering::SeqCst);
        self
    }

    pub fn inactive(self) -> Self {
        self.inactive.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_start_fails(&self, fails: bool) {
        self.fail_start.store(fails, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == verb).count()
    }

    fn record(&self, verb: &'static str) {
        self.calls.lock().unwrap().push(verb);
    }

    fn failure(verb: &'static str) -> ServiceError {
        ServiceError::CommandFailed {
            verb,
            unit: "scripted".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "scripted failure".to_string(),
        }
    }
}

impl ServiceControl for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start(&self) -> BoxFuture<'_, ServiceResult<()>> {
        self.record("start");
        let fails = self.fail_start.load(Ordering::SeqCst);
        Box::pin(async move {
            if fails { Err(Self::failure("start")) } else { Ok(()) }
        })
    }

    fn stop(&self) -> BoxFuture<'_, ServiceResult<()>> {
        self.record("stop");
        let fails = self.fail_stop.load(Ordering::SeqCst);
        Box::pin(async move {
            if fails { Err(Self::failure("stop")) } else { Ok(()) }
        })
    }

    fn restart(&self) -> BoxFuture<'_, ServiceResult<()>> {
        self.record("restart");
        let fails = self
            .restart_failures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(false);
        Box::pin(async move {
            if fails { Err(Self::failure("restart")) } else { Ok(()) }
        })
    }

    fn is_active(&self) -> BoxFuture<'_, ServiceResult<bool>> {
        self.record("is_active");
        let active = !self.inactive.load(Ordering::SeqCst);
        Box::pin(async move { Ok(active) })
    }
}

/// Prober double that replays a script of verdicts, then a fallback.
#[derive(Debug)]
pub struct ScriptedProber {
    script: Mutex<VecDeque<HealthVerdict>>,
    fallback: HealthVerdict,
    probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn always(verdict: HealthVerdict) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: verdict,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn healthy() -> Self {
        Self::always(HealthVerdict::Healthy)
    }

    pub fn unhealthy() -> Self {
        Self::always(unreachable_verdict())
    }

    /// Replay `script` in order, then answer `fallback` forever.
    pub fn sequence(script: Vec<HealthVerdict>, fallback: HealthVerdict) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Prober for ScriptedProber {
    fn probe(&self) -> BoxFuture<'_, HealthVerdict> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let verdict = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { verdict })
    }
}

/// The verdict of a service whose health endpoint does not answer.
pub fn unreachable_verdict() -> HealthVerdict {
    HealthVerdict::Unhealthy {
        reasons: [ProbeFailureKind::HttpUnreachable].into_iter().collect(),
    }
}

/// Notifier double that keeps everything it is sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.severity == severity)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}
