//! reforge-health — health probing and restart escalation.
//!
//! # Architecture
//!
//! ```text
//! RestartEscalator
//!   ├── Prober (HealthProbe in production)
//!   │   ├── ServiceControl::is_active → ProcessNotRunning
//!   │   ├── http_probe()              → HttpUnreachable / HttpBadStatus
//!   │   └── ResourceSampler           → HighCpu / HighMemory / HighDisk (advisory)
//!   ├── ServiceControl::restart
//!   └── Notifier (recovered / exhausted)
//! ```
//!
//! # Self-Healing
//!
//! An unhealthy verdict starts a healing episode: up to `max_attempts`
//! restarts, each followed by a fixed stabilization delay and a fresh
//! probe. The first healthy probe ends the episode. Resource advisories are
//! logged but never start one.

pub mod checker;
pub mod escalator;
pub mod resources;

pub use checker::{http_probe, HealthProbe, HttpOutcome, ProbeReport};
pub use escalator::{
    CheckOutcome, EscalationState, HealReport, HealResult, RestartAttempt, RestartEscalator,
    RestartOutcome, RestartPolicy,
};
pub use resources::{ResourceSampler, ResourceThresholds, ResourceUsage, SystemSampler};
