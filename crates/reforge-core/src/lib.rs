//! reforge-core — shared model for the Reforge supervisor.
//!
//! Holds the deployment data model, the `reforge.toml` configuration, and
//! the collaborator seams every episode runs against: process control
//! ([`ServiceControl`]), health verdicts ([`Prober`]), notifications
//! ([`Notifier`]) and the cross-process [`DeploymentLock`].

pub mod config;
pub mod duration;
pub mod lock;
pub mod notify;
pub mod service;
pub mod source;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ConfigError, ReforgeConfig};
pub use lock::DeploymentLock;
pub use notify::{Notification, Notifier, NullNotifier, Severity, WebhookNotifier};
pub use service::{ServiceControl, ServiceError, ServiceResult, SystemdService};
pub use source::{ReleaseSourceUri, SourceError};
pub use types::*;
