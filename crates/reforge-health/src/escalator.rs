//! Restart escalation — bounded self-healing for an unhealthy service.
//!
//! A healing episode restarts the service up to `max_attempts` times,
//! waiting a fixed delay after each restart before re-probing. The first
//! healthy probe ends the episode. When the budget runs out the episode is
//! declared exhausted and a critical notification goes out.
//!
//! ```text
//! Idle → Restarting(1) → Probing(1) → Recovered(1)
//!                      ↘ (unhealthy / restart failed)
//!        Restarting(2) → Probing(2) → ... → Exhausted
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use reforge_core::config::HealConfig;
use reforge_core::{HealthVerdict, Notification, Notifier, Prober, ServiceControl};

/// Retry budget for one healing episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    /// Stabilization wait after a restart, and the pause between attempts.
    pub restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            restart_delay: Duration::from_secs(60),
        }
    }
}

impl From<&HealConfig> for RestartPolicy {
    fn from(config: &HealConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            restart_delay: config.restart_delay,
        }
    }
}

/// Position of a healing episode. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Idle,
    Restarting { attempt: u32 },
    Probing { attempt: u32 },
    Recovered { attempt: u32 },
    Exhausted,
}

impl EscalationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Recovered { .. } | Self::Exhausted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    RestartSucceeded,
    RestartFailed,
}

/// One restart within a healing episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartAttempt {
    /// 1-based sequence number.
    pub sequence: u32,
    pub outcome: RestartOutcome,
    /// Verdict after stabilization; `None` when the restart itself failed.
    pub verdict: Option<HealthVerdict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealResult {
    /// A probe after restart `attempt` came back healthy.
    Recovered { attempt: u32 },
    /// Every attempt was used without recovery.
    Exhausted { attempts: u32 },
    /// Shutdown was requested between attempts.
    Interrupted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealReport {
    pub result: HealResult,
    pub attempts: Vec<RestartAttempt>,
}

/// Outcome of the health-check entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The first probe was healthy; nothing was restarted.
    Healthy,
    /// The service was unhealthy and a healing episode ran.
    Healed(HealReport),
}

/// Drives restart escalation against one service.
pub struct RestartEscalator {
    service: Arc<dyn ServiceControl>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    policy: RestartPolicy,
}

impl RestartEscalator {
    pub fn new(
        service: Arc<dyn ServiceControl>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            service,
            prober,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Probe once and escalate only if the service is unhealthy.
    pub async fn check_and_heal(&self, shutdown: &watch::Receiver<bool>) -> CheckOutcome {
        let verdict = self.prober.probe().await;
        if verdict.is_healthy() {
            debug!(service = self.service.name(), "service healthy, no action");
            return CheckOutcome::Healthy;
        }

        warn!(
            service = self.service.name(),
            %verdict,
            max_attempts = self.policy.max_attempts,
            "service unhealthy, starting restart escalation"
        );
        CheckOutcome::Healed(self.heal(shutdown).await)
    }

    /// Run one healing episode.
    pub async fn heal(&self, shutdown: &watch::Receiver<bool>) -> HealReport {
        let service = self.service.name();
        let max = self.policy.max_attempts;
        let mut state = EscalationState::Idle;
        let mut attempts: Vec<RestartAttempt> = Vec::with_capacity(max as usize);

        for attempt in 1..=max {
            if *shutdown.borrow() {
                info!(service, attempt, "shutdown requested, abandoning escalation");
                return HealReport {
                    result: HealResult::Interrupted {
                        attempts: attempts.len() as u32,
                    },
                    attempts,
                };
            }

            state = advance(state, EscalationState::Restarting { attempt });
            info!(service, attempt, max, "restarting service");

            match self.service.restart().await {
                Err(e) => {
                    warn!(service, attempt, error = %e, "restart command failed");
                    attempts.push(RestartAttempt {
                        sequence: attempt,
                        outcome: RestartOutcome::RestartFailed,
                        verdict: None,
                    });
                }
                Ok(()) => {
                    pause(self.policy.restart_delay).await;
                    state = advance(state, EscalationState::Probing { attempt });

                    let verdict = self.prober.probe().await;
                    let healthy = verdict.is_healthy();
                    attempts.push(RestartAttempt {
                        sequence: attempt,
                        outcome: RestartOutcome::RestartSucceeded,
                        verdict: Some(verdict),
                    });

                    if healthy {
                        advance(state, EscalationState::Recovered { attempt });
                        info!(service, attempt, "service recovered");
                        self.notifier.notify(Notification::info(
                            "service recovered",
                            format!("{service} healthy again after restart attempt {attempt}/{max}"),
                        ));
                        return HealReport {
                            result: HealResult::Recovered { attempt },
                            attempts,
                        };
                    }
                    warn!(service, attempt, "service still unhealthy after restart");
                }
            }

            if attempt < max {
                pause(self.policy.restart_delay).await;
            }
        }

        advance(state, EscalationState::Exhausted);
        error!(service, attempts = max, "restart attempts exhausted, operator intervention required");
        self.notifier.notify(Notification::critical(
            "service unrecoverable",
            format!("{service} still unhealthy after {max} restart attempts; manual intervention required"),
        ));

        HealReport {
            result: HealResult::Exhausted { attempts: max },
            attempts,
        }
    }
}

fn advance(from: EscalationState, to: EscalationState) -> EscalationState {
    debug_assert!(!from.is_terminal(), "transition out of terminal state {from:?}");
    debug!(?from, ?to, "escalation transition");
    to
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
