//! Rate-limited request gate.
//!
//! Every outbound call goes through [`RequestGate::execute`]. The gate keeps
//! one [`FamilyState`] per [`EndpointFamily`], each behind its own lock, so
//! history and replies traffic throttle independently while concurrent
//! callers of the same family are spaced out by slot reservation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiFailure, EndpointFamily};
use crate::error::FetchError;

const STABILIZE_STEP: Duration = Duration::from_millis(200);
const OPTIMIZE_STEP: Duration = Duration::from_millis(100);
const OPTIMIZE_AFTER_SUCCESSES: u32 = 90;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive 429s tolerated for one request.
    pub max_rate_limit_retries: u32,
    /// Transport failures tolerated for one request.
    pub max_transport_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Grow/shrink a per-family post-request delay from observed 429s.
    pub adaptive: bool,
    /// Transport backoff when `adaptive` is off.
    pub static_backoff: Duration,
    /// Client-side ceiling, requests per minute per family.
    pub max_rpm: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 20,
            max_transport_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            adaptive: true,
            static_backoff: Duration::from_secs(30),
            max_rpm: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failures` (1-based) after a transport error.
    pub fn transport_delay(&self, failures: u32) -> Duration {
        if !self.adaptive {
            return self.static_backoff;
        }
        let exponent = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    fn min_spacing(&self) -> Duration {
        match self.max_rpm {
            Some(rpm) if rpm > 0.0 => Duration::from_secs_f64(60.0 / rpm),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct FamilyState {
    /// Server-declared earliest time for the next call.
    next_allowed: Option<Instant>,
    /// Last reserved dispatch slot.
    last_dispatch: Option<Instant>,
    post_request_delay: Duration,
    success_streak: u32,
    requests: u64,
    rate_limited: u64,
    transport_failures: u64,
}

/// Counters for one family, as reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    pub family: EndpointFamily,
    pub requests: u64,
    pub rate_limited: u64,
    pub transport_failures: u64,
    pub post_request_delay_ms: u64,
}

/// Run-wide throttling state, one lock per endpoint family.
#[derive(Debug)]
pub struct RateState {
    families: HashMap<EndpointFamily, Mutex<FamilyState>>,
}

impl Default for RateState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateState {
    pub fn new() -> Self {
        let families = EndpointFamily::ALL
            .into_iter()
            .map(|family| (family, Mutex::new(FamilyState::default())))
            .collect();
        Self { families }
    }

    fn lock(&self, family: EndpointFamily) -> Option<MutexGuard<'_, FamilyState>> {
        self.families
            .get(&family)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Reserves the next dispatch slot and returns when it opens.
    fn reserve_slot(&self, family: EndpointFamily, policy: &RetryPolicy) -> Instant {
        let now = Instant::now();
        let Some(mut state) = self.lock(family) else {
            return now;
        };
        let spacing = state.post_request_delay.max(policy.min_spacing());
        let mut at = now;
        if let Some(next_allowed) = state.next_allowed {
            at = at.max(next_allowed);
        }
        if let Some(last) = state.last_dispatch {
            at = at.max(last + spacing);
        }
        state.last_dispatch = Some(at);
        at
    }

    fn on_success(&self, family: EndpointFamily, policy: &RetryPolicy) {
        let Some(mut state) = self.lock(family) else {
            return;
        };
        state.requests += 1;
        state.success_streak += 1;
        if policy.adaptive
            && state.success_streak >= OPTIMIZE_AFTER_SUCCESSES
            && !state.post_request_delay.is_zero()
        {
            state.post_request_delay = state.post_request_delay.saturating_sub(OPTIMIZE_STEP);
            state.success_streak = 0;
            info!(
                family = %family,
                delay_ms = state.post_request_delay.as_millis() as u64,
                "decreased post-request delay"
            );
        }
    }

    /// Records a 429 and pushes `next_allowed` out to now + `retry_after`.
    /// Never moves it earlier.
    fn on_rate_limited(&self, family: EndpointFamily, retry_after: Duration, policy: &RetryPolicy) {
        let Some(mut state) = self.lock(family) else {
            return;
        };
        state.requests += 1;
        state.rate_limited += 1;
        state.success_streak = 0;

        let until = Instant::now() + retry_after;
        state.next_allowed = Some(state.next_allowed.map_or(until, |prev| prev.max(until)));

        if policy.adaptive {
            let current = state.post_request_delay;
            let grow = match retry_after.checked_sub(current) {
                Some(delta) if delta >= STABILIZE_STEP => delta - STABILIZE_STEP,
                _ => STABILIZE_STEP,
            };
            // capped at the tier's even spacing; the retry-after itself is
            // already enforced through next_allowed
            state.post_request_delay = (current + grow).min(family.tier_spacing());
            info!(
                family = %family,
                delay_ms = state.post_request_delay.as_millis() as u64,
                "increased post-request delay"
            );
        }
    }

    fn on_transport_failure(&self, family: EndpointFamily) {
        if let Some(mut state) = self.lock(family) {
            state.requests += 1;
            state.transport_failures += 1;
            state.success_streak = 0;
        }
    }

    /// Earliest time the server allows the next call, if one is pending.
    pub fn next_allowed(&self, family: EndpointFamily) -> Option<Instant> {
        self.lock(family).and_then(|s| s.next_allowed)
    }

    pub fn post_request_delay(&self, family: EndpointFamily) -> Duration {
        self.lock(family)
            .map(|s| s.post_request_delay)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<RateSnapshot> {
        EndpointFamily::ALL
            .into_iter()
            .filter_map(|family| {
                self.lock(family).map(|s| RateSnapshot {
                    family,
                    requests: s.requests,
                    rate_limited: s.rate_limited,
                    transport_failures: s.transport_failures,
                    post_request_delay_ms: s.post_request_delay.as_millis() as u64,
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct RequestGate {
    policy: RetryPolicy,
    state: RateState,
    cancel: CancellationToken,
}

impl RequestGate {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            state: RateState::new(),
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn rate_state(&self) -> &RateState {
        &self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `call` until it succeeds, fails unrecoverably, or exhausts the
    /// retry bounds. `call` is invoked once per attempt.
    pub async fn execute<T, F, Fut>(&self, family: EndpointFamily, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiFailure>>,
    {
        let mut rate_limit_hits: u32 = 0;
        let mut transport_failures: u32 = 0;

        loop {
            self.wait_turn(family).await?;

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled { family }),
                outcome = call() => outcome,
            };

            match outcome {
                Ok(value) => {
                    self.state.on_success(family, &self.policy);
                    return Ok(value);
                }
                Err(ApiFailure::RateLimited { retry_after }) => {
                    rate_limit_hits += 1;
                    let delay = retry_after.unwrap_or(self.policy.backoff_base);
                    self.state.on_rate_limited(family, delay, &self.policy);
                    if rate_limit_hits > self.policy.max_rate_limit_retries {
                        return Err(FetchError::Transient {
                            family,
                            attempts: rate_limit_hits + transport_failures,
                            message: "rate limit retries exhausted".to_string(),
                        });
                    }
                    warn!(
                        family = %family,
                        attempt = rate_limit_hits,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, waiting before retry"
                    );
                }
                Err(ApiFailure::Transport(message)) => {
                    transport_failures += 1;
                    self.state.on_transport_failure(family);
                    if transport_failures > self.policy.max_transport_retries {
                        return Err(FetchError::Transient {
                            family,
                            attempts: rate_limit_hits + transport_failures,
                            message,
                        });
                    }
                    let delay = self.policy.transport_delay(transport_failures);
                    warn!(
                        family = %family,
                        attempt = transport_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "request failed, backing off"
                    );
                    self.sleep(family, Instant::now() + delay).await?;
                }
                Err(ApiFailure::Unrecoverable { kind, message }) => {
                    debug!(family = %family, %kind, %message, "unrecoverable response");
                    return Err(FetchError::Unrecoverable {
                        family,
                        kind,
                        message,
                    });
                }
            }
        }
    }

    async fn wait_turn(&self, family: EndpointFamily) -> Result<(), FetchError> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled { family });
        }
        let at = self.state.reserve_slot(family, &self.policy);
        self.sleep(family, at).await
    }

    async fn sleep(&self, family: EndpointFamily, until: Instant) -> Result<(), FetchError> {
        if until <= Instant::now() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled { family }),
            _ = sleep_until(until) => Ok(()),
        }
    }
}
