//! Token exchange coordinator.
//!
//! Turns an externally issued token into an internal one while the user
//! record may still be replicating to the authorizing store. Each attempt
//! calls the exchange service; between attempts the coordinator waits for
//! whichever comes first:
//!
//! - a change notification for the target user (retry immediately)
//! - the poll interval (retry anyway; notifications may be lost or absent)
//! - cancellation of the caller's lifetime token (give up)
//!
//! ```text
//! Init -> Attempting -> WaitingForSignal|WaitingForTick -> Attempting -> ...
//!                   \-> Success | Exhausted | Cancelled
//! ```
//!
//! The coordinator runs on the caller's task. It owns every listener it
//! starts and releases all of them before returning, on every exit path.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{FanInConfig, RetryPolicy};
use crate::exchange::{ExchangeClient, ExchangeError, ExchangeRequest, ExchangeResult};
use crate::fanin::FanIn;
use crate::notify::{ListenerFactory, ListenerHandle, NotifyError};

/// Result type for coordinated exchanges.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Terminal failures of a coordinated exchange.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to start change listener: {0}")]
    Acquisition(#[from] NotifyError),

    #[error("token exchange failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ExchangeError,
    },

    #[error("token exchange cancelled")]
    Cancelled,
}

impl CoordinatorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoordinatorError::Cancelled)
    }
}

/// Coordinator state, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Init,
    Attempting,
    WaitingForSignal,
    WaitingForTick,
    Success,
    Exhausted,
    Cancelled,
}

/// Per-call retry bookkeeping. Never shared between calls.
#[derive(Debug)]
struct ExchangeAttempt {
    index: u32,
    last_error: Option<ExchangeError>,
    state: ExchangeState,
}

impl ExchangeAttempt {
    fn new() -> Self {
        Self {
            index: 0,
            last_error: None,
            state: ExchangeState::Init,
        }
    }

    fn transition(&mut self, next: ExchangeState) {
        trace!(from = ?self.state, to = ?next, attempt = self.index, "State transition");
        self.state = next;
    }
}

/// Why a wait between attempts ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Notified,
    Tick,
    Cancelled,
}

/// Retrying token exchange driven by change notifications.
pub struct ExchangeCoordinator {
    client: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
    fan_in: FanInConfig,
}

impl ExchangeCoordinator {
    pub fn new(client: Arc<dyn ExchangeClient>, policy: RetryPolicy, fan_in: FanInConfig) -> Self {
        Self {
            client,
            policy,
            fan_in,
        }
    }

    /// Exchange using the configured retry policy.
    pub async fn exchange(
        &self,
        lifetime: &CancellationToken,
        request: &ExchangeRequest,
        listeners: &[Arc<dyn ListenerFactory>],
    ) -> Result<ExchangeResult> {
        self.exchange_with_policy(lifetime, request, listeners, &self.policy)
            .await
    }

    /// Exchange `request`, retrying until success, exhaustion or cancellation.
    ///
    /// Listener start-up failures are returned before any exchange call is
    /// made. Individual call failures are not returned; exhaustion carries the
    /// last one.
    #[tracing::instrument(
        name = "exchange",
        skip_all,
        fields(subject_id = %request.subject_id, applicant = %request.applicant)
    )]
    pub async fn exchange_with_policy(
        &self,
        lifetime: &CancellationToken,
        request: &ExchangeRequest,
        listeners: &[Arc<dyn ListenerFactory>],
        policy: &RetryPolicy,
    ) -> Result<ExchangeResult> {
        let handles = start_listeners(lifetime, listeners).await?;
        let mut fan_in = FanIn::start(handles, &self.fan_in);

        let outcome = self.run(&mut fan_in, lifetime, request, policy).await;

        fan_in.stop().await;
        outcome
    }

    async fn run(
        &self,
        fan_in: &mut FanIn,
        lifetime: &CancellationToken,
        request: &ExchangeRequest,
        policy: &RetryPolicy,
    ) -> Result<ExchangeResult> {
        let max_attempts = policy.attempts();
        let call_timeout = policy.call_timeout();
        let mut notifications_open = fan_in.sources() > 0;
        let mut attempt = ExchangeAttempt::new();

        loop {
            if attempt.index > 0 {
                attempt.transition(if notifications_open {
                    ExchangeState::WaitingForSignal
                } else {
                    ExchangeState::WaitingForTick
                });
                let deadline = Instant::now() + policy.poll_interval();
                let wake = wait_for_signal(
                    fan_in,
                    &mut notifications_open,
                    &request.subject_id,
                    deadline,
                    lifetime,
                )
                .await;
                match wake {
                    Wake::Cancelled => {
                        attempt.transition(ExchangeState::Cancelled);
                        info!(attempts = attempt.index, "Exchange cancelled while waiting");
                        return Err(CoordinatorError::Cancelled);
                    }
                    Wake::Notified => debug!("Subject replicated, retrying now"),
                    Wake::Tick => trace!("Poll interval elapsed"),
                }
            }

            attempt.transition(ExchangeState::Attempting);
            let call = tokio::time::timeout(
                call_timeout,
                self.client.exchange(request, call_timeout),
            );
            let result = tokio::select! {
                biased;
                _ = lifetime.cancelled() => {
                    attempt.transition(ExchangeState::Cancelled);
                    info!(attempts = attempt.index + 1, "Exchange cancelled during call");
                    return Err(CoordinatorError::Cancelled);
                }
                result = call => {
                    result.unwrap_or_else(|_| Err(ExchangeError::Timeout(call_timeout)))
                }
            };

            match result {
                Ok(result) => {
                    attempt.transition(ExchangeState::Success);
                    info!(attempts = attempt.index + 1, "Token exchanged");
                    return Ok(result);
                }
                Err(e) if e.is_timeout() => {
                    warn!(attempt = attempt.index + 1, error = %e, "Exchange attempt timed out");
                    attempt.last_error = Some(e);
                    attempt.index += 1;
                }
                Err(e) => {
                    debug!(attempt = attempt.index + 1, error = %e, "Exchange attempt failed");
                    attempt.last_error = Some(e);
                    attempt.index += 1;
                }
            }

            if attempt.index >= max_attempts {
                attempt.transition(ExchangeState::Exhausted);
                let source = attempt
                    .last_error
                    .take()
                    .unwrap_or(ExchangeError::Rejected("no attempt made".to_string()));
                warn!(attempts = attempt.index, error = %source, "Exchange attempts exhausted");
                return Err(CoordinatorError::Exhausted {
                    attempts: attempt.index,
                    source,
                });
            }
        }
    }
}

/// Start every listener, or none.
///
/// If one fails or the lifetime is cancelled while a start is pending, the
/// ones already started are released before the error is returned.
async fn start_listeners(
    lifetime: &CancellationToken,
    listeners: &[Arc<dyn ListenerFactory>],
) -> Result<Vec<ListenerHandle>> {
    let mut handles = Vec::with_capacity(listeners.len());
    for factory in listeners {
        let started = tokio::select! {
            biased;
            _ = lifetime.cancelled() => Err(CoordinatorError::Cancelled),
            started = factory.start(lifetime) => started.map_err(|e| {
                warn!(error = %e, started = handles.len(), "Listener failed to start");
                CoordinatorError::Acquisition(e)
            }),
        };
        match started {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                if e.is_cancelled() {
                    info!(started = handles.len(), "Exchange cancelled while starting listeners");
                }
                for handle in &handles {
                    handle.release().await;
                }
                return Err(e);
            }
        }
    }
    Ok(handles)
}

/// Wait until a matching notification, the deadline or cancellation.
///
/// The deadline is fixed by the caller, so unrelated events never extend or
/// shorten the wait. A closed fan-in leaves only the timer.
async fn wait_for_signal(
    fan_in: &mut FanIn,
    notifications_open: &mut bool,
    subject_id: &str,
    deadline: Instant,
    lifetime: &CancellationToken,
) -> Wake {
    let tick = tokio::time::sleep_until(deadline);
    tokio::pin!(tick);

    loop {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => return Wake::Cancelled,
            event = fan_in.recv(), if *notifications_open => match event {
                Some(event) if event.matches(subject_id) => return Wake::Notified,
                Some(event) => match &event.decode_error {
                    Some(err) => {
                        warn!(error = %err, "Discarding undecodable change notification");
                    }
                    None => {
                        trace!(other = %event.subject_id, "Ignoring unrelated notification");
                    }
                },
                None => {
                    debug!("Change notifications closed, polling only");
                    *notifications_open = false;
                }
            },
            _ = &mut tick => return Wake::Tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exchange::mock::{MockExchangeClient, MockOutcome};
    use crate::notify::MemoryNotifier;

    const SUBJECT: &str = "user-42";
    const POLL: Duration = Duration::from_millis(1000);

    fn request() -> ExchangeRequest {
        ExchangeRequest::new("applicant-1", SUBJECT, "external-token")
    }

    fn coordinator(client: Arc<MockExchangeClient>) -> ExchangeCoordinator {
        ExchangeCoordinator::new(client, RetryPolicy::default(), FanInConfig::default())
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, POLL)
    }

    fn listeners(notifier: &Arc<MemoryNotifier>) -> Vec<Arc<dyn ListenerFactory>> {
        vec![notifier.clone() as Arc<dyn ListenerFactory>]
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_attempt_k_makes_k_calls() {
        for k in 1..=4 {
            let client = Arc::new(MockExchangeClient::succeed_after(k - 1, "internal"));
            let notifier = Arc::new(MemoryNotifier::default());
            let result = coordinator(client.clone())
                .exchange_with_policy(
                    &CancellationToken::new(),
                    &request(),
                    &listeners(&notifier),
                    &policy(5),
                )
                .await
                .unwrap();

            assert_eq!(result.token, "internal");
            assert_eq!(client.call_count(), k);
            assert_eq!(client.max_in_flight(), 1);
            assert!(notifier.all_released().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_attempts_without_listener() {
        let client = Arc::new(MockExchangeClient::succeed_after(2, "internal"));
        let started = Instant::now();

        let result = coordinator(client.clone())
            .exchange_with_policy(&CancellationToken::new(), &request(), &[], &policy(3))
            .await
            .unwrap();

        assert_eq!(result.token, "internal");
        assert_eq!(client.call_count(), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= POLL * 2);
        assert!(elapsed < POLL * 2 + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let client = Arc::new(MockExchangeClient::always_fail());

        let err = coordinator(client.clone())
            .exchange_with_policy(&CancellationToken::new(), &request(), &[], &policy(2))
            .await
            .unwrap_err();

        match err {
            CoordinatorError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert_eq!(source.code(), Some(tonic::Code::NotFound));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_releases_listeners() {
        let client = Arc::new(MockExchangeClient::always_fail());
        let first = Arc::new(MemoryNotifier::default());
        let second = Arc::new(MemoryNotifier::default());
        let factories: Vec<Arc<dyn ListenerFactory>> = vec![first.clone(), second.clone()];

        let err = coordinator(client.clone())
            .exchange_with_policy(
                &CancellationToken::new(),
                &request(),
                &factories,
                &policy(4),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Exhausted { attempts: 4, .. }));
        assert_eq!(client.call_count(), 4);
        assert_eq!(first.started(), 1);
        assert_eq!(second.started(), 1);
        assert!(first.all_released().await);
        assert!(second.all_released().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_calls_once() {
        let client = Arc::new(MockExchangeClient::always_fail());
        let err = coordinator(client.clone())
            .exchange_with_policy(&CancellationToken::new(), &request(), &[], &policy(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Exhausted { attempts: 1, .. }));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_returns_promptly() {
        let client = Arc::new(MockExchangeClient::always_fail());
        let notifier = Arc::new(MemoryNotifier::default());
        let lifetime = CancellationToken::new();
        let long_poll = RetryPolicy::new(10, Duration::from_secs(30));

        let canceller = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = coordinator(client.clone())
            .exchange_with_policy(&lifetime, &request(), &listeners(&notifier), &long_poll)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.call_count(), 1);
        assert!(notifier.all_released().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call_wins() {
        let client = Arc::new(MockExchangeClient::new());
        client.push(MockOutcome::Hang);
        let lifetime = CancellationToken::new();

        let canceller = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = coordinator(client.clone())
            .exchange_with_policy(&lifetime, &request(), &[], &policy(5))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_notification_skips_wait() {
        let client = Arc::new(MockExchangeClient::succeed_after(1, "internal"));
        let notifier = Arc::new(MemoryNotifier::default());

        let sender = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sender.notify_raw("{\"user_id\":");
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.notify(SUBJECT);
        });

        let result = coordinator(client.clone())
            .exchange_with_policy(
                &CancellationToken::new(),
                &request(),
                &listeners(&notifier),
                &policy(5),
            )
            .await
            .unwrap();

        assert_eq!(result.token, "internal");
        let times = client.call_times();
        assert_eq!(times.len(), 2);
        let gap = times[1] - times[0];
        assert!(gap >= Duration::from_millis(300));
        assert!(gap < POLL);
        assert!(notifier.all_released().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_subject_does_not_shorten_wait() {
        let client = Arc::new(MockExchangeClient::succeed_after(1, "internal"));
        let notifier = Arc::new(MemoryNotifier::default());

        let sender = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.notify("someone-else");
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.notify("someone-else-again");
        });

        coordinator(client.clone())
            .exchange_with_policy(
                &CancellationToken::new(),
                &request(),
                &listeners(&notifier),
                &policy(5),
            )
            .await
            .unwrap();

        let times = client.call_times();
        let gap = times[1] - times[0];
        assert!(gap >= POLL);
        assert!(gap < POLL + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_notifications_fall_back_to_polling() {
        let client = Arc::new(MockExchangeClient::succeed_after(2, "internal"));
        let notifier = Arc::new(MemoryNotifier::default());

        let sender = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.disconnect();
        });

        let started = Instant::now();
        let result = coordinator(client.clone())
            .exchange_with_policy(
                &CancellationToken::new(),
                &request(),
                &listeners(&notifier),
                &policy(5),
            )
            .await
            .unwrap();

        assert_eq!(result.token, "internal");
        assert_eq!(client.call_count(), 3);
        assert!(started.elapsed() >= POLL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failed_attempt() {
        let client = Arc::new(MockExchangeClient::new());
        client.push(MockOutcome::Hang);
        client.push(MockOutcome::Token("internal".to_string()));
        let policy = policy(3).with_call_timeout(Duration::from_secs(5));

        let started = Instant::now();
        let result = coordinator(client.clone())
            .exchange_with_policy(&CancellationToken::new(), &request(), &[], &policy)
            .await
            .unwrap();

        assert_eq!(result.token, "internal");
        assert_eq!(client.call_count(), 2);
        assert!(started.elapsed() >= Duration::from_secs(5) + POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_start_failure_is_reported_before_any_call() {
        let client = Arc::new(MockExchangeClient::succeed_after(0, "internal"));
        let healthy = Arc::new(MemoryNotifier::default());
        let broken = Arc::new(MemoryNotifier::default());
        broken.set_fail_on_start(true);
        let factories: Vec<Arc<dyn ListenerFactory>> = vec![healthy.clone(), broken.clone()];

        let err = coordinator(client.clone())
            .exchange(&CancellationToken::new(), &request(), &factories)
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Acquisition(_)));
        assert_eq!(client.call_count(), 0);
        assert_eq!(healthy.started(), 1);
        assert!(healthy.all_released().await);
    }

    /// Factory whose start never completes, like a pool with no free
    /// connection.
    struct StalledFactory;

    #[async_trait::async_trait]
    impl ListenerFactory for StalledFactory {
        async fn start(
            &self,
            _lifetime: &CancellationToken,
        ) -> std::result::Result<ListenerHandle, NotifyError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_listener_starts_releases_started() {
        let client = Arc::new(MockExchangeClient::succeed_after(0, "internal"));
        let healthy = Arc::new(MemoryNotifier::default());
        let factories: Vec<Arc<dyn ListenerFactory>> =
            vec![healthy.clone(), Arc::new(StalledFactory)];
        let lifetime = CancellationToken::new();

        let canceller = lifetime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = coordinator(client.clone())
            .exchange(&lifetime, &request(), &factories)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(client.call_count(), 0);
        assert_eq!(healthy.started(), 1);
        assert!(healthy.all_released().await);
    }

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::Exhausted {
            attempts: 2,
            source: ExchangeError::Rejected("denied".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "token exchange failed after 2 attempts: exchange rejected: denied"
        );
        assert_eq!(CoordinatorError::Cancelled.to_string(), "token exchange cancelled");
    }
}
