//! Mock exchange client for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tonic::Status;

use super::{ExchangeClient, ExchangeError, ExchangeRequest, ExchangeResult, Result};

/// Scripted response for one call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Token(String),
    Fail(String),
    /// Never answers; the caller's deadline decides.
    Hang,
}

/// Mock exchange client that replays a script of outcomes.
///
/// Once the script is exhausted every further call fails.
#[derive(Default)]
pub struct MockExchangeClient {
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExchangeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `failures` times, then return `token`.
    pub fn succeed_after(failures: usize, token: &str) -> Self {
        let client = Self::new();
        for i in 0..failures {
            client.push(MockOutcome::Fail(format!("not replicated yet ({})", i + 1)));
        }
        client.push(MockOutcome::Token(token.to_string()));
        client
    }

    /// Fail every call.
    pub fn always_fail() -> Self {
        Self::new()
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Instants at which each call started.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest number of calls that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn exchange(
        &self,
        request: &ExchangeRequest,
        deadline: Duration,
    ) -> Result<ExchangeResult> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match outcome {
            Some(MockOutcome::Token(token)) => Ok(ExchangeResult { token }),
            Some(MockOutcome::Fail(message)) => Err(Status::unavailable(message).into()),
            Some(MockOutcome::Hang) => {
                tokio::time::sleep(deadline).await;
                Err(ExchangeError::Timeout(deadline))
            }
            None => Err(Status::not_found(format!(
                "user {} not visible to authorizer",
                request.subject_id
            ))
            .into()),
        }
    }
}
