//! Asynchronous retry combinators used to drive network operations to
//! completion without blocking the scheduling thread.
//!
//! The wrapped operation reports `Ok(true)` when done, `Ok(false)` when
//! it should be tried again, or an error. Every strategy yields between
//! attempts, and a per-instance FIFO mutex guarantees that concurrent
//! `run_with_retry` calls on the same instance execute their operations
//! strictly in arrival order.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("retrying aborted")]
    Aborted,
    #[error("unrecoverable failure: {0}")]
    Unrecoverable(E),
}

/// Retries forever on both `false` results and errors; only success or
/// the abort predicate stops it.
#[derive(Default)]
pub struct EndlessRetryStrategy {
    gate: Mutex<()>,
}

impl EndlessRetryStrategy {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn run_with_retry<F, Fut, E>(
        &self,
        mut op: F,
        abort: impl Fn() -> bool,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let _gate = self.gate.lock().await;

        loop {
            if abort() {
                return Err(RetryError::Aborted);
            }

            match op().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => tokio::task::yield_now().await,
            }
        }
    }
}

/// Retries on errors the classifier deems recoverable; any other error
/// fails the call immediately.
pub struct RecoverableRetryStrategy<E> {
    gate: Mutex<()>,
    is_recoverable: Box<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> RecoverableRetryStrategy<E> {
    pub fn new(is_recoverable: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            gate: Mutex::new(()),
            is_recoverable: Box::new(is_recoverable),
        }
    }

    pub async fn run_with_retry<F, Fut>(&self, mut op: F) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let _gate = self.gate.lock().await;

        loop {
            match op().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    if !(self.is_recoverable)(&e) {
                        return Err(RetryError::Unrecoverable(e));
                    }
                    debug!("retrying recoverable failure");
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Like the recoverable variant, but also checks an abort predicate
/// between attempts.
pub struct AbortableRetryStrategy<E> {
    gate: Mutex<()>,
    is_recoverable: Box<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> AbortableRetryStrategy<E> {
    pub fn new(is_recoverable: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            gate: Mutex::new(()),
            is_recoverable: Box::new(is_recoverable),
        }
    }

    pub async fn run_with_retry<F, Fut>(
        &self,
        mut op: F,
        abort: impl Fn() -> bool,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let _gate = self.gate.lock().await;

        loop {
            if abort() {
                return Err(RetryError::Aborted);
            }

            match op().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    if !(self.is_recoverable)(&e) {
                        return Err(RetryError::Unrecoverable(e));
                    }
                }
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Endless retry with an increasing timer-based delay between attempts,
/// doubling from `initial_delay` up to `max_delay`.
pub struct BackoffRetryStrategy {
    gate: Mutex<()>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl BackoffRetryStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            gate: Mutex::new(()),
            initial_delay,
            max_delay,
        }
    }

    pub async fn run_with_retry<F, Fut, E>(
        &self,
        mut op: F,
        abort: impl Fn() -> bool,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
    {
        let _gate = self.gate.lock().await;

        let mut delay = self.initial_delay;
        loop {
            if abort() {
                return Err(RetryError::Aborted);
            }

            match op().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}
