//! Retryable units of work.
//!
//! A unit of work runs inside one database transaction at an explicit isolation
//! level. Write conflicts (serialization failures and deadlocks) abort the whole
//! unit, which is then re-run from the start after an exponential backoff.

use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::time::Duration;

use crate::error::SettlementError;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn statement(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep before re-running after the `retry`-th failure (0-based):
    /// `base_delay * backoff^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.mul_f64(self.backoff.powi(retry as i32))
    }
}

/// How a unit of work failed.
#[derive(Debug)]
pub enum TxFailure {
    /// Write conflict; the unit may be re-run from scratch.
    Retryable(sqlx::Error),
    Fatal(SettlementError),
}

impl std::fmt::Display for TxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxFailure::Retryable(err) => write!(f, "retryable: {}", err),
            TxFailure::Fatal(err) => write!(f, "{}", err),
        }
    }
}

/// SQLSTATE classes that mean "re-run the transaction".
pub fn is_retryable_sqlstate(code: Option<&str>) -> bool {
    matches!(code, Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED))
}

impl From<sqlx::Error> for TxFailure {
    fn from(err: sqlx::Error) -> Self {
        let retryable = match &err {
            sqlx::Error::Database(db) => is_retryable_sqlstate(db.code().as_deref()),
            _ => false,
        };
        if retryable {
            TxFailure::Retryable(err)
        } else {
            TxFailure::Fatal(SettlementError::Database(err))
        }
    }
}

impl From<SettlementError> for TxFailure {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Database(db) => TxFailure::from(db),
            other => TxFailure::Fatal(other),
        }
    }
}

/// Runs `op` until it succeeds, fails fatally, or exhausts the policy.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, SettlementError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TxFailure>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(TxFailure::Fatal(err)) => return Err(err),
            Err(TxFailure::Retryable(err)) => {
                if attempt >= policy.max_attempts {
                    tracing::error!(attempts = attempt, error = %err, "Unit of work kept conflicting, giving up");
                    return Err(SettlementError::DeadlockExceeded {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Write conflict, retrying unit of work"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Executes units of work against the pool under a retry policy.
#[derive(Clone)]
pub struct TransactionRunner {
    pool: PgPool,
    policy: RetryPolicy,
}

impl TransactionRunner {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `work` in its own transaction. The closure may be called more than
    /// once, so it must only capture owned, cloneable state.
    pub async fn run<T, F>(&self, isolation: IsolationLevel, work: F) -> Result<T, SettlementError>
    where
        T: Send + 'static,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, TxFailure>> + Send + Sync,
    {
        retry_with_backoff(&self.policy, || self.run_once(isolation, &work)).await
    }

    async fn run_once<T, F>(&self, isolation: IsolationLevel, work: &F) -> Result<T, TxFailure>
    where
        T: Send + 'static,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, TxFailure>> + Send + Sync,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query(isolation.statement()).execute(&mut *tx).await?;

        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed unit of work also failed");
                }
                Err(err)
            }
        }
    }
}
