//! Retry and error classification for chain I/O
//!
//! Provides exponential backoff and the string classification used to decide
//! whether a provider error is worth retrying.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::ConnectorError;
use crate::metrics;

/// Backoff configuration for connector calls and record retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Maximum attempts for a single `submit` call
    pub max_submit_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_submit_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Calculate the next retry time
    pub fn next_retry_after(&self, attempt: u32) -> DateTime<Utc> {
        let backoff = self.backoff_for_attempt(attempt);
        Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60))
    }

    /// Check if a record is ready for retry based on retry_after
    pub fn is_ready_for_retry(&self, retry_after: Option<DateTime<Utc>>) -> bool {
        match retry_after {
            Some(time) => Utc::now() >= time,
            None => true,
        }
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Transaction underpriced - retry, fillers re-estimate fees
    Underpriced,
    /// Gas limit estimated too low - retry
    GasMisestimate,
    /// Nonce raced with another transaction from the same signer
    NonceTooLow,
    /// Nonce too high - wait for pending transactions
    NonceTooHigh,
    /// Permanent failure - do not retry (invalid params, contract error)
    Permanent,
    /// Unknown error - may retry with backoff
    Unknown,
}

impl ErrorClass {
    /// Whether a revert with this class may succeed on a later attempt
    pub fn is_transient_revert(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient
                | ErrorClass::Underpriced
                | ErrorClass::GasMisestimate
                | ErrorClass::NonceTooLow
                | ErrorClass::NonceTooHigh
        )
    }
}

/// Classify an error for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    // Transient errors
    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("429")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("header not found")
    {
        return ErrorClass::Transient;
    }

    // Gas price errors
    if error_lower.contains("underpriced")
        || error_lower.contains("replacement transaction")
        || error_lower.contains("gas price too low")
        || error_lower.contains("max fee per gas less than")
    {
        return ErrorClass::Underpriced;
    }

    // Gas limit errors
    if error_lower.contains("out of gas")
        || error_lower.contains("intrinsic gas too low")
        || error_lower.contains("gas required exceeds")
    {
        return ErrorClass::GasMisestimate;
    }

    // Nonce errors
    if error_lower.contains("nonce too low") || error_lower.contains("already known") {
        return ErrorClass::NonceTooLow;
    }

    if error_lower.contains("nonce too high") {
        return ErrorClass::NonceTooHigh;
    }

    // Permanent errors
    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("invalid params")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("already processed")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Map a provider error message onto the connector taxonomy.
///
/// Reverts keep their reason so the engine can decide whether a later
/// attempt could succeed. Unknown messages are treated as transient.
pub fn classify_rpc_error(message: &str) -> ConnectorError {
    let lower = message.to_lowercase();
    match classify_error(message) {
        ErrorClass::Permanent if lower.contains("revert") => ConnectorError::SubmissionReverted {
            reason: message.to_string(),
        },
        ErrorClass::Permanent => ConnectorError::Permanent(message.to_string()),
        ErrorClass::GasMisestimate => ConnectorError::SubmissionReverted {
            reason: message.to_string(),
        },
        _ => ConnectorError::TransientRpc(message.to_string()),
    }
}

/// Retry a read until it succeeds or fails permanently.
pub async fn retry_read<F, T, Fut>(
    config: &RetryConfig,
    chain: &str,
    op_name: &str,
    mut operation: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                let backoff = config.backoff_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                metrics::record_rpc_retry(chain, op_name);
                warn!(
                    chain = %chain,
                    op = %op_name,
                    attempt,
                    ?backoff,
                    error = %e,
                    "Transient RPC error, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry a submission at most `max_submit_attempts` times.
pub async fn retry_submit<F, T, Fut>(
    config: &RetryConfig,
    chain: &str,
    mut operation: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let max = config.max_submit_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt + 1 < max => {
                let backoff = config.backoff_for_attempt(attempt);
                attempt += 1;
                metrics::record_rpc_retry(chain, "submit");
                warn!(
                    chain = %chain,
                    attempt,
                    max,
                    ?backoff,
                    error = %e,
                    "Submission failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            max_submit_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(32));
        assert_eq!(config.backoff_for_attempt(6), Duration::from_secs(60)); // capped
        assert_eq!(config.backoff_for_attempt(500), Duration::from_secs(60));
    }

    #[test]
    fn test_ready_for_retry() {
        let config = RetryConfig::default();
        assert!(config.is_ready_for_retry(None));
        assert!(config.is_ready_for_retry(Some(Utc::now() - chrono::Duration::seconds(1))));
        assert!(!config.is_ready_for_retry(Some(config.next_retry_after(3))));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(
            classify_error("replacement transaction underpriced"),
            ErrorClass::Underpriced
        );
        assert_eq!(classify_error("out of gas"), ErrorClass::GasMisestimate);
        assert_eq!(classify_error("nonce too low"), ErrorClass::NonceTooLow);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("insufficient funds for gas"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[test]
    fn test_transient_reverts() {
        assert!(classify_error("intrinsic gas too low").is_transient_revert());
        assert!(classify_error("transaction underpriced").is_transient_revert());
        assert!(!classify_error("execution reverted: already processed").is_transient_revert());
        assert!(!classify_error("weird").is_transient_revert());
    }

    #[test]
    fn test_rpc_error_mapping() {
        assert!(classify_rpc_error("request timed out").is_transient());
        assert!(classify_rpc_error("something odd").is_transient());
        assert!(matches!(
            classify_rpc_error("execution reverted: paused"),
            ConnectorError::SubmissionReverted { .. }
        ));
        assert!(matches!(
            classify_rpc_error("insufficient funds for gas * price + value"),
            ConnectorError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_retry_read_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_read(&fast_config(), "test", "head", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(ConnectorError::TransientRpc("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_read_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_read(&fast_config(), "test", "logs", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConnectorError::Permanent("invalid params".into())) }
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_submit_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_submit(&fast_config(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ConnectorError::TransientRpc("503".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
