//! Fixed-interval retry for broker connection establishment.
//!
//! Used once per process, at transport startup, to wait for a broker that may
//! still be coming up (typical in container deployments).
//!
//! # Retry Strategy
//!
//! - Only retries [`RpcError::TransportUnavailable`](crate::RpcError::TransportUnavailable)
//! - Constant pause between attempts, no jitter, no growth
//! - No pause after the final attempt
//! - Logs each failed attempt as `attempt n/max`

use std::future::Future;

use tokio::time::sleep;

use crate::{log_info, log_warn, ConnectRetry, Result, RpcError};

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
///
/// Returns the last `TransportUnavailable` on exhaustion.
pub(crate) async fn retry_fixed<F, Fut, T>(policy: &ConnectRetry, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    log_info!("connected on attempt {attempt}/{max_attempts}");
                }
                return Ok(value);
            }
            Err(RpcError::TransportUnavailable(details)) => {
                log_warn!("attempt {attempt}/{max_attempts} failed: {details}");

                if attempt >= max_attempts {
                    return Err(RpcError::TransportUnavailable(format!(
                        "gave up after {max_attempts} attempts: {details}"
                    )));
                }

                attempt += 1;
                sleep(policy.interval).await;
            }
            Err(err) => return Err(err),
        }
    }
}
