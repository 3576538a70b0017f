//! Retry-until-success for eventually-consistent remote operations.
//!
//! Fixed-interval backoff with a bounded attempt count. Every error is
//! treated as transient; callers that know a failure is permanent should not
//! route the operation through here.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{BuildError, Result};
use crate::models::Node;
use crate::remote::RemoteExecutor;

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(rename = "backoff_ms", with = "duration_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        RetryPolicy { attempts, backoff }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Resolves once the cancel flag is raised. Never resolves if the sender is
/// dropped without cancelling.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Call `op` until it succeeds or `policy.attempts` attempts are used up,
/// sleeping `policy.backoff` between attempts.
///
/// Returns the first success, `RetryExhausted` wrapping the last failure, or
/// `Cancelled` if the cancel flag is raised first.
pub async fn retry_until_success<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &watch::Receiver<bool>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BuildError>,
{
    let mut cancel = cancel.clone();
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        if *cancel.borrow() {
            return Err(BuildError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    log::debug!("succeeded on attempt {}/{}", attempt, attempts);
                }
                return Ok(value);
            }
            Err(e) => {
                let e = e.into();
                log::debug!("attempt {}/{} failed: {}", attempt, attempts, e);
                last = Some(e);
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(policy.backoff) => {}
                _ = cancelled(&mut cancel) => return Err(BuildError::Cancelled),
            }
        }
    }

    let err = BuildError::RetryExhausted {
        attempts,
        last: Box::new(last.unwrap_or(BuildError::Cancelled)),
    };
    log::error!("{}", err);
    Err(err)
}

/// Run a host-level command until it succeeds.
pub async fn run_retrying(
    host: &Arc<dyn RemoteExecutor>,
    command: &str,
    policy: RetryPolicy,
    cancel: &watch::Receiver<bool>,
) -> Result<String> {
    retry_until_success(policy, cancel, move |_| host.run(command)).await
}

/// Run a command inside a node's container until it succeeds.
pub async fn exec_retrying(
    host: &Arc<dyn RemoteExecutor>,
    node: &Node,
    command: &str,
    policy: RetryPolicy,
    cancel: &watch::Receiver<bool>,
) -> Result<String> {
    retry_until_success(policy, cancel, move |_| host.exec(node, command)).await
}
