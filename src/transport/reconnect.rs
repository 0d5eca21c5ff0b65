use std::future::Future;
use std::time::Duration;
use anyhow::bail;
use tokio::time::sleep;
use tracing::{debug, warn};
use crate::status::IpcError;

/// Bounded retries for establishing a connection. The delay after a failed attempt is
///  `remaining_attempts * base_delay`, so the first retries wait longest: a service process
///  that is still starting up is not hammered, and spacing tightens as the budget runs out.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            bail!("reconnect policy needs at least one attempt");
        }
        Ok(())
    }

    pub fn delay_before_retry(&self, remaining_attempts: u32) -> Duration {
        self.base_delay * remaining_attempts
    }

    /// The sum of all delays if every attempt fails
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|remaining| self.delay_before_retry(remaining))
            .sum()
    }

    /// Call `attempt` (with the 1-based attempt number) until it succeeds or the budget is
    ///  exhausted, which fails with [IpcError::ConnectFailed]. There is no delay after the last
    ///  attempt.
    pub async fn connect<T, F, Fut>(&self, mut attempt: F) -> anyhow::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        for n in 1..=self.max_attempts {
            match attempt(n).await {
                Ok(t) => {
                    debug!("connected on attempt {}", n);
                    return Ok(t);
                }
                Err(e) => {
                    let remaining = self.max_attempts - n;
                    if remaining == 0 {
                        warn!("connect attempt {} failed: {}, giving up", n, e);
                    }
                    else {
                        let delay = self.delay_before_retry(remaining);
                        debug!("connect attempt {} failed: {}, retrying in {:?}", n, e, delay);
                        sleep(delay).await;
                    }
                }
            }
        }
        Err(IpcError::ConnectFailed { attempts: self.max_attempts }.into())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::new()
    }
}
