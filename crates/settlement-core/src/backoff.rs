use log::{debug, warn};
use rand::Rng;
use std::cmp;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff for HTTP requests towards the connector.
///
/// The default parameters are the retry behavior prescribed for settlement
/// engines, see
/// <https://github.com/interledger/rfcs/blob/master/0038-settlement-engines/0038-settlement-engines.md#retry-behavior>
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(6),
            max_elapsed_time: Duration::from_secs(900),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl ExponentialBackoff {
    /// Runs `operation` until it succeeds, sleeping between attempts. Gives
    /// up with the last error once the next delay would exceed the maximum
    /// elapsed time.
    pub async fn retry<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = tokio::time::Instant::now();
        let mut interval = self.initial_interval;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.randomize(interval);
                    if started.elapsed() + delay > self.max_elapsed_time {
                        warn!("Giving up retrying after {:?}", started.elapsed());
                        return Err(err);
                    }
                    debug!("Retrying in {:?}", delay);
                    sleep(delay).await;
                    interval = cmp::min(interval.mul_f64(self.multiplier), self.max_interval);
                }
            }
        }
    }

    fn randomize(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }
        let delta = interval.mul_f64(self.randomization_factor);
        let span = delta.as_millis() as u64 * 2;
        if span == 0 {
            return interval;
        }
        (interval - delta) + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            max_elapsed_time: Duration::from_millis(200),
            multiplier: 1.5,
            randomization_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = fast_backoff()
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(42)
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = fast_backoff()
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err("try again")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_elapsed_time() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result: Result<u32, &str> = fast_backoff()
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("permanently down")
                }
            })
            .await;
        assert_eq!(result, Err("permanently down"));
        // delays grow as 5, 7, 11, 16, 20, 20... ms so the budget of 200ms
        // bounds the number of attempts well below 20
        assert!(attempts.load(Ordering::SeqCst) < 20);
    }
}
