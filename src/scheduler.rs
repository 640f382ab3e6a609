use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

/// Run a task on a fixed interval, forever. The first tick is delayed by a
/// multiplicative jitter so co-started workers don't thunder together; each
/// cycle runs under a timeout; failures are logged and the loop survives.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    timeout: Duration,
    first_tick_jitter: f64,
    task: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let jitter = if first_tick_jitter > 0.0 {
            interval.mul_f64(rand::rng().random_range(0.0..first_tick_jitter))
        } else {
            Duration::ZERO
        };
        tokio::time::sleep(interval + jitter).await;
        tracing::info!("{name}: worker started (interval {interval:?})");

        loop {
            let started = Instant::now();
            match tokio::time::timeout(timeout, task()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("{name}: cycle failed: {e:#}"),
                Err(_) => tracing::warn!("{name}: cycle exceeded timeout of {timeout:?}"),
            }
            let elapsed = started.elapsed();
            if elapsed > interval {
                tracing::warn!("{name}: cycle took {elapsed:?}, longer than the {interval:?} interval");
            }
            tokio::time::sleep(interval.saturating_sub(elapsed)).await;
        }
    });
}
