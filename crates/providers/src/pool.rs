//! Warm provider pool
//!
//! A bounded set of initialized instances per `(kind, name)`. `acquire`
//! reuses an idle instance, constructs up to `max_size`, and otherwise blocks
//! until a release. A sweeper trims idle instances past `min_size` once they
//! outlive `max_idle`, and a health ticker closes instances that fail their
//! check.

use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use edgevoice_core::ProviderInstance;

use crate::ProviderError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool sizing and cadence.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Idle instances older than this are trimmed past `min_size`
    pub max_idle: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            max_idle: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(300),
            health_check_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&edgevoice_config::PoolSettings> for PoolConfig {
    fn from(s: &edgevoice_config::PoolSettings) -> Self {
        Self {
            min_size: s.min_size,
            max_size: s.max_size,
            max_idle: Duration::from_secs(s.max_idle_secs),
            health_check_interval: Duration::from_secs(s.health_check_interval_secs),
            health_check_timeout: Duration::from_secs(s.health_check_timeout_secs),
        }
    }
}

/// Builds a fresh, uninitialized instance.
pub type InstanceFactory =
    Arc<dyn Fn() -> Result<ProviderInstance, ProviderError> + Send + Sync>;

struct IdleEntry {
    instance: ProviderInstance,
    since: Instant,
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<IdleEntry>,
    closed: bool,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

pub struct ProviderPool {
    label: String,
    factory: InstanceFactory,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    permits: Arc<Semaphore>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl ProviderPool {
    pub fn new(label: impl Into<String>, factory: InstanceFactory, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            label: label.into(),
            factory,
            permits: Arc::new(Semaphore::new(config.max_size)),
            config,
            inner: Mutex::new(PoolInner::default()),
            shutdown_tx: Mutex::new(None),
        });
        pool.start_maintenance();
        pool
    }

    fn start_maintenance(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            sweep.tick().await;
            let mut health = tokio::time::interval(pool.config.health_check_interval);
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            health.tick().await;

            loop {
                tokio::select! {
                    _ = sweep.tick() => pool.sweep_idle().await,
                    _ = health.tick() => pool.health_pass().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Take an instance: idle first, then construct, then wait for a release.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledProvider, ProviderError> {
        if self.inner.lock().closed {
            return Err(ProviderError::Closed(self.label.clone()));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Closed(self.label.clone()))?;

        if self.inner.lock().closed {
            return Err(ProviderError::Closed(self.label.clone()));
        }

        let reused = self.inner.lock().idle.pop().map(|e| e.instance);
        let instance = match reused {
            Some(instance) => instance,
            None => {
                let instance = (self.factory)()?;
                instance.initialize().await.map_err(|e| {
                    ProviderError::Factory(format!("{}: initialize failed: {e}", self.label))
                })?;
                tracing::debug!(pool = %self.label, "constructed pool instance");
                instance
            }
        };

        Ok(PooledProvider {
            instance: Some(instance),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Called from the guard: reset and return the instance, or discard it if
    /// the pool is full or closed.
    fn release(self: &Arc<Self>, instance: ProviderInstance) {
        instance.reset();
        let mut inner = self.inner.lock();
        if inner.closed || inner.idle.len() >= self.config.max_size {
            drop(inner);
            self.close_instance(instance);
            return;
        }
        inner.idle.push(IdleEntry {
            instance,
            since: Instant::now(),
        });
    }

    fn close_instance(&self, instance: ProviderInstance) {
        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = instance.close().await {
                tracing::warn!(pool = %label, error = %e, "instance close failed");
            }
        });
    }

    /// Trim idle instances past `min_size` that have idled beyond `max_idle`.
    async fn sweep_idle(&self) {
        let mut trimmed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let max_idle = self.config.max_idle;
            let min = self.config.min_size;
            // Oldest entries sit at the front.
            while inner.idle.len() > min {
                match inner.idle.first() {
                    Some(entry) if entry.since.elapsed() > max_idle => {
                        trimmed.push(inner.idle.remove(0).instance);
                    }
                    _ => break,
                }
            }
        }
        if !trimmed.is_empty() {
            tracing::debug!(pool = %self.label, trimmed = trimmed.len(), "swept idle instances");
        }
        for instance in trimmed {
            self.close_instance(instance);
        }
    }

    /// Health-check idle instances; failures are closed and removed.
    async fn health_pass(&self) {
        let candidates: Vec<IdleEntry> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.idle)
        };

        let mut survivors = Vec::with_capacity(candidates.len());
        for entry in candidates {
            let check = tokio::time::timeout(
                self.config.health_check_timeout,
                entry.instance.health_check(),
            )
            .await;
            match check {
                Ok(Ok(())) => survivors.push(entry),
                Ok(Err(e)) => {
                    tracing::warn!(pool = %self.label, error = %e, "health check failed, closing instance");
                    self.close_instance(entry.instance);
                }
                Err(_) => {
                    tracing::warn!(pool = %self.label, "health check timed out, closing instance");
                    self.close_instance(entry.instance);
                }
            }
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            for entry in survivors {
                self.close_instance(entry.instance);
            }
            return;
        }
        // Releases that happened mid-pass come after the survivors.
        survivors.append(&mut inner.idle);
        inner.idle = survivors;
    }

    /// Preload instances so the first conversation pays no cold start.
    pub async fn warm_up(self: &Arc<Self>, count: usize) -> Result<(), ProviderError> {
        let mut guards = Vec::with_capacity(count);
        for _ in 0..count.min(self.config.max_size) {
            guards.push(self.acquire().await?);
        }
        // Dropping the guards parks the instances idle.
        drop(guards);
        tracing::info!(pool = %self.label, count, "pool warmed");
        Ok(())
    }

    /// Drain and close everything; later acquires fail with `Closed`, and
    /// acquires already parked on the semaphore wake with the same error.
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        self.permits.close();
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        for entry in idle {
            if let Err(e) = entry.instance.close().await {
                tracing::warn!(pool = %self.label, error = %e, "close failed during drain");
            }
        }
        tracing::info!(pool = %self.label, "pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            idle: inner.idle.len(),
            in_use: self.config.max_size - self.permits.available_permits(),
            max_size: self.config.max_size,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// RAII guard over an acquired instance; dropping it releases back to the
/// pool.
pub struct PooledProvider {
    instance: Option<ProviderInstance>,
    pool: Arc<ProviderPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledProvider {
    type Target = ProviderInstance;

    fn deref(&self) -> &Self::Target {
        self.instance.as_ref().expect("instance taken")
    }
}

impl Drop for PooledProvider {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edgevoice_core::{AudioFrame, Provider, ProviderKind, VadEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVad {
        live: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingVad {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Vad
        }

        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        async fn close(&self) -> edgevoice_core::Result<()> {
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl VadEngine for CountingVad {
        fn process_frame(&self, _frame: &AudioFrame) -> edgevoice_core::Result<bool> {
            Ok(false)
        }
    }

    fn counting_pool(max: usize) -> (Arc<ProviderPool>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let live2 = live.clone();
        let resets2 = resets.clone();
        let factory: InstanceFactory = Arc::new(move || {
            live2.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderInstance::Vad(Arc::new(CountingVad {
                live: live2.clone(),
                resets: resets2.clone(),
            })))
        });
        let pool = ProviderPool::new(
            "vad/test",
            factory,
            PoolConfig {
                min_size: 1,
                max_size: max,
                ..Default::default()
            },
        );
        (pool, live, resets)
    }

    #[tokio::test]
    async fn acquire_reuses_idle() {
        let (pool, live, resets) = counting_pool(2);

        let guard = pool.acquire().await.unwrap();
        drop(guard);
        let _guard = pool.acquire().await.unwrap();

        assert_eq!(live.load(Ordering::SeqCst), 1, "second acquire reuses");
        assert_eq!(resets.load(Ordering::SeqCst), 1, "release resets");
    }

    #[tokio::test]
    async fn third_acquire_blocks_until_release() {
        let (pool, _live, _) = counting_pool(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "must block at max capacity");

        drop(a);
        let c = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should unblock")
            .unwrap()
            .unwrap();
        drop(b);
        drop(c);

        let stats = pool.stats();
        assert!(stats.idle <= stats.max_size);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn instance_count_is_conserved() {
        let (pool, live, _) = counting_pool(2);
        for _ in 0..10 {
            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            drop(a);
            drop(b);
        }
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let (pool, live, _) = counting_pool(2);
        let guard = pool.acquire().await.unwrap();
        drop(guard);

        pool.close().await;
        assert!(matches!(
            pool.acquire().await,
            Err(ProviderError::Closed(_))
        ));

        // Drained instance is closed.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn warm_up_preloads_idle_instances() {
        let (pool, live, _) = counting_pool(4);
        pool.warm_up(2).await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(pool.stats().in_use, 0);
    }
}
