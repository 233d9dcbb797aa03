//! Model instance pool
//!
//! Owns every loaded instance, counts references, and guarantees that only
//! one load per model identifier is ever in flight. Loads run on their own
//! task so a caller giving up does not cancel them for everyone else.

mod handle;
mod table;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendModel, ModelBackend};
use crate::error::{Error, Result};
use crate::model::ModelDescriptor;

pub use handle::InstanceHandle;
pub use table::{InstanceSnapshot, InstanceState};

use handle::Reservation;
use table::{AcquireStep, DrainTicket, InstanceTable, SlotSignal};

/// Result of one eviction pass or a shutdown drain
#[derive(Debug, Default, Clone)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    /// Instances whose unload failed; their slots were removed regardless
    pub failed: Vec<(String, String)>,
    /// Instances skipped because they were still referenced or loading
    pub busy: Vec<String>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.failed.is_empty()
    }
}

pub(crate) struct PoolInner {
    backend: Arc<dyn ModelBackend>,
    table: Mutex<InstanceTable>,
    load_timeout: Duration,
    unload_timeout: Duration,
}

/// Shared pool of loaded model instances
#[derive(Clone)]
pub struct ModelPool {
    inner: Arc<PoolInner>,
}

impl ModelPool {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        load_timeout: Duration,
        unload_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                table: Mutex::new(InstanceTable::new()),
                load_timeout,
                unload_timeout,
            }),
        }
    }

    /// Take a reference to a Ready instance of `descriptor`, loading it if
    /// needed. Gives up after `wait` without affecting an in-flight load.
    pub async fn acquire(
        &self,
        descriptor: &Arc<ModelDescriptor>,
        wait: Duration,
    ) -> Result<InstanceHandle> {
        let deadline = Instant::now() + wait;

        loop {
            let step = self.inner.lock().begin_acquire(descriptor, Instant::now());
            let (generation, mut signal, reservation) = match step {
                AcquireStep::Ready { generation, model } => {
                    return Ok(self.handle(descriptor, generation, model));
                }
                AcquireStep::Load { generation, signal } => {
                    let reservation = Reservation::new(self.inner.clone(), &descriptor.id, generation);
                    self.inner.spawn_load(descriptor.clone(), generation);
                    (generation, signal, Some(reservation))
                }
                AcquireStep::Wait {
                    generation,
                    signal,
                    reserved,
                } => {
                    debug!("Waiting on {} (gen {})", descriptor.id, generation);
                    let reservation = reserved
                        .then(|| Reservation::new(self.inner.clone(), &descriptor.id, generation));
                    (generation, signal, reservation)
                }
            };

            // Without a reservation the slot is draining; only its removal
            // lets us start over.
            let draining = reservation.is_none();
            let outcome = tokio::time::timeout_at(deadline, async {
                match signal
                    .wait_for(|s| match s {
                        SlotSignal::Removed => true,
                        _ if draining => false,
                        SlotSignal::Pending => false,
                        _ => true,
                    })
                    .await
                {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => SlotSignal::Removed,
                }
            })
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "waiting for {} to load exceeded {:?}",
                    descriptor.id, wait
                ))
            })?;

            match outcome {
                SlotSignal::Ready => {
                    let Some(reservation) = reservation else {
                        continue;
                    };
                    let model = self.inner.lock().model_of(&descriptor.id, generation);
                    if let Some(model) = model {
                        reservation.disarm();
                        return Ok(self.handle(descriptor, generation, model));
                    }
                }
                SlotSignal::Failed(reason) => {
                    if let Some(reservation) = reservation {
                        reservation.disarm();
                    }
                    return Err(Error::ModelLoad {
                        model: descriptor.id.clone(),
                        reason: reason.to_string(),
                    });
                }
                SlotSignal::Removed | SlotSignal::Pending => {
                    if let Some(reservation) = reservation {
                        reservation.disarm();
                    }
                }
            }
        }
    }

    /// Give a handle back. Never unloads synchronously.
    pub fn release(&self, mut handle: InstanceHandle) -> Result<()> {
        handle.mark_released();
        self.inner
            .release_reference(handle.id(), handle.generation())
    }

    /// Unload an idle instance now
    pub async fn unload(&self, id: &str) -> Result<()> {
        let ticket = self.inner.lock().drain_idle(id)?;
        self.inner.drain(ticket).await
    }

    /// Unload every idle instance whose TTL has elapsed
    pub async fn evict_expired(&self) -> EvictionReport {
        let tickets = self.inner.lock().collect_expired(Instant::now());
        self.inner.drain_many(tickets).await
    }

    /// Unload every idle instance, for process shutdown
    pub async fn shutdown(&self) -> EvictionReport {
        let (tickets, busy) = self.inner.lock().drain_all_idle();
        for id in &busy {
            warn!("Model {} still in use at shutdown; leaving it to the backend", id);
        }
        let mut report = self.inner.drain_many(tickets).await;
        report.busy = busy;
        report
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.inner.lock().snapshot(Instant::now())
    }

    pub fn instance(&self, id: &str) -> Option<InstanceSnapshot> {
        self.inner.lock().get(id, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(
        &self,
        descriptor: &Arc<ModelDescriptor>,
        generation: u64,
        model: BackendModel,
    ) -> InstanceHandle {
        InstanceHandle::new(self.inner.clone(), descriptor.clone(), generation, model)
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, InstanceTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn release_reference(self: &Arc<Self>, id: &str, generation: u64) -> Result<()> {
        let ticket = self.lock().release(id, generation, Instant::now())?;
        if let Some(ticket) = ticket {
            debug!("{} idle with immediate TTL; unloading", id);
            self.spawn_drain(ticket);
        }
        Ok(())
    }

    fn spawn_load(self: &Arc<Self>, descriptor: Arc<ModelDescriptor>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            info!(
                "Loading model {} ({}) from {:?}",
                descriptor.id, descriptor.kind, descriptor.location
            );
            let started = Instant::now();

            let load = tokio::spawn({
                let backend = inner.backend.clone();
                let descriptor = descriptor.clone();
                async move { backend.load(&descriptor).await }
            });

            let result = match tokio::time::timeout(inner.load_timeout, load).await {
                Ok(Ok(Ok(model))) => Ok(model),
                Ok(Ok(Err(Error::ModelLoad { reason, .. }))) => Err(reason),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(join_error)) => Err(format!("load task failed: {join_error}")),
                Err(_) => Err(format!(
                    "load did not finish within {:?}",
                    inner.load_timeout
                )),
            };

            match &result {
                Ok(_) => info!(
                    "Model {} loaded in {:.2}s",
                    descriptor.id,
                    started.elapsed().as_secs_f64()
                ),
                Err(reason) => error!("Failed to load model {}: {}", descriptor.id, reason),
            }

            let ticket = inner
                .lock()
                .finish_load(&descriptor.id, generation, result, Instant::now());
            if let Some(ticket) = ticket {
                let _ = inner.drain(ticket).await;
            }
        });
    }

    fn spawn_drain(self: &Arc<Self>, ticket: DrainTicket) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                runtime.spawn(async move {
                    let _ = inner.drain(ticket).await;
                });
            }
            Err(_) => {
                warn!(
                    "No runtime to unload {}; removing slot without unloading",
                    ticket.descriptor.id
                );
                self.lock()
                    .finish_drain(&ticket.descriptor.id, ticket.generation);
            }
        }
    }

    /// Unload a Draining instance and remove its slot, even on failure
    async fn drain(&self, ticket: DrainTicket) -> Result<()> {
        let DrainTicket {
            descriptor,
            generation,
            model,
        } = ticket;

        let outcome = tokio::time::timeout(
            self.unload_timeout,
            self.backend.unload(&descriptor, model),
        )
        .await;

        let result = match outcome {
            Ok(Ok(())) => {
                info!("Unloaded model {}", descriptor.id);
                Ok(())
            }
            Ok(Err(e)) => {
                error!(
                    "Unload of {} failed; removing slot anyway: {}",
                    descriptor.id, e
                );
                Err(match e {
                    e @ Error::ModelUnload { .. } => e,
                    other => Error::ModelUnload {
                        model: descriptor.id.clone(),
                        reason: other.to_string(),
                    },
                })
            }
            Err(_) => {
                warn!(
                    "Unload of {} did not finish within {:?}; removing slot",
                    descriptor.id, self.unload_timeout
                );
                Err(Error::ModelUnload {
                    model: descriptor.id.clone(),
                    reason: format!("timed out after {:?}", self.unload_timeout),
                })
            }
        };

        self.lock().finish_drain(&descriptor.id, generation);
        result
    }

    async fn drain_many(&self, tickets: Vec<DrainTicket>) -> EvictionReport {
        let ids: Vec<String> = tickets.iter().map(|t| t.descriptor.id.clone()).collect();
        let results = futures::future::join_all(tickets.into_iter().map(|t| self.drain(t))).await;

        let mut report = EvictionReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => report.evicted.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CapabilityKind, Ttl};
    use crate::testing::FakeBackend;
    use tokio_test::{assert_err, assert_ok};

    fn pool(backend: &Arc<FakeBackend>) -> ModelPool {
        ModelPool::new(
            backend.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    fn descriptor(id: &str, ttl: Ttl) -> Arc<ModelDescriptor> {
        Arc::new(ModelDescriptor::new(id, CapabilityKind::Stt, id, ttl))
    }

    const WAIT: Duration = Duration::from_secs(10);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_loads_once() {
        let backend = Arc::new(FakeBackend::new().with_load_delay(Duration::from_millis(200)));
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handles = futures::future::join_all((0..16).map(|_| pool.acquire(&d, WAIT))).await;
        let handles: Vec<_> = handles.into_iter().map(|h| h.unwrap()).collect();

        assert_eq!(backend.loads(), 1);
        assert!(handles.iter().all(|h| h.generation() == handles[0].generation()));
        assert_eq!(pool.instance("whisper").unwrap().ref_count, 16);

        for handle in handles {
            pool.release(handle).unwrap();
        }
        let snapshot = pool.instance("whisper").unwrap();
        assert_eq!(snapshot.ref_count, 0);
        assert_eq!(snapshot.state, InstanceState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_shares_load_failure() {
        let backend = Arc::new(
            FakeBackend::new()
                .with_load_delay(Duration::from_millis(50))
                .failing_loads("whisper"),
        );
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let results = futures::future::join_all((0..8).map(|_| pool.acquire(&d, WAIT))).await;

        assert_eq!(backend.loads(), 1);
        for result in results {
            match result {
                Err(Error::ModelLoad { model, reason }) => {
                    assert_eq!(model, "whisper");
                    assert!(reason.contains("weights missing"));
                }
                other => panic!("expected load error, got {:?}", other.map(|_| ())),
            }
        }
        assert!(pool.is_empty());

        // A later call makes its own attempt
        assert_err!(pool.acquire(&d, WAIT).await);
        assert_eq!(backend.loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_timeout_does_not_cancel_load() {
        let backend = Arc::new(FakeBackend::new().with_load_delay(Duration::from_secs(5)));
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let impatient = pool.acquire(&d, Duration::from_secs(1)).await;
        assert!(matches!(impatient, Err(Error::Timeout(_))));
        assert_eq!(pool.instance("whisper").unwrap().state, InstanceState::Loading);
        assert_eq!(pool.instance("whisper").unwrap().ref_count, 0);

        let handle = assert_ok!(pool.acquire(&d, WAIT).await);
        assert_eq!(backend.loads(), 1);
        assert_eq!(pool.instance("whisper").unwrap().ref_count, 1);
        pool.release(handle).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_load_is_bounded() {
        let backend = Arc::new(FakeBackend::new().with_load_delay(Duration::from_secs(3600)));
        let pool = ModelPool::new(backend.clone(), Duration::from_secs(2), Duration::from_secs(1));
        let d = descriptor("whisper", Ttl::Never);

        let err = pool.acquire(&d, WAIT).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad { ref reason, .. } if reason.contains("did not finish")));
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_is_released() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        assert_eq!(pool.instance("whisper").unwrap().ref_count, 1);
        drop(handle);
        assert_eq!(pool.instance("whisper").unwrap().ref_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_ttl_unloads_on_release() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool(&backend);
        let d = descriptor("piper", Ttl::Immediate);

        let first = pool.acquire(&d, WAIT).await.unwrap();
        let second = pool.acquire(&d, WAIT).await.unwrap();
        pool.release(first).unwrap();
        settle().await;
        assert!(pool.instance("piper").is_some());

        pool.release(second).unwrap();
        settle().await;
        assert!(pool.instance("piper").is_none());
        assert_eq!(backend.unloads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_respects_ttl_and_refs() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool(&backend);
        let stt = descriptor("whisper", Ttl::After(Duration::from_secs(60)));
        let vad = descriptor("silero", Ttl::Never);

        let held = pool.acquire(&stt, WAIT).await.unwrap();
        let idle = pool.acquire(&vad, WAIT).await.unwrap();
        pool.release(idle).unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(pool.evict_expired().await.is_empty());

        pool.release(held).unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(pool.evict_expired().await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = pool.evict_expired().await;
        assert_eq!(report.evicted, vec!["whisper".to_string()]);
        assert!(pool.instance("silero").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_unload_still_frees_slot() {
        let backend = Arc::new(FakeBackend::new().failing_unloads("whisper"));
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        pool.release(handle).unwrap();

        let err = pool.unload("whisper").await.unwrap_err();
        assert!(matches!(err, Error::ModelUnload { .. }));
        assert!(pool.is_empty());

        // The identifier can be loaded again
        let handle = pool.acquire(&d, WAIT).await.unwrap();
        assert_eq!(backend.loads(), 2);
        pool.release(handle).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_unload_is_bounded() {
        let backend = Arc::new(FakeBackend::new().with_unload_delay(Duration::from_secs(3600)));
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        pool.release(handle).unwrap();

        let report = pool.shutdown().await;
        assert_eq!(report.failed.len(), 1);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unload_refuses_busy_model() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        assert!(matches!(pool.unload("whisper").await, Err(Error::ModelBusy(_))));
        assert!(matches!(pool.unload("other").await, Err(Error::ModelNotLoaded(_))));

        let report = pool.shutdown().await;
        assert_eq!(report.busy, vec!["whisper".to_string()]);
        pool.release(handle).unwrap();
        pool.unload("whisper").await.unwrap();
        assert_eq!(backend.unloads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_during_drain_reloads() {
        let backend = Arc::new(FakeBackend::new().with_unload_delay(Duration::from_millis(500)));
        let pool = pool(&backend);
        let d = descriptor("whisper", Ttl::Never);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        let first_generation = handle.generation();
        pool.release(handle).unwrap();

        let unloading = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.unload("whisper").await })
        };
        settle().await;
        assert_eq!(pool.instance("whisper").unwrap().state, InstanceState::Draining);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        assert!(handle.generation() > first_generation);
        assert_eq!(backend.loads(), 2);
        unloading.await.unwrap().unwrap();
        pool.release(handle).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_blocks_until_immediate_drain_finishes() {
        let backend = Arc::new(FakeBackend::new().with_unload_delay(Duration::from_millis(200)));
        let pool = pool(&backend);
        let d = descriptor("piper", Ttl::Immediate);

        let handle = pool.acquire(&d, WAIT).await.unwrap();
        let first_generation = handle.generation();
        pool.release(handle).unwrap();
        settle().await;
        assert_eq!(pool.instance("piper").unwrap().state, InstanceState::Draining);

        // The waiter parks on the slot signal; time only moves when every
        // task is idle, so a spinning acquire would never get here.
        let started = Instant::now();
        let handle = pool.acquire(&d, WAIT).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(190));
        assert!(handle.generation() > first_generation);
        assert_eq!(backend.unloads(), 1);
        assert_eq!(backend.loads(), 2);
        pool.release(handle).unwrap();
    }
}
