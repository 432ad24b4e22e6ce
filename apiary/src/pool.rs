use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::handler::JobHandler;
use crate::metrics;
use crate::shutdown::StopToken;
use crate::tenant::TenantId;

/// Number of jobs the intake buffer holds before submissions are rejected.
pub const INTAKE_CAPACITY: usize = 100;

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Reason a submission was rejected.
///
/// The caller decides what to do with a rejection; the tenant runtime turns
/// either variant into a dead-letter nack.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SubmitError {
    #[error("intake queue is full")]
    QueueFull,
    #[error("pool is draining")]
    Draining,
}

/// Fixed-intake worker pool with a dynamically resizable worker count.
///
/// Jobs enter through a bounded channel of capacity [`INTAKE_CAPACITY`] and
/// are consumed by N concurrent worker tasks sharing the receiving end. Each
/// worker carries its own [`StopToken`] in addition to the pool-wide one, so
/// a shrink retires individual workers after their in-hand job while the
/// rest keep draining the intake.
pub struct WorkerPool {
    tenant_id: TenantId,
    handler: Arc<dyn JobHandler>,
    intake_tx: mpsc::Sender<Vec<u8>>,
    intake_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    state: AtomicU8,
    pool_stop: StopToken,
    workers: Mutex<Vec<Worker>>,
    /// Workers retired by a shrink; still awaited on stop so their in-flight
    /// jobs are observed by the drain.
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
}

struct Worker {
    stop: StopToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let worker_count = self
            .workers
            .try_lock()
            .map(|workers| workers.len())
            .unwrap_or_default();
        f.debug_struct("WorkerPool")
            .field("tenant_id", &self.tenant_id)
            .field("worker_count", &worker_count)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with the given number of workers, all running.
    pub fn new(
        tenant_id: TenantId,
        workers: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let intake_rx = Arc::new(Mutex::new(intake_rx));
        let pool_stop = StopToken::new();

        let initial: Vec<Worker> = (0..workers)
            .map(|index| {
                spawn_worker(
                    tenant_id,
                    index,
                    Arc::clone(&handler),
                    Arc::clone(&intake_rx),
                    pool_stop.clone(),
                )
            })
            .collect();

        Self {
            tenant_id,
            handler,
            intake_tx,
            intake_rx,
            state: AtomicU8::new(STATE_RUNNING),
            pool_stop,
            workers: Mutex::new(initial),
            retired: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(workers),
        }
    }

    /// Submit a job without blocking.
    ///
    /// Fails fast with [`SubmitError::QueueFull`] when the intake is
    /// saturated and with [`SubmitError::Draining`] once `stop` has begun.
    pub fn submit(&self, job: Vec<u8>) -> Result<(), SubmitError> {
        if self.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(SubmitError::Draining);
        }
        self.intake_tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Draining,
        })
    }

    /// Number of workers currently attached to the intake.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Adjust the worker count to `target`.
    ///
    /// Growth spawns new workers immediately. Shrink signals the excess
    /// workers to exit after any in-hand job; the count may transiently
    /// exceed `target` until those jobs finish. Accepted jobs are never
    /// dropped by a resize.
    pub async fn resize(&self, target: usize) {
        let mut workers = self.workers.lock().await;
        let current = workers.len();

        if target > current {
            for _ in current..target {
                let index = self.next_worker.fetch_add(1, Ordering::SeqCst);
                workers.push(spawn_worker(
                    self.tenant_id,
                    index,
                    Arc::clone(&self.handler),
                    Arc::clone(&self.intake_rx),
                    self.pool_stop.clone(),
                ));
            }
            tracing::info!(
                tenant_id = %self.tenant_id,
                from = current,
                to = target,
                "grew worker pool"
            );
        } else if target < current {
            let mut retired = self.retired.lock().await;
            for worker in workers.drain(target..) {
                worker.stop.stop();
                retired.push(worker.handle);
            }
            tracing::info!(
                tenant_id = %self.tenant_id,
                from = current,
                to = target,
                "shrinking worker pool"
            );
        }
    }

    /// Stop the pool and wait for every in-flight handler to return.
    ///
    /// New submissions are rejected as soon as stop begins. Jobs still
    /// sitting in the intake are discarded; only in-hand jobs complete.
    /// Idempotent.
    pub async fn stop(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.pool_stop.stop();

        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        let retired = {
            let mut guard = self.retired.lock().await;
            std::mem::take(&mut *guard)
        };

        for worker in workers {
            if let Err(err) = worker.handle.await {
                tracing::warn!("worker task failed: {:?}", err);
            }
        }
        for handle in retired {
            if let Err(err) = handle.await {
                tracing::warn!("retired worker task failed: {:?}", err);
            }
        }

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        tracing::debug!(tenant_id = %self.tenant_id, "worker pool stopped");
    }
}

fn spawn_worker(
    tenant_id: TenantId,
    index: usize,
    handler: Arc<dyn JobHandler>,
    intake: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    pool_stop: StopToken,
) -> Worker {
    let stop = StopToken::new();
    let worker_stop = stop.clone();
    let worker_id = format!("{}-w{}", tenant_id, index);

    let handle = tokio::spawn(async move {
        worker_loop(
            worker_id,
            tenant_id,
            handler,
            intake,
            pool_stop,
            worker_stop,
        )
        .await;
    });

    Worker { stop, handle }
}

async fn worker_loop(
    worker_id: String,
    tenant_id: TenantId,
    handler: Arc<dyn JobHandler>,
    intake: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    pool_stop: StopToken,
    worker_stop: StopToken,
) {
    loop {
        tokio::select! {
            _ = pool_stop.stopped() => break,
            _ = worker_stop.stopped() => break,
            job = next_job(&intake) => {
                let Some(payload) = job else { break };
                run_job(&worker_id, tenant_id, handler.as_ref(), payload)
                    .await;
            }
        }
    }
    tracing::debug!("worker {} exited", worker_id);
}

async fn next_job(
    intake: &Mutex<mpsc::Receiver<Vec<u8>>>,
) -> Option<Vec<u8>> {
    intake.lock().await.recv().await
}

async fn run_job(
    worker_id: &str,
    tenant_id: TenantId,
    handler: &dyn JobHandler,
    payload: Vec<u8>,
) {
    // A panicking handler must not take the worker down with it.
    let outcome = std::panic::AssertUnwindSafe(
        handler.handle(tenant_id, &payload),
    )
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => {
            metrics::record_message_processed(&tenant_id.to_string(), "ok");
        }
        Ok(Err(err)) => {
            tracing::warn!(
                tenant_id = %tenant_id,
                worker = worker_id,
                "job failed: {err:#}"
            );
            metrics::record_message_processed(
                &tenant_id.to_string(),
                "failed",
            );
        }
        Err(_) => {
            tracing::error!(
                tenant_id = %tenant_id,
                worker = worker_id,
                "job handler panicked"
            );
            metrics::record_message_processed(
                &tenant_id.to_string(),
                "failed",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    struct RecordingHandler {
        seen: Mutex<Vec<Vec<u8>>>,
        delay: Option<Duration>,
        completed: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                delay: None,
                completed: AtomicUsize::new(0),
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new()
            }
        }

        fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(
            &self,
            _tenant_id: TenantId,
            payload: &[u8],
        ) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().await.push(payload.to_vec());
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(
            &self,
            _tenant_id: TenantId,
            payload: &[u8],
        ) -> anyhow::Result<()> {
            if payload == b"boom" {
                panic!("handler exploded");
            }
            Ok(())
        }
    }

    async fn wait_for_completed(handler: &RecordingHandler, count: usize) {
        timeout(Duration::from_secs(5), async {
            while handler.completed() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not complete in time");
    }

    #[tokio::test]
    async fn submitted_jobs_are_processed() {
        let handler = Arc::new(RecordingHandler::new());
        let pool = WorkerPool::new(TenantId::new(), 3, handler.clone());

        for i in 0..20u8 {
            pool.submit(vec![i]).expect("submit");
        }

        wait_for_completed(&handler, 20).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn saturated_intake_rejects_submissions() {
        // No workers, so nothing drains the intake.
        let pool = WorkerPool::new(
            TenantId::new(),
            0,
            Arc::new(RecordingHandler::new()),
        );

        for i in 0..INTAKE_CAPACITY {
            pool.submit(vec![i as u8]).expect("within capacity");
        }
        assert_eq!(pool.submit(vec![0]), Err(SubmitError::QueueFull));

        pool.stop().await;
    }

    #[tokio::test]
    async fn resize_grows_and_shrinks_worker_count() {
        let handler = Arc::new(RecordingHandler::new());
        let pool = WorkerPool::new(TenantId::new(), 2, handler.clone());
        assert_eq!(pool.worker_count().await, 2);

        pool.resize(5).await;
        assert_eq!(pool.worker_count().await, 5);

        pool.resize(1).await;
        assert_eq!(pool.worker_count().await, 1);

        // The surviving worker still drains the intake.
        for i in 0..10u8 {
            pool.submit(vec![i]).expect("submit");
        }
        wait_for_completed(&handler, 10).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn submissions_survive_a_resize() {
        let handler =
            Arc::new(RecordingHandler::with_delay(Duration::from_millis(5)));
        let pool = WorkerPool::new(TenantId::new(), 4, handler.clone());

        let mut submitted = 0;
        for i in 0..30u8 {
            if i == 10 {
                pool.resize(8).await;
            }
            if i == 20 {
                pool.resize(2).await;
            }
            pool.submit(vec![i]).expect("submit during resize");
            submitted += 1;
        }

        wait_for_completed(&handler, submitted).await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_pool() {
        let pool =
            WorkerPool::new(TenantId::new(), 1, Arc::new(PanickingHandler));

        pool.submit(b"boom".to_vec()).expect("submit");
        pool.submit(b"fine".to_vec()).expect("submit");

        // Give the single worker time to survive the panic and move on.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.worker_count().await, 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_new_submissions() {
        let pool = WorkerPool::new(
            TenantId::new(),
            1,
            Arc::new(RecordingHandler::new()),
        );
        pool.stop().await;
        assert_eq!(pool.submit(vec![1]), Err(SubmitError::Draining));
        // Idempotent.
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let handler = Arc::new(RecordingHandler::with_delay(
            Duration::from_millis(200),
        ));
        let pool = WorkerPool::new(TenantId::new(), 1, handler.clone());

        pool.submit(vec![1]).expect("submit");
        // Let the worker pick the job up before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.stop().await;
        assert_eq!(handler.completed(), 1);
    }

    #[tokio::test]
    async fn single_worker_preserves_submission_order() {
        let handler = Arc::new(RecordingHandler::new());
        let pool = WorkerPool::new(TenantId::new(), 1, handler.clone());

        for i in 0..10u8 {
            pool.submit(vec![i]).expect("submit");
        }
        wait_for_completed(&handler, 10).await;

        let seen = handler.seen.lock().await.clone();
        let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
        assert_eq!(seen, expected);
        pool.stop().await;
    }

    #[tokio::test]
    async fn retired_workers_finish_their_job_before_exiting() {
        let handler = Arc::new(RecordingHandler::with_delay(
            Duration::from_millis(150),
        ));
        let pool = WorkerPool::new(TenantId::new(), 2, handler.clone());

        pool.submit(vec![1]).expect("submit");
        pool.submit(vec![2]).expect("submit");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both workers hold a job; shrinking to zero must not abort them.
        pool.resize(0).await;
        pool.stop().await;

        assert_eq!(handler.completed(), 2);
    }
}
