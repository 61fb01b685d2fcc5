//! The per-backend write pipeline.
//!
//! One worker task per backend multiplexes three event sources: the write
//! channel, a single-shot flush timer, and the rewrite tick. The worker
//! itself never touches the network; flushes are handed to a bounded task
//! pool so the channel keeps draining while a backend is slow.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use spill::SpillQueue;
use std::{
    path::Path,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
    time::Sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{compress, ClientError, HttpBackend, QueryRequest, QueryResult, WriteError},
    config::BackendConfig,
    BackendApi,
};

/// Producers enqueue single lines; the worker batches them. The channel is
/// intentionally shallow so a dead worker surfaces as backpressure rather
/// than unbounded memory growth.
const WRITE_CHANNEL_CAPACITY: usize = 16;

/// Errors creating a backend aggregator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unable to create http client: {0}")]
    Client(#[from] crate::client::ClientError),

    #[error("unable to open spill queue: {0}")]
    Spill(#[from] spill::Error),
}

/// The per-backend facade: HTTP client + spill queue + batching worker.
#[derive(Debug)]
pub struct Backend {
    name: String,
    client: Arc<HttpBackend>,
    tx: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Opens the spill queue under `data_dir`, builds the HTTP client and
    /// starts the worker task.
    pub fn new(
        name: &str,
        cfg: &BackendConfig,
        data_dir: impl AsRef<Path>,
    ) -> Result<Arc<Self>, BackendError> {
        let client = HttpBackend::new(name, cfg)?;
        let queue = Arc::new(Mutex::new(SpillQueue::open(data_dir, name)?));
        let (tx, rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let worker = WriteWorker {
            name: name.to_owned(),
            rx,
            client: Arc::clone(&client),
            queue,
            shutdown: shutdown.clone(),
            flush_size: cfg.flush_size,
            flush_time: Duration::from_millis(cfg.flush_time),
            rewrite_interval: Duration::from_millis(cfg.rewrite_interval),
            pool: Arc::new(Semaphore::new(cfg.conn_pool_size)),
            pool_size: cfg.conn_pool_size as u32,
            rewrite_running: Arc::new(AtomicBool::new(false)),
            rewrite_handle: Arc::new(Mutex::new(None)),
        };
        let handle = tokio::spawn(worker.run());

        Ok(Arc::new(Self {
            name: name.to_owned(),
            client,
            tx,
            shutdown,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<HttpBackend> {
        &self.client
    }

    /// Enqueues one line for batching. Blocks only when the shallow write
    /// channel is full.
    pub async fn write(&self, line: Bytes) -> Result<(), WriteError> {
        self.tx.send(line).await.map_err(|_| WriteError::Closed)
    }

    /// Drains the buffer, waits for in-flight flushes, then closes the HTTP
    /// client and the spill queue.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.await.is_err() {
                error!(backend = %self.name, "write worker panicked during shutdown");
            }
        }
    }
}

#[async_trait::async_trait]
impl BackendApi for Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        self.client.url()
    }

    fn target_db(&self) -> &str {
        self.client.target_db()
    }

    fn is_active(&self) -> bool {
        self.client.is_active()
    }

    fn is_write_only(&self) -> bool {
        self.client.is_write_only()
    }

    async fn write(&self, line: Bytes) -> Result<(), WriteError> {
        self.tx.send(line).await.map_err(|_| WriteError::Closed)
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        self.client.query(req).await
    }

    async fn query_sink(&self, req: &QueryRequest) -> Result<QueryResult, ClientError> {
        self.client.query_sink(req).await
    }

    async fn close(&self) {
        Self::close(self).await
    }
}

struct WriteWorker {
    name: String,
    rx: mpsc::Receiver<Bytes>,
    client: Arc<HttpBackend>,
    queue: Arc<Mutex<SpillQueue>>,
    shutdown: CancellationToken,
    flush_size: usize,
    flush_time: Duration,
    rewrite_interval: Duration,
    pool: Arc<Semaphore>,
    pool_size: u32,
    rewrite_running: Arc<AtomicBool>,
    rewrite_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WriteWorker {
    async fn run(mut self) {
        let mut buffer = BytesMut::new();
        let mut counter = 0usize;
        let mut flush_timer: Option<Pin<Box<Sleep>>> = None;
        let mut rewrite_tick = tokio::time::interval(self.rewrite_interval);
        rewrite_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                maybe_line = self.rx.recv() => match maybe_line {
                    Some(line) => self.append(&mut buffer, &mut counter, &mut flush_timer, line),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
                _ = async { flush_timer.as_mut().expect("timer is armed").await },
                        if flush_timer.is_some() => {
                    flush_timer = None;
                    self.flush(&mut buffer, &mut counter);
                }
                _ = rewrite_tick.tick() => self.idle(),
            }
        }

        // Drain whatever producers managed to enqueue before the channel
        // closed, then flush the residue.
        while let Ok(line) = self.rx.try_recv() {
            self.append(&mut buffer, &mut counter, &mut flush_timer, line);
        }
        self.flush(&mut buffer, &mut counter);

        // All permits held means no flush task is still in flight.
        match Arc::clone(&self.pool).acquire_many_owned(self.pool_size).await {
            Ok(_all_permits) => {}
            Err(_) => unreachable!("flush pool semaphore is never closed"),
        }

        let rewrite = self.rewrite_handle.lock().take();
        if let Some(rewrite) = rewrite {
            let _ = rewrite.await;
        }

        self.client.close().await;
        let queue = Arc::clone(&self.queue);
        let name = self.name.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || queue.lock().close()).await {
            error!(backend = %name, error = %e, "spill queue close task failed");
        }
        info!(backend = %self.name, "write worker stopped");
    }

    fn append(
        &self,
        buffer: &mut BytesMut,
        counter: &mut usize,
        flush_timer: &mut Option<Pin<Box<Sleep>>>,
        line: Bytes,
    ) {
        if line.is_empty() {
            return;
        }
        buffer.extend_from_slice(&line);
        if !line.ends_with(b"\n") {
            buffer.put_u8(b'\n');
        }
        *counter += 1;

        if *counter >= self.flush_size {
            *flush_timer = None;
            self.flush(buffer, counter);
        } else if flush_timer.is_none() {
            *flush_timer = Some(Box::pin(tokio::time::sleep(self.flush_time)));
        }
    }

    /// Snapshots the buffer and hands it to the flush pool; the worker never
    /// waits on the network itself.
    fn flush(&self, buffer: &mut BytesMut, counter: &mut usize) {
        *counter = 0;
        if buffer.is_empty() {
            return;
        }
        let batch = buffer.split().freeze();
        debug!(backend = %self.name, bytes = batch.len(), "flushing batch");

        let name = self.name.clone();
        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            flush_batch(&name, &client, &queue, batch).await;
        });
    }

    /// Rewrite tick: start one rewrite loop when the queue holds data and
    /// none is running.
    fn idle(&self) {
        if !self.queue.lock().is_data() {
            return;
        }
        if self.rewrite_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(rewrite_loop(
            self.name.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.queue),
            Arc::clone(&self.rewrite_running),
            self.shutdown.clone(),
            self.rewrite_interval,
        ));
        *self.rewrite_handle.lock() = Some(handle);
    }
}

/// Compresses one batch and delivers it live or into the spill queue.
async fn flush_batch(
    name: &str,
    client: &HttpBackend,
    queue: &Arc<Mutex<SpillQueue>>,
    batch: Bytes,
) {
    let compressed = match compress(&batch) {
        Ok(compressed) => Bytes::from(compressed),
        Err(e) => {
            error!(backend = %name, error = %e, "compress error, dropping batch");
            return;
        }
    };

    if client.is_active() {
        match client.write_compressed(compressed.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_poison() => {
                warn!(backend = %name, error = %e, "poison batch, dropping");
                return;
            }
            Err(e) => {
                warn!(backend = %name, error = %e, bytes = compressed.len(), "write failed, spilling");
            }
        }
    }

    // The append fsyncs; keep it off the async worker threads.
    let spill_queue = Arc::clone(queue);
    let result =
        tokio::task::spawn_blocking(move || spill_queue.lock().write(&compressed)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(backend = %name, error = %e, "spill write failed, batch lost"),
        Err(e) => error!(backend = %name, error = %e, "spill write task failed, batch lost"),
    }
}

/// Replays spilled batches once the backend is reachable again. Exactly one
/// loop runs per backend at a time.
async fn rewrite_loop(
    name: String,
    client: Arc<HttpBackend>,
    queue: Arc<Mutex<SpillQueue>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    debug!(backend = %name, "rewrite loop started");
    while !shutdown.is_cancelled() && queue.lock().is_data() {
        if !client.is_active() {
            if sleep_or_shutdown(&shutdown, interval).await {
                break;
            }
            continue;
        }
        if rewrite_once(&name, &client, &queue).await.is_err()
            && sleep_or_shutdown(&shutdown, interval).await
        {
            break;
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!(backend = %name, "rewrite loop stopped");
}

/// Returns true when shutdown was requested during the pause.
async fn sleep_or_shutdown(shutdown: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

/// Delivers one spilled batch. `Err` asks the loop to pause before retrying.
async fn rewrite_once(
    name: &str,
    client: &HttpBackend,
    queue: &Arc<Mutex<SpillQueue>>,
) -> Result<(), ()> {
    let read_queue = Arc::clone(queue);
    let batch = match tokio::task::spawn_blocking(move || read_queue.lock().read()).await {
        Ok(Ok(Some(batch))) => Bytes::from(batch),
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            // Corruption: stay put and keep retrying rather than losing the
            // tail silently.
            error!(backend = %name, error = %e, "spill queue read failed");
            return Err(());
        }
        Err(e) => {
            error!(backend = %name, error = %e, "spill queue read task failed");
            return Err(());
        }
    };

    match client.write_compressed(batch).await {
        Ok(()) => {}
        Err(e) if e.is_poison() => {
            warn!(backend = %name, error = %e, "poison batch in spill queue, dropping");
        }
        Err(e) => {
            warn!(backend = %name, error = %e, "rewrite failed, rolling back");
            if let Err(e) = queue.lock().rollback_meta() {
                error!(backend = %name, error = %e, "rollback meta failed");
            }
            return Err(());
        }
    }

    if let Err(e) = queue.lock().update_meta() {
        error!(backend = %name, error = %e, "update meta failed");
        return Err(());
    }
    Ok(())
}
