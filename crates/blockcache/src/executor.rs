//! Dedicated async runtime for backend calls.
//!
//! Block workers and filesystem threads are plain OS threads, while the
//! storage backend is async. `BackendExecutor` owns a tokio runtime running on
//! a background thread, completely separate from any ambient runtime, so
//! synchronous callers never call `block_on()` on a tokio worker.
//!
//! # Architecture
//!
//! ```text
//! Caller Thread                  Executor Thread
//! ─────────────                  ───────────────
//!     │                               │
//!     │ submit(future) ──────────────►│
//!     │                               │ spawn task
//!     │ blocking_recv() ◄─────────────│ send result
//!     │                               │
//! ```
//!
//! Each call creates a typed oneshot channel; the queued work item only
//! carries a boxed `()` future that sends into it.
//!
//! Calling into the executor from inside a tokio runtime panics (the blocking
//! channel operations refuse to run there), so async callers must go through
//! `spawn_blocking`.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use blobmount_storage::{StorageBackend, StorageError};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::BlockCacheError;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during executor operations.
#[derive(Debug, Clone)]
pub enum ExecutorError {
    /// The runtime or its thread could not be started.
    Startup(String),
    /// The executor has been shut down or the background thread died.
    Shutdown,
    /// The operation was cancelled.
    Cancelled,
    /// The operation timed out.
    Timeout {
        /// The timeout duration that was exceeded.
        duration: Duration,
    },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Startup(msg) => write!(f, "Executor failed to start: {}", msg),
            ExecutorError::Shutdown => write!(f, "Executor has been shut down"),
            ExecutorError::Cancelled => write!(f, "Operation was cancelled"),
            ExecutorError::Timeout { duration } => {
                write!(f, "Operation timed out after {:?}", duration)
            }
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Type-erased work item; the result travels through a typed oneshot.
struct WorkItem {
    work: BoxFuture<'static, ()>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the backend executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of tokio worker threads.
    pub worker_threads: usize,
    /// Channel buffer size for work submission.
    pub queue_size: usize,
    /// Timeout applied to every call (None = no timeout).
    pub default_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_size: 1024,
            default_timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Set the number of tokio worker threads.
    ///
    /// # Arguments
    /// * `worker_threads` - Number of tokio worker threads
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    /// Set the default per-call timeout.
    ///
    /// # Arguments
    /// * `timeout` - Timeout duration (None = no timeout)
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

// ============================================================================
// Backend Executor
// ============================================================================

/// Runs backend futures on a private runtime and hands results back to
/// synchronous callers.
pub struct BackendExecutor {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<WorkItem>,
    cancel_token: CancellationToken,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    default_timeout: Option<Duration>,
}

impl BackendExecutor {
    /// Start the runtime thread.
    ///
    /// # Arguments
    /// * `backend` - Storage backend every call is issued against
    /// * `config` - Executor configuration
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        let runtime: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("blobmount-io")
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::Startup(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<WorkItem>(config.queue_size.max(1));
        let cancel_token = CancellationToken::new();
        let token_clone: CancellationToken = cancel_token.clone();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone: Arc<AtomicBool> = running.clone();

        let thread: JoinHandle<()> = std::thread::Builder::new()
            .name("blobmount-executor".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut rx: mpsc::Receiver<WorkItem> = rx;
                    loop {
                        tokio::select! {
                            biased;

                            _ = token_clone.cancelled() => break,
                            item = rx.recv() => match item {
                                Some(item) => {
                                    tokio::spawn(item.work);
                                }
                                None => break,
                            },
                        }
                    }
                });
                running_clone.store(false, Ordering::Release);
            })
            .map_err(|e| ExecutorError::Startup(e.to_string()))?;

        Ok(Self {
            backend,
            tx,
            cancel_token,
            thread: Some(thread),
            running,
            default_timeout: config.default_timeout,
        })
    }

    /// The backend calls are issued against.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Run a backend operation and block until it finishes.
    ///
    /// # Arguments
    /// * `op` - Builds the future from a backend handle
    ///
    /// # Returns
    /// The operation result, with executor failures mapped into the cache error.
    pub fn call<T, F, Fut>(&self, op: F) -> Result<T, BlockCacheError>
    where
        F: FnOnce(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
        T: Send + 'static,
    {
        let future: Fut = op(self.backend.clone());
        let result: Result<T, StorageError> = self.block_on(future)?;
        Ok(result?)
    }

    /// Execute a future on the runtime and block until complete.
    ///
    /// The default timeout and the shutdown token both apply.
    ///
    /// # Arguments
    /// * `future` - The async operation to execute
    pub fn block_on<F, T>(&self, future: F) -> Result<T, ExecutorError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_running() || self.is_cancelled() {
            return Err(ExecutorError::Shutdown);
        }

        let token: CancellationToken = self.cancel_token.clone();
        let timeout: Option<Duration> = self.default_timeout;
        let (result_tx, result_rx) = oneshot::channel::<Result<T, ExecutorError>>();

        let work: BoxFuture<'static, ()> = async move {
            let guarded = async move {
                match timeout {
                    Some(duration) => tokio::time::timeout(duration, future)
                        .await
                        .map_err(|_| ExecutorError::Timeout { duration }),
                    None => Ok(future.await),
                }
            };
            let result: Result<T, ExecutorError> = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ExecutorError::Cancelled),
                result = guarded => result,
            };
            // Caller may have gone away
            let _ = result_tx.send(result);
        }
        .boxed();

        if self.tx.blocking_send(WorkItem { work }).is_err() {
            return Err(ExecutorError::Shutdown);
        }

        match result_rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Shutdown),
        }
    }

    /// Cancel in-flight calls and stop accepting new ones.
    pub fn cancel_all(&self) {
        self.cancel_token.cancel();
    }

    /// Whether the executor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the runtime thread is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for BackendExecutor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use blobmount_storage::MemoryBackend;

    fn executor(config: ExecutorConfig) -> (Arc<MemoryBackend>, BackendExecutor) {
        let memory: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let executor: BackendExecutor = BackendExecutor::new(memory.clone(), config).unwrap();
        (memory, executor)
    }

    #[test]
    fn test_call_reaches_backend() {
        let (memory, executor) = executor(ExecutorConfig::default());
        memory.insert_file("f", vec![1, 2, 3]);

        let data: Vec<u8> = executor
            .call(|backend| async move { backend.read_range("f", 1, 8).await })
            .unwrap();
        assert_eq!(data, vec![2, 3]);
    }

    #[test]
    fn test_call_maps_storage_error() {
        let (_, executor) = executor(ExecutorConfig::default());
        let result: Result<Vec<u8>, BlockCacheError> =
            executor.call(|backend| async move { backend.read_range("missing", 0, 1).await });
        assert!(matches!(
            result,
            Err(BlockCacheError::Storage(StorageError::NotFound(_)))
        ));
    }

    #[test]
    fn test_concurrent_callers() {
        let (memory, executor) = executor(ExecutorConfig::default().with_worker_threads(2));
        memory.insert_file("f", (0..100u8).collect());
        let executor: Arc<BackendExecutor> = Arc::new(executor);

        let callers: Vec<_> = (0..32u64)
            .map(|i| {
                let executor: Arc<BackendExecutor> = executor.clone();
                std::thread::spawn(move || {
                    executor
                        .call(move |backend| async move { backend.read_range("f", i, 1).await })
                        .unwrap()
                })
            })
            .collect();

        for (i, caller) in callers.into_iter().enumerate() {
            assert_eq!(caller.join().unwrap(), vec![i as u8]);
        }
        assert_eq!(memory.read_calls(), 32);
    }

    #[test]
    fn test_default_timeout() {
        let (memory, executor) = executor(
            ExecutorConfig::default().with_default_timeout(Some(Duration::from_millis(30))),
        );
        memory.insert_file("slow", vec![0; 4]);
        memory.set_read_delay(Duration::from_secs(5));

        let result = executor.call(|backend| async move { backend.read_range("slow", 0, 4).await });
        assert!(matches!(
            result,
            Err(BlockCacheError::Executor(ExecutorError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_cancel_interrupts_in_flight() {
        let (_, executor) = executor(ExecutorConfig::default());
        let executor: Arc<BackendExecutor> = Arc::new(executor);
        let caller_executor: Arc<BackendExecutor> = executor.clone();

        let caller = std::thread::spawn(move || {
            caller_executor.block_on(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                1
            })
        });

        std::thread::sleep(Duration::from_millis(50));
        executor.cancel_all();

        let result: Result<i32, ExecutorError> = caller.join().unwrap();
        assert!(matches!(
            result,
            Err(ExecutorError::Cancelled) | Err(ExecutorError::Shutdown)
        ));
    }

    #[test]
    fn test_calls_after_cancel_fail_fast() {
        let (_, executor) = executor(ExecutorConfig::default());
        executor.cancel_all();
        let result: Result<i32, ExecutorError> = executor.block_on(async { 7 });
        assert!(matches!(result, Err(ExecutorError::Shutdown)));
    }

    #[test]
    fn test_drop_joins_thread() {
        let (_, executor) = executor(ExecutorConfig::default());
        assert!(executor.is_running());
        drop(executor);
    }
}
