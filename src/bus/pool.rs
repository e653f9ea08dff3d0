//! Bounded worker pool for timeout-governed handler invocations.
//!
//! Backed by the blocking-thread pool of a private tokio runtime, built on
//! first use. The publisher waits on a channel with a deadline; on timeout the
//! task is aborted, which only prevents it from starting. A handler that is
//! already running keeps running and its late result is discarded.

use super::handler::MessageHandler;
use super::message::Message;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

pub(crate) enum InvocationOutcome {
    Completed(anyhow::Result<()>),
    Panicked,
    TimedOut,
    /// The pool could not accept or finish the task.
    Unavailable(String),
}

pub(crate) struct WorkerPool {
    max_threads: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads: max_threads.max(1),
            runtime: Mutex::new(None),
        }
    }

    /// Run on the caller's thread.
    pub fn invoke_inline(handler: &dyn MessageHandler, message: &Message) -> InvocationOutcome {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
            Ok(result) => InvocationOutcome::Completed(result),
            Err(_) => InvocationOutcome::Panicked,
        }
    }

    /// Run on the pool and wait at most `deadline` for the result.
    pub fn run_with_deadline(
        &self,
        handler: Arc<dyn MessageHandler>,
        message: Message,
        deadline: Duration,
    ) -> InvocationOutcome {
        let (tx, rx) = sync_channel(1);
        let task = move || {
            let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&message)));
            // The receiver is gone once the publisher has given up.
            let _ = tx.send(result);
        };

        let join = {
            let mut guard = self.runtime.lock();
            if guard.is_none() {
                match self.build_runtime() {
                    Ok(runtime) => *guard = Some(runtime),
                    Err(e) => {
                        return InvocationOutcome::Unavailable(format!(
                            "failed to start delivery workers: {e}"
                        ))
                    }
                }
            }
            match guard.as_ref() {
                Some(runtime) => runtime.spawn_blocking(task),
                None => return InvocationOutcome::Unavailable("delivery workers missing".into()),
            }
        };

        match rx.recv_timeout(deadline) {
            Ok(Ok(result)) => InvocationOutcome::Completed(result),
            Ok(Err(_)) => InvocationOutcome::Panicked,
            Err(RecvTimeoutError::Timeout) => {
                join.abort();
                InvocationOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                InvocationOutcome::Unavailable("delivery workers shut down".into())
            }
        }
    }

    fn build_runtime(&self) -> std::io::Result<Runtime> {
        tracing::debug!(max_threads = self.max_threads, "Starting delivery worker pool");
        Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.max_threads)
            .thread_name("repairbus-delivery")
            .build()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Wait up to `drain` for in-flight tasks, then release the threads.
    ///
    /// Inside a tokio context a blocking wait is not allowed, so the pool is
    /// released without waiting. The next timed delivery starts a fresh pool.
    pub fn shutdown(&self, drain: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(drain);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
