//! Execution strategy shared by the blocking and asynchronous paths.
//!
//! Every database operation is written once as an `async fn`. A synchronous
//! engine set owns a dedicated runtime and drives those futures to completion
//! with [`Executor::block_on`]; an asynchronous set reuses the caller's runtime.

use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use crate::{DbError, Result};

#[derive(Debug)]
pub struct Executor {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Executor {
    /// Executor owning a small dedicated runtime.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be started.
    pub fn blocking() -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sqlbind-blocking")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Executor bound to the runtime the caller is running on.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` when called outside a tokio runtime.
    pub fn native() -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            DbError::Configuration(
                "asynchronous database drivers require a running tokio runtime".to_owned(),
            )
        })?;
        Ok(Self {
            runtime: None,
            handle,
        })
    }

    /// Whether this executor owns its runtime (synchronous engine set).
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.runtime.is_some()
    }

    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drive a future to completion from synchronous code.
    ///
    /// Outside a runtime the future runs on the executor's handle. Inside a
    /// multi-threaded runtime the current worker is parked with
    /// `block_in_place`. Inside a current-thread runtime only an owned
    /// runtime can make progress: the future is polled on the calling thread
    /// while the owned runtime's worker drives its I/O and timers.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` when a native executor is asked to
    /// block a current-thread runtime it depends on.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let Ok(current) = Handle::try_current() else {
            return Ok(self.handle.block_on(future));
        };
        match current.runtime_flavor() {
            RuntimeFlavor::CurrentThread if self.is_blocking() => {
                let _entered = self.handle.enter();
                Ok(futures::executor::block_on(future))
            }
            RuntimeFlavor::CurrentThread => Err(DbError::Configuration(
                "cannot block on an asynchronous engine set from a current-thread runtime; \
                 await the operation instead"
                    .to_owned(),
            )),
            _ => Ok(tokio::task::block_in_place(|| self.handle.block_on(future))),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_executor_runs_futures() {
        let executor = Executor::blocking().unwrap();
        assert!(executor.is_blocking());
        assert_eq!(executor.block_on(async { 40 + 2 }).unwrap(), 42);
    }

    #[test]
    fn test_native_executor_needs_runtime() {
        assert!(matches!(
            Executor::native(),
            Err(DbError::Configuration(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_block_on_from_inside_runtime() {
        let executor = Executor::native().unwrap();
        assert!(!executor.is_blocking());
        let value = executor
            .block_on(async {
                tokio::task::yield_now().await;
                7
            })
            .unwrap();
        assert_eq!(value, 7);

        let blocking = Executor::blocking().unwrap();
        assert_eq!(blocking.block_on(async { 1 }).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_owned_runtime_blocks_inside_current_thread_runtime() {
        let blocking = Executor::blocking().unwrap();
        let value = blocking
            .block_on(async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                tokio::spawn(async { 3 }).await.unwrap()
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_native_executor_refuses_current_thread_runtime() {
        let native = Executor::native().unwrap();
        let err = native.block_on(async { 1 }).unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
        assert!(err.to_string().contains("current-thread"));
    }
}
