//! Engine options applied to `sqlx` pool builders.

use sqlx::pool::{PoolConnectionMetadata, PoolOptions};
use std::time::Duration;
use tracing::debug;

use crate::config::{EngineOptions, PoolClass};

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_MAX_OVERFLOW: u32 = 10;
const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Apply engine options to a pool builder.
pub trait ApplyPoolOpts {
    #[must_use]
    fn apply(self, bind_key: &str, opts: &EngineOptions) -> Self;
}

impl<DB: sqlx::Database> ApplyPoolOpts for PoolOptions<DB> {
    fn apply(mut self, bind_key: &str, opts: &EngineOptions) -> Self {
        let size = opts.pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        let overflow = opts.max_overflow.unwrap_or(DEFAULT_MAX_OVERFLOW);

        self = match opts.poolclass {
            Some(PoolClass::Static) => self
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Some(PoolClass::Null) => self
                .max_connections(size.saturating_add(overflow).max(1))
                .min_connections(0)
                .idle_timeout(Some(Duration::ZERO)),
            Some(PoolClass::Queue) | None => self
                .max_connections(size.saturating_add(overflow).max(1))
                .min_connections(0),
        };

        self = self.acquire_timeout(opts.pool_timeout().unwrap_or(DEFAULT_POOL_TIMEOUT));
        if let Some(t) = opts.pool_recycle() {
            self = self.max_lifetime(t);
        }
        if opts.pool_pre_ping == Some(true) {
            self = self.test_before_acquire(true);
        }

        if opts.echo_pool == Some(true) {
            let checkout_key = bind_key.to_owned();
            let release_key = bind_key.to_owned();
            self = self
                .before_acquire(move |_conn, meta: PoolConnectionMetadata| {
                    debug!(
                        target: "sqlbind::pool",
                        bind_key = %checkout_key,
                        age_ms = meta.age.as_millis(),
                        idle_ms = meta.idle_for.as_millis(),
                        "connection checked out"
                    );
                    Box::pin(std::future::ready(Ok(true)))
                })
                .after_release(move |_conn, meta: PoolConnectionMetadata| {
                    debug!(
                        target: "sqlbind::pool",
                        bind_key = %release_key,
                        age_ms = meta.age.as_millis(),
                        "connection returned"
                    );
                    Box::pin(std::future::ready(Ok(true)))
                });
        }
        self
    }
}
