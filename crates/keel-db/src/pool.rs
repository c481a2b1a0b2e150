//! Connection pool wiring.
//!
//! The pool itself is `r2d2`. This module plugs a [`Dialect`]'s connection
//! hooks into it: `acquire`/`validate` through `ManageConnection`, and
//! `destroy` through a customizer's release hook, which r2d2 calls right
//! before it closes a connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{CustomizeConnection, HandleError, ManageConnection, Pool};

use crate::dialect::Dialect;
use crate::error::{DbError, DriverError};

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of live connections.
    pub max_size: u32,

    /// Idle connections kept open. `None` keeps up to `max_size`.
    pub min_idle: Option<u32>,

    /// How long `acquire` waits before failing with a timeout.
    pub connection_timeout: Duration,

    /// Validate each connection before lending it out.
    pub test_on_check_out: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: Some(0),
            connection_timeout: Duration::from_secs(30),
            test_on_check_out: true,
        }
    }
}

/// Adapts a dialect to r2d2's `ManageConnection`.
pub struct DialectManager<D> {
    dialect: Arc<D>,
}

impl<D> fmt::Debug for DialectManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialectManager").finish_non_exhaustive()
    }
}

impl<D: Dialect> ManageConnection for DialectManager<D> {
    type Connection = D::Raw;
    type Error = DriverError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.dialect.acquire_raw_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.dialect.validate_connection(conn)
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

struct DestroyHook<D> {
    dialect: Arc<D>,
}

impl<D> fmt::Debug for DestroyHook<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyHook").finish_non_exhaustive()
    }
}

impl<D: Dialect> CustomizeConnection<D::Raw, DriverError> for DestroyHook<D> {
    fn on_release(&self, conn: D::Raw) {
        self.dialect.destroy_raw_connection(conn);
    }
}

/// Routes pool-internal connection errors to `tracing`.
#[derive(Debug)]
struct TracingErrorHandler {
    dialect: &'static str,
}

impl HandleError<DriverError> for TracingErrorHandler {
    fn handle_error(&self, error: DriverError) {
        tracing::warn!(dialect = self.dialect, error = %error, "pooled connection error");
    }
}

/// Builds a pool lending `dialect`'s raw connections.
///
/// # Errors
///
/// Returns `DbError::Pool` if the pool cannot establish its initial idle
/// connections.
pub(crate) fn build_pool<D: Dialect>(
    dialect: Arc<D>,
    settings: PoolSettings,
) -> Result<Pool<DialectManager<D>>, DbError> {
    let name = dialect.name();
    Pool::builder()
        .max_size(settings.max_size)
        .min_idle(settings.min_idle)
        .connection_timeout(settings.connection_timeout)
        .test_on_check_out(settings.test_on_check_out)
        .error_handler(Box::new(TracingErrorHandler { dialect: name }))
        .connection_customizer(Box::new(DestroyHook {
            dialect: Arc::clone(&dialect),
        }))
        .build(DialectManager { dialect })
        .map_err(DbError::Pool)
}
