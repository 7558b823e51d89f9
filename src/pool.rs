//! SQLite Connection Pool
//!
//! One connection per database target. A lease holds the target's lock, so a
//! connection is used by one execution at a time and opened at most once.
//! Releasing a lease schedules an idle close; the next lease cancels it.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{ShimError, ShimResult};
use crate::meta;

/// Target name for a private in-memory database.
pub const MEMORY_TARGET: &str = ":memory:";

/// File name of a target that was never configured.
pub const PLACEHOLDER_DB_NAME: &str = "___DB_NAME___";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Targets with a live connection right now.
    pub open: usize,
    pub opened: usize,
    pub closed: usize,
}

#[derive(Default)]
struct Slot {
    conn: Option<SqliteConnection>,
    idle_close: Option<JoinHandle<()>>,
}

type SharedSlot = Arc<Mutex<Slot>>;

struct PoolInner {
    idle_timeout: Duration,
    slots: StdMutex<HashMap<String, SharedSlot>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl PoolInner {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, database: &str) -> SharedSlot {
        self.registry()
            .entry(database.to_string())
            .or_default()
            .clone()
    }

    fn schedule_idle_close(self: &Arc<Self>, database: &str, slot: &SharedSlot, state: &mut Slot) {
        if database == MEMORY_TARGET || state.conn.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(self);
        let slot = Arc::clone(slot);
        let database = database.to_string();
        let timeout = self.idle_timeout;
        state.idle_close = Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = slot.lock().await;
            state.idle_close = None;
            if let Some(conn) = state.conn.take() {
                debug!(target: "sqlshim::pool", "idle close: {}", database);
                pool.close_connection(&database, conn).await;
            }
        }));
    }

    async fn close_connection(&self, database: &str, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            error!(target: "sqlshim::pool", "error closing {}: {}", database, e);
        }
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A leased connection that goes back to the pool when dropped.
pub struct PooledConnection {
    state: OwnedMutexGuard<Slot>,
    slot: SharedSlot,
    database: String,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// The target this connection was leased for.
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.state
            .conn
            .as_ref()
            .expect("Connection should always be present")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state
            .conn
            .as_mut()
            .expect("Connection should always be present")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        pool.schedule_idle_close(&self.database, &self.slot, &mut self.state);
    }
}

/// Per-target SQLite connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle_timeout,
                slots: StdMutex::new(HashMap::new()),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Lease the connection for `database`, opening it on first use.
    ///
    /// Waits while another execution holds the lease.
    pub async fn acquire(&self, database: &str) -> ShimResult<PooledConnection> {
        check_configured(database)?;
        let slot = self.inner.slot(database);
        let mut state = Arc::clone(&slot).lock_owned().await;

        if let Some(timer) = state.idle_close.take() {
            timer.abort();
        }
        if state.conn.is_none() {
            let conn = open(database).await.inspect_err(|e| {
                error!(target: "sqlshim::pool", "{}", e);
            })?;
            state.conn = Some(conn);
            self.inner.opened.fetch_add(1, Ordering::Relaxed);
            debug!(target: "sqlshim::pool", "opened {}", database);
        }

        Ok(PooledConnection {
            state,
            slot,
            database: database.to_string(),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Whether `database` currently has a live connection.
    ///
    /// Reports `false` while the target is leased, since its state cannot be
    /// inspected without waiting.
    pub fn is_open(&self, database: &str) -> bool {
        let slot = match self.inner.registry().get(database) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        slot.try_lock().map(|state| state.conn.is_some()).unwrap_or(false)
    }

    pub fn stats(&self) -> PoolStats {
        let opened = self.inner.opened.load(Ordering::Relaxed);
        let closed = self.inner.closed.load(Ordering::Relaxed);
        PoolStats {
            open: opened.saturating_sub(closed),
            opened,
            closed,
        }
    }

    /// Close every connection, one at a time, removing each target from the
    /// registry as it completes.
    pub async fn close(&self) {
        let targets: Vec<String> = self.inner.registry().keys().cloned().collect();
        for database in targets {
            let Some(slot) = self.inner.registry().get(&database).cloned() else {
                continue;
            };
            let mut state = slot.lock().await;
            if let Some(timer) = state.idle_close.take() {
                timer.abort();
            }
            if let Some(conn) = state.conn.take() {
                debug!(target: "sqlshim::pool", "closing {}", database);
                self.inner.close_connection(&database, conn).await;
            }
            drop(state);
            self.inner.registry().remove(&database);
        }
    }
}

fn check_configured(database: &str) -> ShimResult<()> {
    let basename = Path::new(database)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(database);
    if basename == PLACEHOLDER_DB_NAME {
        return Err(ShimError::UnconfiguredDatabase(database.to_string()));
    }
    Ok(())
}

async fn open(database: &str) -> ShimResult<SqliteConnection> {
    let options = if database == MEMORY_TARGET {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ShimError::Connect(e.to_string()))?
    } else {
        SqliteConnectOptions::new()
            .filename(database)
            .create_if_missing(true)
    };
    let mut conn = options
        .connect()
        .await
        .map_err(|e| ShimError::Connect(format!("{database}: {e}")))?;

    let connect_sql = meta::connect_sql();
    sqlx::query(&connect_sql)
        .persistent(false)
        .execute(&mut conn)
        .await
        .map_err(|e| ShimError::Connect(format!("{database}: {e}")))?;
    Ok(conn)
}
