//! Connection pool lifecycle.

use std::time::Duration;

use pretty_assertions::assert_eq;
use sqlshim::pool::{PLACEHOLDER_DB_NAME, PoolStats};
use sqlshim::prelude::*;

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_idle_connection_is_closed_and_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let database = db_path(&dir, "idle.db");
    let pool = ConnectionPool::new(Duration::from_millis(50));

    {
        let mut conn = pool.acquire(&database).await.unwrap();
        sqlx::query("create table t(a integer)")
            .execute(&mut *conn)
            .await
            .unwrap();
        assert_eq!(conn.database(), database);
    }
    assert!(pool.is_open(&database));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pool.is_open(&database));
    assert_eq!(pool.stats(), PoolStats { open: 0, opened: 1, closed: 1 });

    // The file survives the close.
    let mut conn = pool.acquire(&database).await.unwrap();
    sqlx::query("insert into t values(1)")
        .execute(&mut *conn)
        .await
        .unwrap();
    drop(conn);
    assert_eq!(pool.stats().opened, 2);
    pool.close().await;
}

#[tokio::test]
async fn test_reuse_cancels_idle_close() {
    let dir = tempfile::tempdir().unwrap();
    let database = db_path(&dir, "reuse.db");
    let pool = ConnectionPool::new(Duration::from_millis(200));

    for _ in 0..3 {
        drop(pool.acquire(&database).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(pool.stats(), PoolStats { open: 1, opened: 1, closed: 0 });
    pool.close().await;
    assert_eq!(pool.stats(), PoolStats { open: 0, opened: 1, closed: 1 });
}

#[tokio::test]
async fn test_placeholder_database_is_rejected() {
    let pool = ConnectionPool::default();
    let err = pool
        .acquire(&format!("/srv/data/{PLACEHOLDER_DB_NAME}"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ShimError::UnconfiguredDatabase(_)));
    assert_eq!(pool.stats().opened, 0);
}

#[tokio::test]
async fn test_unopenable_database() {
    let dir = tempfile::tempdir().unwrap();
    let database = dir
        .path()
        .join("missing")
        .join("nested.db")
        .to_string_lossy()
        .into_owned();
    let err = ConnectionPool::default().acquire(&database).await.err().unwrap();
    assert!(matches!(err, ShimError::Connect(ref msg) if msg.starts_with(&database)));
}

#[tokio::test]
async fn test_concurrent_executions_share_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let target = DbTarget::new(db_path(&dir, "shared.db"));
    let driver = Driver::default();
    let params = SqlParams::new();

    let (a, b, c) = tokio::join!(
        driver.execute(None, &target, None, ReturnShape::Scalar, "select 1;", &params),
        driver.execute(None, &target, None, ReturnShape::Scalar, "select 2;", &params),
        driver.execute(None, &target, None, ReturnShape::Scalar, "select 3;", &params),
    );
    assert_eq!(a.unwrap().result.as_scalar(), Some(&serde_json::json!(1)));
    assert_eq!(b.unwrap().result.as_scalar(), Some(&serde_json::json!(2)));
    assert_eq!(c.unwrap().result.as_scalar(), Some(&serde_json::json!(3)));
    assert_eq!(driver.stats().opened, 1);

    driver.close().await;
    assert_eq!(driver.stats().closed, 1);
    assert!(!driver.pool().is_open(&target.database));
}

#[tokio::test]
async fn test_memory_database_stays_open() {
    let pool = ConnectionPool::new(Duration::from_millis(10));
    drop(pool.acquire(":memory:").await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pool.is_open(":memory:"));
    pool.close().await;
}
