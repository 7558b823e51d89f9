//! End-to-end tests against real SQLite databases.

use pretty_assertions::assert_eq;
use serde_json::json;
use sqlshim::prelude::*;

fn file_target(dir: &tempfile::TempDir, name: &str) -> DbTarget {
    DbTarget::new(dir.path().join(name).to_string_lossy().into_owned())
}

async fn scalar(driver: &Driver, target: &DbTarget, sql: &str) -> serde_json::Value {
    driver
        .execute(None, target, None, ReturnShape::Scalar, sql, &SqlParams::new())
        .await
        .unwrap()
        .result
        .as_scalar()
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

#[tokio::test]
async fn test_scalar_select() {
    let driver = Driver::default();
    let value = scalar(&driver, &DbTarget::memory(), "select 1 as x;").await;
    assert_eq!(value, json!(1));
    driver.close().await;
}

#[tokio::test]
async fn test_multi_recordset_skips_statements_without_rows() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::MultiRecordset,
            "create table t(a integer, b text);
             insert into t values(1, 'x\\;y');
             select a from t;
             select b from t;",
            &SqlParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        out.result.as_recordsets().unwrap(),
        &[
            vec![json!({"a": 1}).as_object().unwrap().clone()],
            vec![json!({"b": "x;y"}).as_object().unwrap().clone()],
        ]
    );
    driver.close().await;
}

#[tokio::test]
async fn test_params_are_bound_as_literals() {
    let driver = Driver::default();
    let params = SqlParams::new().bind("name", "O'Neil").bind("n", 41i64);
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::Row,
            "select @name as name, @n + 1 as n;",
            &params,
        )
        .await
        .unwrap();
    let row = out.result.as_row().unwrap();
    assert_eq!(row["name"], json!("O'Neil"));
    assert_eq!(row["n"], json!(42));
    driver.close().await;
}

#[tokio::test]
async fn test_side_channel_error_aborts_batch() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_target(&dir, "abort.db");
    let driver = Driver::default();

    let err = driver
        .execute(
            None,
            &target,
            None,
            ReturnShape::MultiRecordset,
            "create table t(a integer);
             insert into t values(1);
             update shim_meta set errcode=50,errmsg='Account locked';
             insert into t values(2);",
            &SqlParams::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.side_channel_code(), Some(50));
    assert!(err.to_string().contains("Account locked"));

    // Statements before the failure were committed; the one after never ran.
    assert_eq!(scalar(&driver, &target, "select count(*) from t;").await, json!(1));
    driver.close().await;
}

#[tokio::test]
async fn test_engine_error_reports_statement() {
    let driver = Driver::default();
    let err = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::MultiRecordset,
            "select * from missing_table;",
            &SqlParams::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::Statement { ref statement, .. } if statement == "select * from missing_table"));
    driver.close().await;
}

#[tokio::test]
async fn test_notices_and_warnings_are_collected() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            Some("tester"),
            ReturnShape::Scalar,
            "update shim_meta set errcode=-1,errmsg='Row archived';
             update shim_meta set errcode=-2,errmsg='Balance low';
             select context from shim_meta;",
            &SqlParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.notices, vec!["Row archived".to_string()]);
    assert_eq!(out.warnings, vec!["Balance low".to_string()]);
    assert_eq!(out.result.as_scalar(), Some(&json!("tester")));
    driver.close().await;
}

#[tokio::test]
async fn test_boolean_cast_columns() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::Row,
            "select 1 as active, 1 as active__cast_as_boolean, 0 as locked__cast_as_boolean;",
            &SqlParams::new(),
        )
        .await
        .unwrap();
    let row = out.result.as_row().unwrap();
    assert_eq!(row["active"], json!(true));
    assert_eq!(row["locked"], json!(false));
    driver.close().await;
}

#[tokio::test]
async fn test_random_hash_is_unique() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_target(&dir, "hash.db");
    let driver = Driver::default();

    driver
        .execute(
            None,
            &target,
            None,
            ReturnShape::MultiRecordset,
            r#"create table acct(acct_id integer primary key, token blob);
               create trigger acct_after_insert after insert on acct
               begin
               update shim_meta set jsexec=jsexec||'{"function":"sha1","table":"acct","rowid":'||new.rowid||',"random":1,"dest":"token"},'\;
               end;
               insert into acct(acct_id) values(1);
               insert into acct(acct_id) values(2);
               insert into acct(acct_id) values(3);"#,
            &SqlParams::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        scalar(&driver, &target, "select count(distinct token) from acct;").await,
        json!(3)
    );
    assert_eq!(
        scalar(&driver, &target, "select min(length(token)) from acct;").await,
        json!(20)
    );
    assert_eq!(
        scalar(&driver, &target, "select jsexec from shim_meta;").await,
        json!("")
    );
    driver.close().await;
}

#[tokio::test]
async fn test_source_hash_with_substring() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::Scalar,
            r#"create table doc(doc_id integer primary key, body text, digest blob);
               insert into doc(doc_id, body) values(1, 'abc');
               update shim_meta set jsexec='{"function":"sha256","table":"doc","rowid":1,"source":"body","dest":"digest","substring":4},';
               select hex(digest) from doc;"#,
            &SqlParams::new(),
        )
        .await
        .unwrap();
    // sha256("abc") starts with ba7816bf.
    assert_eq!(out.result.as_scalar(), Some(&json!("BA7816BF")));
    driver.close().await;
}

#[tokio::test]
async fn test_soundex_command() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::Scalar,
            r#"create table people(name text, sx text);
               insert into people(name) values('Robert');
               update shim_meta set jsexec='{"function":"soundex","source":"select name from people","dest":"update people set sx=%%%SOUNDEX%%%"},';
               select sx from people;"#,
            &SqlParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.result.as_scalar(), Some(&json!("R163")));
    driver.close().await;
}

#[tokio::test]
async fn test_exec_command() {
    let driver = Driver::default();
    let out = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::Scalar,
            r#"create table t(a integer);
               update shim_meta set jsexec='{"function":"exec","sql":"insert into t values(9)\;insert into t values(10)"},';
               select sum(a) from t;"#,
            &SqlParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(out.result.as_scalar(), Some(&json!(19)));
    driver.close().await;
}

#[tokio::test]
async fn test_invalid_jsexec_function() {
    let driver = Driver::default();
    let err = driver
        .execute(
            None,
            &DbTarget::memory(),
            None,
            ReturnShape::MultiRecordset,
            r#"update shim_meta set jsexec='{"function":"md5"},';"#,
            &SqlParams::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::JsexecInvalidFunction(_)));
    driver.close().await;
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_target(&dir, "tx.db");
    let driver = Driver::default();
    scalar(&driver, &target, "create table t(a integer); select 0;").await;

    let committed = driver
        .execute_transaction(&target, |tx| {
            Box::pin(async move {
                tx.execute(None, ReturnShape::Scalar, "insert into t values(1); select count(*) from t;", &SqlParams::new())
                    .await
            })
        })
        .await
        .unwrap();
    assert_eq!(committed.result.as_scalar(), Some(&json!(1)));

    let err = driver
        .execute_transaction(&target, |tx| {
            Box::pin(async move {
                tx.execute(
                    None,
                    ReturnShape::MultiRecordset,
                    "insert into t values(2); update shim_meta set errcode=7,errmsg='nope';",
                    &SqlParams::new(),
                )
                .await
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err.side_channel_code(), Some(7));

    assert_eq!(scalar(&driver, &target, "select count(*) from t;").await, json!(1));
    driver.close().await;
}

#[tokio::test]
async fn test_transaction_cannot_span_targets() {
    let dir = tempfile::tempdir().unwrap();
    let first = file_target(&dir, "first.db");
    let second = file_target(&dir, "second.db");
    let driver = Driver::default();

    let inner = driver.clone();
    let err = driver
        .execute_transaction(&first, move |tx| {
            Box::pin(async move {
                inner
                    .execute(Some(tx), &second, None, ReturnShape::Scalar, "select 1;", &SqlParams::new())
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ShimError::TransactionSpansConnections));
    driver.close().await;
}

#[tokio::test]
async fn test_named_target_with_presql() {
    let dir = tempfile::tempdir().unwrap();
    let config = DriverConfig::builder()
        .idle_timeout(std::time::Duration::from_millis(500))
        .target(
            "app",
            file_target(&dir, "named.db").presql("create table if not exists audit(n integer)"),
        )
        .build();
    let driver = Driver::new(config);

    let out = driver
        .execute_named("app", None, ReturnShape::Scalar, "select count(*) from audit;", &SqlParams::new())
        .await
        .unwrap();
    assert_eq!(out.result.as_scalar(), Some(&json!(0)));

    let missing = driver
        .execute_named("nope", None, ReturnShape::Scalar, "select 1;", &SqlParams::new())
        .await
        .unwrap_err();
    assert!(matches!(missing, ShimError::Config(_)));

    let target = driver.config().target("app").unwrap().clone();
    let database = driver
        .execute_transaction(&target, |tx| {
            Box::pin(async move { Ok::<_, ShimError>(tx.target().database.clone()) })
        })
        .await
        .unwrap();
    assert_eq!(database, target.database);
    driver.close().await;
}
