use tabula_db::{DbError, MIGRATIONS_TABLE};
use tabula_host::{Config, DataHost, HostError};
use tabula_types::{row, PoolStatus, TenantId, Value};

fn config_for(dir: &tempfile::TempDir) -> Config {
    let path = dir.path().join("host.db").to_string_lossy().into_owned();
    Config::from_flat_map([
        ("database.path", path.as_str()),
        ("tasks.batch_flush_secs", "1"),
        ("tasks.health_check_secs", "0"),
    ])
    .expect("valid config")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_prepares_database_and_stop_closes_it() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let host = DataHost::start(&config_for(&dir)).await.expect("host starts");

    assert_eq!(host.service().pool().status(), PoolStatus::Healthy);
    assert_eq!(host.scheduler().running(), vec!["batch-flush", "maintenance"]);

    let app = host.tenant(TenantId::new("app").expect("valid tenant"));
    assert!(app.table_exists(MIGRATIONS_TABLE).await.expect("lookup"));
    app.create_table("items", "id INTEGER PRIMARY KEY, label TEXT")
        .await
        .expect("create");
    app.insert("items", row([("label", Value::from("one"))]))
        .await
        .expect("insert");

    let service = host.service().clone();
    host.stop().await;
    assert_eq!(service.pool().status(), PoolStatus::Closed);
    let err = app.table_exists("items").await.expect_err("host stopped");
    assert!(matches!(err, DbError::Connection(_)));
}

#[tokio::test]
async fn start_fails_for_unreachable_database() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let missing = dir.path().join("no/such/dir/host.db").to_string_lossy().into_owned();
    let config = Config::from_flat_map([
        ("database.path", missing.as_str()),
        ("database.connection_timeout_ms", "200"),
    ])
    .expect("valid config");

    let err = DataHost::start(&config).await.expect_err("database cannot open");
    assert!(matches!(err, HostError::Database(DbError::Initialization(_))), "got {err}");
}

#[tokio::test]
async fn start_rejects_invalid_config() {
    let mut config = Config::default();
    config.database.pool_max_size = 0;
    let err = DataHost::start(&config).await.expect_err("pool size zero");
    assert!(matches!(err, HostError::Config(_)));
}
