use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabula_db::{BatchOutcome, DataService, DbError, ServiceSettings};
use tabula_types::{TenantId, Value};

const INSERT_EVENT: &str = "INSERT INTO events (n) VALUES (?)";

fn service(threshold: usize) -> (tempfile::TempDir, DataService) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("batch.db").to_string_lossy().into_owned();
    let settings = ServiceSettings {
        batch_size_threshold: threshold,
        ..ServiceSettings::new(path)
    };
    (dir, DataService::new(settings))
}

async fn wait_for(outcomes: &Mutex<Vec<Vec<BatchOutcome>>>, expected: usize) {
    for _ in 0..200 {
        let delivered: usize = outcomes
            .lock()
            .expect("outcome lock")
            .iter()
            .map(Vec::len)
            .sum();
        if delivered >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("callbacks were not delivered in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threshold_flush_then_explicit_flush_delivers_every_callback_once() {
    let (_dir, service) = service(100);
    let app = service.for_tenant(TenantId::new("app").expect("valid tenant"));
    app.create_table("events", "n INTEGER NOT NULL")
        .await
        .expect("create");

    let outcomes: Arc<Mutex<Vec<Vec<BatchOutcome>>>> =
        Arc::new(Mutex::new(vec![Vec::new(); 150]));
    for n in 0..150 {
        let outcomes = Arc::clone(&outcomes);
        app.add_batch(
            "events",
            INSERT_EVENT,
            vec![Value::from(n as i64)],
            Box::new(move |outcome| {
                outcomes.lock().expect("outcome lock")[n].push(outcome);
            }),
        )
        .expect("queue write");
    }

    // The first 100 were drained when the threshold was reached.
    assert_eq!(service.batches().pending(INSERT_EVENT), 50);

    assert_eq!(service.flush_batches().await, 50);
    assert_eq!(service.batches().pending(INSERT_EVENT), 0);
    assert_eq!(service.batches().group_count(), 0);

    wait_for(&outcomes, 150).await;
    let outcomes = outcomes.lock().expect("outcome lock");
    for (n, delivered) in outcomes.iter().enumerate() {
        assert_eq!(delivered.len(), 1, "item {n} should be reported exactly once");
        assert_eq!(delivered[0], Ok(1));
    }
    drop(outcomes);

    let rows = app
        .execute_query("SELECT COUNT(*) AS n FROM events", Vec::new())
        .await
        .expect("count");
    assert_eq!(rows[0]["n"], Value::Integer(150));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_land_in_submission_order_across_threshold_and_flush() {
    let (_dir, service) = service(50);
    let app = service.for_tenant(TenantId::new("app").expect("valid tenant"));
    app.create_table("events", "n INTEGER NOT NULL")
        .await
        .expect("create");

    let outcomes: Arc<Mutex<Vec<Vec<BatchOutcome>>>> = Arc::new(Mutex::new(vec![Vec::new(); 51]));
    for n in 0..51 {
        let outcomes = Arc::clone(&outcomes);
        app.add_batch(
            "events",
            INSERT_EVENT,
            vec![Value::from(n as i64)],
            Box::new(move |outcome| {
                outcomes.lock().expect("outcome lock")[n].push(outcome);
            }),
        )
        .expect("queue write");
    }
    assert_eq!(service.flush_batches().await, 1);
    wait_for(&outcomes, 51).await;

    let rows = app
        .execute_query("SELECT n FROM events ORDER BY rowid", Vec::new())
        .await
        .expect("read back");
    let order: Vec<Value> = rows.iter().map(|row| row["n"].clone()).collect();
    let expected: Vec<Value> = (0..51).map(Value::Integer).collect();
    assert_eq!(order, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batches_are_gated_by_ownership() {
    let (_dir, service) = service(10);
    let owner = service.for_tenant(TenantId::new("owner").expect("valid tenant"));
    owner
        .create_table("events", "n INTEGER NOT NULL")
        .await
        .expect("create");

    let other = service.for_tenant(TenantId::new("other").expect("valid tenant"));
    let err = other
        .add_batch("events", INSERT_EVENT, vec![Value::from(1)], Box::new(|_| {}))
        .expect_err("non-owner cannot queue writes");
    assert!(matches!(err, DbError::Query(_)));

    let err = owner
        .add_batch("events", "SELECT n FROM events", Vec::new(), Box::new(|_| {}))
        .expect_err("reads cannot be batched");
    assert!(matches!(err, DbError::Validation(_)));

    let err = owner
        .add_batch(
            "events",
            "CREATE TRIGGER t AFTER INSERT ON events BEGIN DELETE FROM events; END",
            Vec::new(),
            Box::new(|_| {}),
        )
        .expect_err("triggers cannot be batched");
    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(service.batches().group_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_pending_items() {
    let (_dir, service) = service(100);
    let app = service.for_tenant(TenantId::new("app").expect("valid tenant"));
    app.create_table("events", "n INTEGER NOT NULL")
        .await
        .expect("create");

    let outcomes: Arc<Mutex<Vec<Vec<BatchOutcome>>>> = Arc::new(Mutex::new(vec![Vec::new(); 3]));
    for n in 0..3 {
        let outcomes = Arc::clone(&outcomes);
        app.add_batch(
            "events",
            INSERT_EVENT,
            vec![Value::from(n as i64)],
            Box::new(move |outcome| {
                outcomes.lock().expect("outcome lock")[n].push(outcome);
            }),
        )
        .expect("queue write");
    }
    service.shutdown().await;
    let outcomes = outcomes.lock().expect("outcome lock");
    assert!(outcomes.iter().all(|o| o.len() == 1 && o[0].is_ok()));
}
