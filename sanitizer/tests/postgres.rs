//! Integration tests against a real PostgreSQL.
//!
//! Each test starts a throwaway postgres container through testcontainers.
//!
//! Prerequisites:
//! - Docker must be running
//!
//! Run with: `cargo test --test postgres -- --ignored`

use std::sync::Arc;

use sanitizer::db::Database;
use sanitizer::db::postgres::{PostgresConfig, PostgresConnector, PostgresDatabase};
use sanitizer::orchestrator::{Orchestrator, RunOptions};
use sanitizer::plan::{
    ExternalIdSpec, RecomputeSpec, ReferencePatch, ResequenceSpec, TableDescriptor,
};
use sanitizer::tracker::TableStatus;
use sanitizer::xmlid;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

struct Fixture {
    // Dropping the container stops it.
    _container: ContainerAsync<Postgres>,
    cfg: PostgresConfig,
    client: Client,
}

async fn start(setup: &str) -> Fixture {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start postgres container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

    let (client, connection) = tokio_postgres::connect(&url, NoTls)
        .await
        .expect("Failed to connect");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });
    client.batch_execute(setup).await.expect("Failed to run setup");

    Fixture {
        _container: container,
        cfg: PostgresConfig::new(url),
        client,
    }
}

async fn database(cfg: &PostgresConfig) -> Arc<PostgresDatabase> {
    let db = PostgresDatabase::connect(cfg, &CancellationToken::new())
        .await
        .expect("Failed to connect sanitizer");
    Arc::new(db)
}

async fn ints(client: &Client, sql: &str) -> Vec<Option<i64>> {
    client
        .query(sql, &[])
        .await
        .expect("Failed to query")
        .iter()
        .map(|r| r.get(0))
        .collect()
}

fn sequential(table: &str) -> TableDescriptor {
    let mut d = TableDescriptor::new(table);
    d.phases.id_shift = true;
    d.resequence = Some(ResequenceSpec::Sequential {
        start: 1,
        order_by: vec![],
        filter: None,
    });
    d
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_renumber_with_cascade_and_sequence() {
    let fx = start(
        "CREATE TABLE t (id bigserial PRIMARY KEY, name text);
         CREATE TABLE d (id bigserial PRIMARY KEY, t_id bigint REFERENCES t(id));
         INSERT INTO t (id, name) VALUES (5, 'a'), (8, 'b'), (12, 'c');
         INSERT INTO d (t_id) VALUES (8), (12), (NULL);",
    )
    .await;
    let db = database(&fx.cfg).await;

    let mut d = sequential("t");
    d.phases.fk_rewrite = true;
    d.phases.sequence_sync = true;
    let report = Orchestrator::new(db.clone(), RunOptions::default())
        .run(&[d])
        .await;

    let result = report.result("t").unwrap();
    assert_eq!(result.status, TableStatus::Success, "{:?}", result.error);
    assert_eq!(
        ints(&fx.client, "SELECT id FROM t ORDER BY id").await,
        vec![Some(1), Some(2), Some(3)]
    );
    assert_eq!(
        ints(&fx.client, "SELECT t_id FROM d ORDER BY id").await,
        vec![Some(2), Some(3), None]
    );
    let next: i64 = fx
        .client
        .query_one("SELECT nextval(pg_get_serial_sequence('t', 'id'))", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(next, 4);

    let action: String = fx
        .client
        .query_one(
            "SELECT confupdtype::text FROM pg_constraint WHERE conname = 'd_t_id_fkey'",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(action, "c");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_consolidation_merge() {
    let fx = start(
        "CREATE TABLE t (id bigserial PRIMARY KEY);
         CREATE TABLE d (id bigserial PRIMARY KEY, t_id bigint REFERENCES t(id) ON UPDATE CASCADE);
         INSERT INTO t (id) VALUES (7), (8);
         INSERT INTO d (t_id) VALUES (8), (7), (8);",
    )
    .await;
    let db = database(&fx.cfg).await;

    let mut d = TableDescriptor::new("t");
    d.phases.id_shift = true;
    d.resequence = Some(ResequenceSpec::Consolidation {
        pairs: vec![(8, 7)],
    });
    let report = Orchestrator::new(db, RunOptions::default()).run(&[d]).await;

    assert_eq!(report.result("t").unwrap().rows_deleted, 1);
    assert_eq!(ints(&fx.client, "SELECT id FROM t").await, vec![Some(7)]);
    assert_eq!(
        ints(&fx.client, "SELECT t_id FROM d ORDER BY id").await,
        vec![Some(7), Some(7), Some(7)]
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_failed_table_is_rolled_back() {
    let fx = start(
        "CREATE TABLE t1 (id bigserial PRIMARY KEY);
         CREATE TABLE t2 (id bigserial PRIMARY KEY);
         CREATE TABLE t3 (id bigserial PRIMARY KEY);
         CREATE TABLE d2 (id bigserial PRIMARY KEY, t2_id bigint REFERENCES t2(id));
         INSERT INTO t1 (id) VALUES (10), (20);
         INSERT INTO t2 (id) VALUES (10), (20);
         INSERT INTO t3 (id) VALUES (10), (20);
         INSERT INTO d2 (t2_id) VALUES (20);",
    )
    .await;
    let db = database(&fx.cfg).await;

    // t2 keeps its NO ACTION reference, so moving key 20 fails.
    let plan = vec![sequential("t1"), sequential("t2"), sequential("t3")];
    let report = Orchestrator::new(db, RunOptions::default())
        .run(&plan)
        .await;

    let failed = report.result("t2").unwrap();
    assert_eq!(failed.status, TableStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().kind, "constraint_violation");
    assert_eq!(
        ints(&fx.client, "SELECT id FROM t2 ORDER BY id").await,
        vec![Some(10), Some(20)]
    );
    assert_eq!(
        ints(&fx.client, "SELECT id FROM t1 ORDER BY id").await,
        vec![Some(1), Some(2)]
    );
    assert_eq!(
        ints(&fx.client, "SELECT id FROM t3 ORDER BY id").await,
        vec![Some(1), Some(2)]
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_failed_patch_keeps_table_transaction_usable() {
    let fx = start(
        "CREATE TABLE t (
             id bigserial PRIMARY KEY,
             parent_id bigint REFERENCES t(id),
             parent_path text
         );
         CREATE TABLE note (id bigserial PRIMARY KEY, ref text);
         INSERT INTO t (id) VALUES (5);
         INSERT INTO t (id, parent_id) VALUES (9, 5);
         INSERT INTO note (ref) VALUES ('t,9');",
    )
    .await;
    let db = database(&fx.cfg).await;

    let mut d = sequential("t");
    d.phases.fk_rewrite = true;
    d.phases.patch_refs = true;
    d.phases.recompute = true;
    d.patches = vec![
        ReferencePatch::Column {
            table: "missing".into(),
            column: "t_id".into(),
            model_column: None,
            model_value: None,
        },
        ReferencePatch::Text {
            table: "note".into(),
            column: "ref".into(),
            prefix: "t,".into(),
        },
    ];
    d.recompute = vec![RecomputeSpec::ParentPath {
        parent_column: "parent_id".into(),
        path_column: "parent_path".into(),
    }];
    let options = RunOptions {
        workers: 1,
        ..RunOptions::default()
    };
    let report = Orchestrator::new(db, options)
        .with_connector(Arc::new(PostgresConnector::new(
            fx.cfg.clone(),
            CancellationToken::new(),
        )))
        .run(&[d])
        .await;

    let result = report.result("t").unwrap();
    assert_eq!(result.status, TableStatus::Success, "{:?}", result.error);
    assert_eq!(result.warnings.len(), 1);
    let note: String = fx
        .client
        .query_one("SELECT ref FROM note", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(note, "t,2");
    let path: String = fx
        .client
        .query_one("SELECT parent_path FROM t WHERE id = 2", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(path, "1/2/");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_catalog_discovery() {
    let fx = start(
        "CREATE TABLE t (id bigserial PRIMARY KEY);
         CREATE TABLE d (
             id bigserial PRIMARY KEY,
             t_id bigint REFERENCES t(id) ON DELETE SET NULL
         );",
    )
    .await;
    let db = database(&fx.cfg).await;

    assert!(db.table_exists("t").await.unwrap());
    assert!(!db.table_exists("ghost").await.unwrap());
    let found = db.constraints_referencing("t").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "d_t_id_fkey");
    assert_eq!(found[0].rule.referencing_column, "t_id");
    assert_eq!(db.max_key("t", "id").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_external_id_names_can_swap() {
    let fx = start(
        "CREATE TABLE t (id bigserial PRIMARY KEY);
         CREATE TABLE ir_model_data (
             id bigserial PRIMARY KEY,
             module text NOT NULL,
             name text NOT NULL,
             model text NOT NULL,
             res_id bigint,
             UNIQUE (module, name)
         );
         INSERT INTO t (id) VALUES (1), (2);
         INSERT INTO ir_model_data (module, name, model, res_id) VALUES
             ('base', 'partner_2', 't', 1),
             ('base', 'partner_1', 't', 2),
             ('__export__', 't_2', 't', 2);",
    )
    .await;
    let db = database(&fx.cfg).await;

    let spec = ExternalIdSpec {
        registry: "ir_model_data".into(),
        module: "base".into(),
        model: "t".into(),
        pattern: "partner_{id}".into(),
        filter: None,
    };
    let outcome = xmlid::rebuild(db.as_ref(), "t", "id", &spec).await.unwrap();
    assert_eq!(outcome.updated, 2);

    let rows = fx
        .client
        .query(
            "SELECT module, name, res_id FROM ir_model_data ORDER BY id",
            &[],
        )
        .await
        .unwrap();
    let registry: Vec<(String, String, i64)> = rows
        .iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect();
    assert_eq!(
        registry,
        vec![
            ("base".to_string(), "partner_1".to_string(), 1),
            ("base".to_string(), "partner_2".to_string(), 2),
            ("__export__".to_string(), "t_2".to_string(), 2),
        ]
    );
}
