//! Shared test utilities for optd integration tests.
//!
//! Provides a PostgreSQL instance and a Redis instance shared across
//! tests in one binary. Each test gets its own Postgres database within
//! the instance; Redis tests get their own uniquely-named queue keys
//! instead, since creating a throwaway Redis instance per test is not
//! meaningfully cheaper than sharing one.
//!
//! Two modes, for Postgres:
//! - **`OPTD_TEST_PG_URL`** set (nextest setup script): use the external
//!   container directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.
//!
//! Same two-mode shape for Redis via **`OPTD_TEST_REDIS_URL`**.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

use optd_broker::{Broker, BrokerConfig};
use optd_db::pool;

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Shared container state: base URL and optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("OPTD_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL.
///
/// Lazily starts a container on first call (unless `OPTD_TEST_PG_URL` is
/// set). The URL points at the server root (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. The pool connects to a uniquely-named
/// database within the shared instance. Call [`drop_test_db`] with the
/// returned `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database in container");

    let db_name = format!("optd_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool)
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database.
///
/// Terminates existing connections and drops the database. Safe to call
/// even if the database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}

// ---------------------------------------------------------------------------
// Redis / Broker
// ---------------------------------------------------------------------------

struct SharedRedis {
    base_url: String,
    _container: Option<ContainerAsync<Redis>>,
}

static SHARED_REDIS: OnceCell<SharedRedis> = OnceCell::const_new();

async fn init_shared_redis() -> SharedRedis {
    if let Ok(url) = std::env::var("OPTD_TEST_REDIS_URL") {
        return SharedRedis {
            base_url: url,
            _container: None,
        };
    }

    let container = Redis::default()
        .with_tag("7")
        .start()
        .await
        .expect("failed to start redis container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("failed to get mapped port");

    SharedRedis {
        base_url: format!("redis://{host}:{port}"),
        _container: Some(container),
    }
}

/// A [`Broker`] connected to the shared Redis instance, with queue names
/// namespaced to this call so concurrent tests never collide on the same
/// main/processing/dead-letter keys.
pub async fn create_test_broker() -> Broker {
    let shared = SHARED_REDIS.get_or_init(init_shared_redis).await;
    let suffix = Uuid::new_v4().simple().to_string();
    let config = BrokerConfig {
        redis_url: shared.base_url.clone(),
        main_queue: format!("optd_test_main_{suffix}"),
        processing_queue: format!("optd_test_processing_{suffix}"),
        dead_letter_queue: format!("optd_test_dead_{suffix}"),
    };
    Broker::connect(config)
        .await
        .expect("failed to connect test broker")
}
