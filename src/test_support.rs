//! Fixtures for tests that need a live PostgreSQL.
//!
//! Those tests return early unless `PIPELINE_TEST_DATABASE_URL` is set. Each
//! caller gets its own schema so concurrent tests never see each other's rows.

use std::env;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::schema;

/// Pool bound to a fresh schema holding the service tables, or `None` when no
/// test database is configured.
pub async fn test_pool(tag: &str) -> Result<Option<PgPool>> {
    // ---
    let Ok(database_url) = env::var("PIPELINE_TEST_DATABASE_URL") else {
        return Ok(None);
    };
    let schema_name = format!("pipeline_test_{}_{}", tag, std::process::id());

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
        .execute(&admin)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
        .execute(&admin)
        .await?;
    admin.close().await;

    let search_path = schema_name.clone();
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .after_connect(move |conn, _meta| {
            let schema = search_path.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;

    schema::create_schema(&pool).await?;
    Ok(Some(pool))
}
