//! SurrealDB schema migrations and initialization
//!
//! Defines the per-level row tables plus the queue, registry, trace point and
//! query text tables. Safe to call multiple times (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::schema::{aggregate_table, gauge_table};
use crate::Result;

/// Initialize all Strata tables for `level_count` rollup levels.
pub async fn init_schema(db: &Surreal<Any>, level_count: usize) -> Result<()> {
    info!(level_count, "Initializing Strata SurrealDB schema");

    for level in 0..level_count {
        init_level_tables(db, level).await?;
    }
    init_needs_rollup_table(db).await?;
    init_registry_tables(db).await?;
    init_trace_point_table(db).await?;
    init_full_query_text_table(db).await?;

    info!("Strata schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, sql: &str) -> Result<()> {
    db.query(sql)
        .await?
        .check()
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `aggregate_rollup_N` and `gauge_value_rollup_N`
///
/// Record ids encode the full row key, so a rewrite of the same bucket
/// overwrites the earlier row.
async fn init_level_tables(db: &Surreal<Any>, level: usize) -> Result<()> {
    debug!(level, "Initializing rollup level tables");

    let aggregates =
        aggregate_table(level).map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    let gauges = gauge_table(level).map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {aggregates} SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_{aggregates}_lookup ON TABLE {aggregates}
            COLUMNS agent_rollup_id, transaction_type, capture_time;

        DEFINE TABLE IF NOT EXISTS {gauges} SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_{gauges}_lookup ON TABLE {gauges}
            COLUMNS agent_rollup_id, gauge_name, capture_time;
        "#
    );

    run(db, &sql).await?;
    info!("✓ rollup level {} tables initialized", level);
    Ok(())
}

/// Initialize `needs_rollup`
///
/// Schema:
/// ```text
/// TABLE needs_rollup {
///   kind:             STRING ("aggregate" | "gauge")
///   level:            INT
///   agent_rollup_id:  STRING
///   capture_time:     INT (bucket boundary, epoch millis)
///   sub_keys:         ARRAY<STRING>
///   token:            STRING (rotated on every mutation)
/// }
/// ```
async fn init_needs_rollup_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing needs_rollup table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS needs_rollup SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_needs_rollup_partition ON TABLE needs_rollup
            COLUMNS kind, level, agent_rollup_id, capture_time;
    "#;

    run(db, sql).await?;
    info!("✓ needs_rollup table initialized");
    Ok(())
}

async fn init_registry_tables(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agent_rollup and metric_name tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_rollup SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_agent_rollup_parent ON TABLE agent_rollup COLUMNS parent_id;

        DEFINE TABLE IF NOT EXISTS metric_name SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_metric_name_agent ON TABLE metric_name
            COLUMNS kind, agent_rollup_id;
    "#;

    run(db, sql).await?;
    info!("✓ registry tables initialized");
    Ok(())
}

async fn init_trace_point_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing trace_point table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS trace_point SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_trace_point_lookup ON TABLE trace_point
            COLUMNS agent_rollup_id, transaction_type, capture_time;
        DEFINE INDEX IF NOT EXISTS idx_trace_point_identity ON TABLE trace_point
            COLUMNS agent_rollup_id, agent_id, trace_id;
    "#;

    run(db, sql).await?;
    info!("✓ trace_point table initialized");
    Ok(())
}

async fn init_full_query_text_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing full_query_text table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS full_query_text SCHEMALESS;
    "#;

    run(db, sql).await?;
    info!("✓ full_query_text table initialized");
    Ok(())
}
