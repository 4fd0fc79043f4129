//! Versioned schema migrations.
//!
//! Each version `NN` ships two files in this directory: `migration_NN_up.sql` moves the schema
//! from `NN-1` to `NN` and `migration_NN_down.sql` moves it back.

use crate::Result;
use anyhow::{bail, Context};
use sqlx::{Executor, SqlitePool};
use tracing::debug;

struct Migration {
    version: i32,
    up_sql: &'static str,
    down_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("migration_01_up.sql"),
    down_sql: include_str!("migration_01_down.sql"),
}];

/// One SQL script and the version the schema is at once it has run.
struct Step {
    sql: &'static str,
    lands_on: i32,
}

/// Works out the scripts needed to go from `from` to `to`, failing before anything runs if one
/// of them does not exist.
fn plan(from: i32, to: i32) -> Result<Vec<Step>> {
    let find = |version: i32| -> Result<&'static Migration> {
        match MIGRATIONS.iter().find(|m| m.version == version) {
            Some(m) => Ok(m),
            None => bail!("Migration {version} is missing, cannot migrate from {from} to {to}"),
        }
    };
    let mut steps = Vec::new();
    if from < to {
        for version in (from + 1)..=to {
            steps.push(Step {
                sql: find(version)?.up_sql,
                lands_on: version,
            });
        }
    } else {
        for version in ((to + 1)..=from).rev() {
            steps.push(Step {
                sql: find(version)?.down_sql,
                lands_on: version - 1,
            });
        }
    }
    Ok(steps)
}

/// Migrates the schema from version `from` to version `to`, one transaction per step.
pub(crate) async fn run(pool: &SqlitePool, from: i32, to: i32) -> Result<()> {
    if from == to {
        debug!("Schema is at version {to}");
        return Ok(());
    }
    for step in plan(from, to)? {
        debug!("Migrating schema to version {:02}", step.lands_on);
        apply(pool, &step).await?;
    }
    Ok(())
}

async fn apply(pool: &SqlitePool, step: &Step) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("Failed to begin migration transaction")?;
    tx.execute(step.sql)
        .await
        .with_context(|| format!("Migration to version {} failed", step.lands_on))?;
    sqlx::query("UPDATE schema_version SET version = ?")
        .bind(step.lands_on)
        .execute(&mut *tx)
        .await
        .context("Failed to record the schema version")?;
    tx.commit()
        .await
        .context("Failed to commit migration transaction")?;
    Ok(())
}
