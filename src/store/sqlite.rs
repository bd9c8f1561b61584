use async_trait::async_trait;
use futures_core::future::BoxFuture;
use serde_json::{Map, Value};
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqliteRow},
    ConnectOptions, Pool, Row,
};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use super::{ApplyReport, GraphStore, HierarchyEdge, NamespaceNode};
use crate::{
    error::SyncError,
    mutation::{GraphMutation, MutationSet, NodeKind},
};

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_namespace_tables",
        sql: "\
        CREATE TABLE namespace_nodes (path TEXT PRIMARY KEY, name TEXT NOT NULL, kind TEXT NOT NULL, node_type TEXT NOT NULL, depth INTEGER NOT NULL, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL, value TEXT, value_timestamp INTEGER, attributes TEXT NOT NULL DEFAULT '{}'); \
        CREATE TABLE hierarchy_edges (child TEXT PRIMARY KEY REFERENCES namespace_nodes(path), parent TEXT NOT NULL REFERENCES namespace_nodes(path)); \
        CREATE INDEX hierarchy_edges_parent ON hierarchy_edges(parent);",
        kind: MigrationType::ReversibleUp,
    }])
}

pub async fn db_init(db_path: &Path, max_connections: u32) -> Result<Pool<Sqlite>, sqlx::Error> {
    tracing::debug!("Initializing graph store db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .disable_statement_logging();

    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let node_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM namespace_nodes")
        .fetch_one(&pool)
        .await?;
    let edge_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hierarchy_edges")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "Graph store initialized.\n \
         \tStored node count:\t{node_count} \n \
         \tStored edge count:\t{edge_count}"
    );

    Ok(pool)
}

/// Graph store persisted in a SQLite file. Each mutation set runs in one
/// transaction; the conditional leaf upsert enforces last-write-wins inside
/// the database.
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl SqliteGraphStore {
    pub async fn open<P: Into<PathBuf>>(
        path: P,
        max_connections: u32,
    ) -> Result<SqliteGraphStore, SyncError> {
        let path = path.into();
        let pool = db_init(&path, max_connections).await?;
        Ok(SqliteGraphStore { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn node_from_row(row: &SqliteRow) -> Result<NamespaceNode, SyncError> {
    let kind: String = row.try_get("kind")?;
    let depth: i64 = row.try_get("depth")?;
    let value = match row.try_get::<Option<String>, _>("value")? {
        Some(raw) => Some(serde_json::from_str::<Value>(&raw)?),
        None => None,
    };
    let attributes: String = row.try_get("attributes")?;
    Ok(NamespaceNode {
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        kind: NodeKind::from_str(&kind)?,
        node_type: row.try_get("node_type")?,
        depth: depth as usize,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        value,
        value_timestamp: row.try_get("value_timestamp")?,
        attributes: serde_json::from_str::<Map<String, Value>>(&attributes)?,
    })
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn connect(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, set), fields(path = %set.path))]
    async fn apply(&self, set: &MutationSet) -> Result<ApplyReport, SyncError> {
        let mut report = ApplyReport::default();
        // Each mutation writes before it reads, so a deferred transaction takes
        // the write lock on its first statement and waits out `busy_timeout`
        // instead of failing a read-to-write upgrade.
        let mut tx = self.pool.begin().await?;

        for mutation in set.iter() {
            tracing::debug!("{mutation}");
            match mutation {
                GraphMutation::UpsertNode {
                    path,
                    name,
                    node_type,
                    depth,
                    at,
                } => {
                    let res = sqlx::query(
                        "INSERT INTO namespace_nodes \
                         (path, name, kind, node_type, depth, created_at, updated_at) \
                         VALUES (?, ?, 'structural', ?, ?, ?, ?) \
                         ON CONFLICT(path) DO NOTHING",
                    )
                    .bind(path.as_str())
                    .bind(name.as_str())
                    .bind(node_type.as_str())
                    .bind(*depth as i64)
                    .bind(*at)
                    .bind(*at)
                    .execute(&mut *tx)
                    .await?;
                    report.nodes_created += res.rows_affected() as usize;
                }
                GraphMutation::UpsertEdge { parent, child } => {
                    let res = sqlx::query(
                        "INSERT INTO hierarchy_edges (child, parent) VALUES (?, ?) \
                         ON CONFLICT(child) DO NOTHING",
                    )
                    .bind(child.as_str())
                    .bind(parent.as_str())
                    .execute(&mut *tx)
                    .await?;
                    if res.rows_affected() > 0 {
                        report.edges_created += 1;
                        continue;
                    }
                    let existing: String =
                        sqlx::query_scalar("SELECT parent FROM hierarchy_edges WHERE child = ?")
                            .bind(child.as_str())
                            .fetch_one(&mut *tx)
                            .await?;
                    if existing != *parent {
                        return Err(SyncError::Store(format!(
                            "{child} already has parent {existing}, refusing {parent}"
                        )));
                    }
                }
                GraphMutation::UpsertLeaf {
                    path,
                    name,
                    node_type,
                    depth,
                    value,
                    value_timestamp,
                    attributes,
                    at,
                } => {
                    let created = sqlx::query(
                        "INSERT INTO namespace_nodes \
                         (path, name, kind, node_type, depth, created_at, updated_at) \
                         VALUES (?, ?, 'leaf', ?, ?, ?, ?) \
                         ON CONFLICT(path) DO NOTHING",
                    )
                    .bind(path.as_str())
                    .bind(name.as_str())
                    .bind(node_type.as_str())
                    .bind(*depth as i64)
                    .bind(*at)
                    .bind(*at)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    let written = sqlx::query(
                        "UPDATE namespace_nodes SET \
                           kind = 'leaf', \
                           value = ?, \
                           value_timestamp = ?, \
                           attributes = ?, \
                           updated_at = ? \
                         WHERE path = ? \
                           AND (value_timestamp IS NULL OR value_timestamp <= ?)",
                    )
                    .bind(serde_json::to_string(value)?)
                    .bind(*value_timestamp)
                    .bind(serde_json::to_string(attributes)?)
                    .bind(*at)
                    .bind(path.as_str())
                    .bind(*value_timestamp)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    report.nodes_created += created as usize;
                    match written {
                        0 => report.stale = true,
                        _ => report.leaf_written = true,
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn node(&self, path: &str) -> Result<Option<NamespaceNode>, SyncError> {
        let row = sqlx::query("SELECT * FROM namespace_nodes WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn parent_of(&self, path: &str) -> Result<Option<String>, SyncError> {
        let parent = sqlx::query_scalar("SELECT parent FROM hierarchy_edges WHERE child = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(parent)
    }

    async fn counts(&self) -> Result<(usize, usize), SyncError> {
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM namespace_nodes")
            .fetch_one(&self.pool)
            .await?;
        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM hierarchy_edges")
            .fetch_one(&self.pool)
            .await?;
        Ok((nodes as usize, edges as usize))
    }

    async fn tree_violations(&self) -> Result<Vec<String>, SyncError> {
        let node_rows = sqlx::query("SELECT path, depth FROM namespace_nodes")
            .fetch_all(&self.pool)
            .await?;
        let mut nodes = Vec::with_capacity(node_rows.len());
        for row in node_rows.iter() {
            let path: String = row.try_get("path")?;
            let depth: i64 = row.try_get("depth")?;
            nodes.push((path, depth as usize));
        }

        let edge_rows = sqlx::query("SELECT parent, child FROM hierarchy_edges")
            .fetch_all(&self.pool)
            .await?;
        let mut edges = Vec::with_capacity(edge_rows.len());
        for row in edge_rows.iter() {
            edges.push(HierarchyEdge {
                parent: row.try_get("parent")?,
                child: row.try_get("child")?,
            });
        }

        Ok(super::tree_violations(
            nodes.iter().map(|(path, depth)| (path.as_str(), *depth)),
            edges.iter(),
        ))
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Closed graph store at {:?}", self.path);
    }
}
