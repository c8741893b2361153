use async_stream::try_stream;
use futures::TryStreamExt;
use serde_json::{json, Map};
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Postgres, QueryBuilder, Row,
};
use time::OffsetDateTime;

use super::{
    document::{document_from_json, document_to_json, resolve_server_timestamps, resolve_value, Document, Value},
    error::StoreError,
    path::{auto_id, CollectionPath, DocPath},
    query::{FieldUpdate, Filter, FilterOp, GroupQuery, Snapshot},
    PartitionStore, SnapshotStream, WriteMode,
};

/// Table and merge function backing [`PgStore`].
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    path          TEXT PRIMARY KEY,
    parent        TEXT NOT NULL,
    collection_id TEXT NOT NULL,
    doc_id        TEXT NOT NULL,
    data          JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS documents_parent_idx ON documents (parent, path);
CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection_id);

CREATE OR REPLACE FUNCTION meter_store_merge(a JSONB, b JSONB) RETURNS JSONB
LANGUAGE plpgsql IMMUTABLE AS $$
BEGIN
    IF jsonb_typeof(a) = 'object' AND jsonb_typeof(b) = 'object'
       AND NOT (a ? '$ts') AND NOT (b ? '$ts') THEN
        RETURN (
            SELECT COALESCE(
                jsonb_object_agg(
                    COALESCE(ea.key, eb.key),
                    CASE
                        WHEN ea.key IS NULL THEN eb.value
                        WHEN eb.key IS NULL THEN ea.value
                        ELSE meter_store_merge(ea.value, eb.value)
                    END
                ),
                '{}'::jsonb
            )
            FROM jsonb_each(a) ea
            FULL JOIN jsonb_each(b) eb ON ea.key = eb.key
        );
    END IF;
    RETURN b;
END
$$;
"#;

/// [`PartitionStore`] over a single PostgreSQL table of JSONB documents.
///
/// Query results stream straight from the server cursor. String ordering
/// follows the database's default collation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, path: &DocPath, doc: &Document, on_conflict: &str) -> Result<(), StoreError> {
        let parent = path.parent();
        let sql = format!(
            "INSERT INTO documents (path, parent, collection_id, doc_id, data) VALUES ($1, $2, $3, $4, $5) {on_conflict}"
        );
        sqlx::query(&sql)
            .bind(path.as_str())
            .bind(parent.as_str())
            .bind(parent.id())
            .bind(path.id())
            .bind(document_to_json(doc))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn segments(field: &str) -> Vec<String> {
    field.split('.').map(str::to_string).collect()
}

/// `{"a": {"b": {}}}` for `a.b.c`: merged in first so every ancestor of the
/// updated field is a map.
fn ancestor_skeleton(segments: &[String]) -> serde_json::Value {
    segments[..segments.len().saturating_sub(1)]
        .iter()
        .rev()
        .fold(json!({}), |inner, seg| {
            let mut m = Map::new();
            m.insert(seg.clone(), inner);
            serde_json::Value::Object(m)
        })
}

fn push_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &Filter) -> Result<(), StoreError> {
    let path = segments(&filter.field);
    let op = filter.op.as_sql();

    match &filter.value {
        Value::String(s) => {
            builder
                .push("jsonb_typeof(data #> ")
                .push_bind(path.clone())
                .push(") = 'string' AND (data #>> ")
                .push_bind(path)
                .push(") COLLATE \"C\" ")
                .push(op)
                .push(" ")
                .push_bind(s.clone());
        }
        Value::Int(_) | Value::Float(_) => {
            builder
                .push("jsonb_typeof(data #> ")
                .push_bind(path.clone())
                .push(") = 'number' AND (data #>> ")
                .push_bind(path)
                .push(")::float8 ")
                .push(op)
                .push(" ")
                .push_bind(filter.value.as_f64().unwrap_or_default());
        }
        Value::Timestamp(ts) => {
            let micros = (ts.unix_timestamp_nanos() / 1_000) as i64;
            builder
                .push("jsonb_typeof((data #> ")
                .push_bind(path.clone())
                .push(") -> '$ts') = 'number' AND ((data #> ")
                .push_bind(path)
                .push(") ->> '$ts')::bigint ")
                .push(op)
                .push(" ")
                .push_bind(micros);
        }
        Value::Bool(b) if filter.op == FilterOp::Eq => {
            builder
                .push("(data #> ")
                .push_bind(path)
                .push(") = to_jsonb(")
                .push_bind(*b)
                .push("::boolean)");
        }
        Value::Null if filter.op == FilterOp::Eq => {
            builder.push("(data #> ").push_bind(path).push(") = 'null'::jsonb");
        }
        other => {
            return Err(StoreError::InvalidQuery(format!(
                "unsupported filter {:?} on '{}' with {other:?}",
                filter.op, filter.field
            )))
        }
    }
    Ok(())
}

pub(crate) fn build_group_query(query: &GroupQuery) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let mut builder = QueryBuilder::new("SELECT path, data FROM documents WHERE collection_id = ");
    builder.push_bind(query.collection_id.clone());

    for filter in &query.filters {
        builder.push(" AND ");
        push_filter(&mut builder, filter)?;
    }
    for field in &query.order_by {
        builder
            .push(" AND (data #> ")
            .push_bind(segments(field))
            .push(") IS NOT NULL");
    }

    builder.push(" ORDER BY ");
    for field in &query.order_by {
        push_order_key(&mut builder, field);
    }
    builder.push("path COLLATE \"C\"");
    Ok(builder)
}

/// Sort key matching `Value::total_cmp`: type rank first (null, bool,
/// number, timestamp, string, map), then byte order for strings and the
/// jsonb order for everything else.
fn push_order_key(builder: &mut QueryBuilder<'static, Postgres>, field: &str) {
    let path = segments(field);
    builder
        .push("CASE jsonb_typeof(data #> ")
        .push_bind(path.clone())
        .push(") WHEN 'null' THEN 0 WHEN 'boolean' THEN 1 WHEN 'number' THEN 2 WHEN 'string' THEN 4 ")
        .push("ELSE CASE WHEN jsonb_typeof((data #> ")
        .push_bind(path.clone())
        .push(") -> '$ts') = 'number' THEN 3 ELSE 5 END END, ")
        .push("(CASE WHEN jsonb_typeof(data #> ")
        .push_bind(path.clone())
        .push(") = 'string' THEN (data #>> ")
        .push_bind(path.clone())
        .push(") END) COLLATE \"C\", (data #> ")
        .push_bind(path)
        .push("), ");
}

/// One UPDATE statement applying every change, so the row lock makes the
/// whole batch (increments included) atomic.
pub(crate) fn build_update(path: &DocPath, updates: &[FieldUpdate], now: OffsetDateTime) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("UPDATE documents SET data = ");
    for _ in updates {
        builder.push("jsonb_set(meter_store_merge(");
    }
    builder.push("data");

    for update in updates {
        let segs = segments(update.field());
        builder
            .push(", ")
            .push_bind(ancestor_skeleton(&segs))
            .push("), ")
            .push_bind(segs.clone())
            .push(", ");

        match update {
            FieldUpdate::Set { value, .. } => {
                let mut value = value.clone();
                resolve_value(&mut value, now);
                builder.push_bind(value.to_stored_json()).push("::jsonb");
            }
            FieldUpdate::Increment { by, .. } => {
                builder
                    .push("to_jsonb(COALESCE(CASE WHEN jsonb_typeof(data #> ")
                    .push_bind(segs.clone())
                    .push(") = 'number' THEN (data #>> ")
                    .push_bind(segs)
                    .push(")::float8 END, 0) + ")
                    .push_bind(*by)
                    .push("::float8)");
            }
        }
        builder.push(", true)");
    }

    builder.push(" WHERE path = ").push_bind(path.as_str().to_string());
    builder
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let path: String = row.try_get("path")?;
    let data: serde_json::Value = row.try_get("data")?;
    Ok(Snapshot {
        path: DocPath::parse(&path)?,
        data: document_from_json(data)?,
    })
}

#[async_trait::async_trait]
impl PartitionStore for PgStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT data FROM documents WHERE path = $1")
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(data,)| document_from_json(data)).transpose()
    }

    async fn set(&self, path: &DocPath, mut doc: Document, mode: WriteMode) -> Result<(), StoreError> {
        resolve_server_timestamps(&mut doc, OffsetDateTime::now_utc());
        let on_conflict = match mode {
            WriteMode::Replace => "ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data",
            WriteMode::Merge => "ON CONFLICT (path) DO UPDATE SET data = meter_store_merge(documents.data, EXCLUDED.data)",
        };
        self.insert(path, &doc, on_conflict).await
    }

    async fn add(&self, collection: &CollectionPath, mut doc: Document) -> Result<DocPath, StoreError> {
        let path = collection.doc(&auto_id())?;
        resolve_server_timestamps(&mut doc, OffsetDateTime::now_utc());
        self.insert(&path, &doc, "").await?;
        Ok(path)
    }

    async fn update(&self, path: &DocPath, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        let mut builder = build_update(path, updates, OffsetDateTime::now_utc());
        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE path = $1")
            .bind(path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn list(&self, collection: &CollectionPath) -> SnapshotStream<'_> {
        let parent = collection.as_str().to_string();
        Box::pin(try_stream! {
            let mut rows = sqlx::query("SELECT path, data FROM documents WHERE parent = $1 ORDER BY path COLLATE \"C\"")
                .bind(parent)
                .fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                yield snapshot_from_row(&row)?;
            }
        })
    }

    fn query(&self, query: GroupQuery) -> SnapshotStream<'_> {
        Box::pin(try_stream! {
            let mut builder = build_group_query(&query)?;
            tracing::debug!(sql = builder.sql(), "streaming collection group query");
            let mut rows = builder.build().fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                yield snapshot_from_row(&row)?;
            }
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
