//! ClickHouse over the native protocol
use async_trait::async_trait;
use clickhouse_rs::{types::Value, Block, Pool};
use tracing::debug;

use super::{is_identifier, layout, PartitionFilter, Warehouse};
use crate::{
    error::WarehouseError,
    record::{CanonicalRow, Column, ColumnKind, Scalar, TableSchema},
};

pub struct ClickhouseWarehouse {
    pool: Pool,
}

impl ClickhouseWarehouse {
    /// `url` as understood by clickhouse-rs, e.g. `tcp://localhost:9000/crimes`
    pub fn new(url: &str) -> Self {
        ClickhouseWarehouse {
            pool: Pool::new(url),
        }
    }

    async fn execute(&self, sql: String) -> Result<(), WarehouseError> {
        debug!(%sql, "execute");
        let mut ch = self.pool.get_handle().await?;
        ch.execute(sql).await?;
        Ok(())
    }

    async fn fetch_u64(&self, sql: String) -> Result<u64, WarehouseError> {
        debug!(%sql, "query");
        let mut ch = self.pool.get_handle().await?;
        let block = ch.query(sql).fetch_all().await?;
        match block.rows().next() {
            Some(row) => Ok(row.get::<u64, _>("n")?),
            None => Ok(0),
        }
    }
}

fn ident(name: &str) -> Result<String, WarehouseError> {
    if is_identifier(name) {
        Ok(format!("`{name}`"))
    } else {
        Err(WarehouseError::Unavailable(format!("refusing identifier {name:?}")))
    }
}

/// Comment marking the `UInt8` columns that hold flags.
const FLAG_COMMENT: &str = "flag";

fn column_type(column: &Column) -> String {
    let base = match column.kind {
        ColumnKind::Bool => "UInt8",
        ColumnKind::Int => "Int64",
        ColumnKind::Float => "Float64",
        ColumnKind::Text => "String",
    };
    if column.nullable {
        format!("Nullable({base})")
    } else {
        base.to_owned()
    }
}

fn column_comment(column: &Column) -> &'static str {
    match column.kind {
        ColumnKind::Bool => FLAG_COMMENT,
        _ => "",
    }
}

/// Maps a ClickHouse type name to a column, unwrapping `Nullable` and `LowCardinality`.
/// `UInt8` is a flag only when created as one; anything that is not a
/// number or a flag is treated as text.
fn parse_column(name: &str, sql_type: &str, comment: &str) -> Column {
    let mut t = sql_type.trim();
    let mut nullable = false;
    loop {
        if let Some(inner) = t.strip_prefix("LowCardinality(").and_then(|s| s.strip_suffix(')')) {
            t = inner;
        } else if let Some(inner) = t.strip_prefix("Nullable(").and_then(|s| s.strip_suffix(')')) {
            nullable = true;
            t = inner;
        } else {
            break;
        }
    }
    let kind = if t == "Bool" || (t == "UInt8" && comment == FLAG_COMMENT) {
        ColumnKind::Bool
    } else if t.starts_with("Int") || t.starts_with("UInt") {
        ColumnKind::Int
    } else if t.starts_with("Float") || t.starts_with("Decimal") {
        ColumnKind::Float
    } else {
        ColumnKind::Text
    };
    Column {
        name: name.to_owned(),
        kind,
        nullable,
    }
}

fn create_table_sql(table: &str, schema: &TableSchema) -> Result<String, WarehouseError> {
    let columns = schema
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", ident(&c.name)?, column_type(c));
            let comment = column_comment(c);
            if !comment.is_empty() {
                def.push_str(&format!(" COMMENT '{comment}'"));
            }
            Ok(def)
        })
        .collect::<Result<Vec<_>, WarehouseError>>()?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree ORDER BY tuple()",
        ident(table)?,
        columns.join(", ")
    ))
}

fn count_sql(table: &str, filter: Option<&PartitionFilter>) -> Result<String, WarehouseError> {
    let mut sql = format!("SELECT count() AS n FROM {}", ident(table)?);
    if let Some(f) = filter {
        sql.push_str(&format!(" WHERE {} = {}", ident(&f.column)?, f.value));
    }
    Ok(sql)
}

fn copy_sql(
    source: &str,
    target: &str,
    key: &str,
    offset: u64,
    limit: u64,
) -> Result<String, WarehouseError> {
    let (source, target, key) = (ident(source)?, ident(target)?, ident(key)?);
    Ok(format!(
        "INSERT INTO {target} SELECT * FROM \
         (SELECT * FROM {source} ORDER BY {key} LIMIT {limit} OFFSET {offset}) \
         WHERE {key} NOT IN (SELECT {key} FROM {target}) LIMIT 1 BY {key}"
    ))
}

fn to_value(column: &Column, value: Scalar) -> Value {
    macro_rules! typed {
        ($v:expr) => {
            if column.nullable {
                Value::from($v)
            } else {
                Value::from($v.unwrap_or_default())
            }
        };
    }
    match column.kind {
        ColumnKind::Bool => typed!(match value {
            Scalar::Bool(b) => Some(u8::from(b)),
            _ => None,
        }),
        ColumnKind::Int => typed!(match value {
            Scalar::Int(i) => Some(i),
            _ => None,
        }),
        ColumnKind::Float => typed!(match value {
            Scalar::Float(f) => Some(f),
            _ => None,
        }),
        ColumnKind::Text => typed!(match value {
            Scalar::Text(s) => Some(s),
            _ => None,
        }),
    }
}

#[async_trait]
impl Warehouse for ClickhouseWarehouse {
    fn get_name(&self) -> String {
        String::from("clickhouse")
    }

    async fn schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
        ident(table)?;
        let sql = format!(
            "SELECT name, type, comment FROM system.columns \
             WHERE database = currentDatabase() AND table = '{table}' ORDER BY position"
        );
        let mut ch = self.pool.get_handle().await?;
        let block = ch.query(sql).fetch_all().await?;
        let mut columns = Vec::new();
        for row in block.rows() {
            let name: String = row.get("name")?;
            let sql_type: String = row.get("type")?;
            let comment: String = row.get("comment")?;
            columns.push(parse_column(&name, &sql_type, &comment));
        }
        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(TableSchema::new(columns)))
        }
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<(), WarehouseError> {
        self.execute(create_table_sql(table, schema)?).await
    }

    async fn count(
        &self,
        table: &str,
        filter: Option<&PartitionFilter>,
    ) -> Result<u64, WarehouseError> {
        self.fetch_u64(count_sql(table, filter)?).await
    }

    async fn count_distinct(&self, table: &str, column: &str) -> Result<u64, WarehouseError> {
        let sql = format!(
            "SELECT count(DISTINCT {}) AS n FROM {}",
            ident(column)?,
            ident(table)?
        );
        self.fetch_u64(sql).await
    }

    async fn count_nulls(&self, table: &str, column: &str) -> Result<u64, WarehouseError> {
        let sql = format!(
            "SELECT countIf(isNull({})) AS n FROM {}",
            ident(column)?,
            ident(table)?
        );
        self.fetch_u64(sql).await
    }

    async fn partition_counts(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<(i64, u64)>, WarehouseError> {
        let column = ident(column)?;
        let sql = format!(
            "SELECT toInt64(assumeNotNull({column})) AS p, count() AS n FROM {} \
             WHERE {column} IS NOT NULL GROUP BY p ORDER BY p",
            ident(table)?
        );
        let mut ch = self.pool.get_handle().await?;
        let block = ch.query(sql).fetch_all().await?;
        let mut counts = Vec::new();
        for row in block.rows() {
            counts.push((row.get::<i64, _>("p")?, row.get::<u64, _>("n")?));
        }
        Ok(counts)
    }

    async fn insert(
        &self,
        table: &str,
        schema: &TableSchema,
        rows: &[CanonicalRow],
    ) -> Result<(), WarehouseError> {
        if rows.is_empty() {
            return Ok(());
        }
        ident(table)?;
        let mut block = Block::with_capacity(rows.len());
        for row in rows {
            let values: Vec<(String, Value)> = layout(schema, row)
                .map(|(column, value)| (column.name.clone(), to_value(column, value)))
                .collect();
            block.push(values)?;
        }
        let mut ch = self.pool.get_handle().await?;
        ch.insert(table, block).await?;
        Ok(())
    }

    async fn create_unique_like(
        &self,
        source: &str,
        target: &str,
        _key: &str,
    ) -> Result<(), WarehouseError> {
        // MergeTree has no unique constraint; copy_ignoring_conflicts enforces it
        self.execute(format!("CREATE TABLE {} AS {}", ident(target)?, ident(source)?))
            .await
    }

    async fn copy_ignoring_conflicts(
        &self,
        source: &str,
        target: &str,
        key: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(), WarehouseError> {
        self.execute(copy_sql(source, target, key, offset, limit)?).await
    }

    async fn swap_in(&self, table: &str, replacement: &str) -> Result<(), WarehouseError> {
        let (table, replacement) = (ident(table)?, ident(replacement)?);
        self.execute(format!("EXCHANGE TABLES {table} AND {replacement}"))
            .await?;
        self.execute(format!("DROP TABLE {replacement}")).await
    }

    async fn drop_table(&self, table: &str) -> Result<(), WarehouseError> {
        self.execute(format!("DROP TABLE IF EXISTS {}", ident(table)?))
            .await
    }
}
