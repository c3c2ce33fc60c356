//! Batch upserts: delete by natural key, then insert.

use embedstore_core::{
    format_vector, ColumnType, EmbedStoreError, MetaDataKey, SqlValue, Statement, TextSegment,
};
use serde_json::Value;
use uuid::Uuid;

use crate::dialect::{Dialect, VectorParam};
use crate::schema::{TableSchema, EMBEDDING_COLUMN, EMBEDDING_ID_COLUMN, TEXT_COLUMN};

/// Build the statements for one `add_all` call.
///
/// Returns an empty list for empty input. Every statement must run in the same
/// unit of work.
pub fn plan_upsert(
    schema: &TableSchema,
    dialect: &dyn Dialect,
    ids: &[String],
    vectors: &[Vec<f32>],
    segments: Option<&[TextSegment]>,
) -> Result<Vec<Statement>, EmbedStoreError> {
    if ids.len() != vectors.len() {
        return Err(EmbedStoreError::Validation(format!(
            "got {} ids but {} vectors",
            ids.len(),
            vectors.len()
        )));
    }
    if let Some(segments) = segments {
        if segments.len() != ids.len() {
            return Err(EmbedStoreError::Validation(format!(
                "got {} ids but {} segments",
                ids.len(),
                segments.len()
            )));
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let keys = schema.metadata_keys();
    let natural_key: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, key)| key.is_natural_key())
        .map(|(i, _)| i)
        .collect();

    let mut rows = Vec::with_capacity(ids.len());
    for (i, (id, vector)) in ids.iter().zip(vectors).enumerate() {
        let segment = segments.map(|s| &s[i]);
        rows.push(build_row(schema, dialect, id, vector, segment)?);
    }

    let mut statements = Vec::new();

    if !schema.was_just_created() && !natural_key.is_empty() {
        let delete_sql = delete_sql(schema, dialect, &natural_key);
        let mut seen: Vec<Vec<SqlValue>> = Vec::new();
        for row in &rows {
            let values: Vec<SqlValue> = natural_key
                .iter()
                .map(|&k| row.metadata[k].clone())
                .collect();
            // `=` never matches NULL, so a partial key cannot identify a row.
            if values.iter().any(SqlValue::is_null) || seen.contains(&values) {
                continue;
            }
            seen.push(values.clone());
            statements.push(Statement::with_params(delete_sql.clone(), values));
        }
    }

    let insert_sql = insert_sql(schema, dialect);
    for row in rows {
        let mut params = Vec::with_capacity(2 + row.metadata.len() + 1);
        params.push(row.id);
        params.push(row.vector);
        params.extend(row.metadata);
        if let Some(text) = row.text {
            params.push(text);
        }
        statements.push(Statement::with_params(insert_sql.clone(), params));
    }

    Ok(statements)
}

struct Row {
    id: SqlValue,
    vector: SqlValue,
    metadata: Vec<SqlValue>,
    /// `None` when the table has no text column.
    text: Option<SqlValue>,
}

fn build_row(
    schema: &TableSchema,
    dialect: &dyn Dialect,
    id: &str,
    vector: &[f32],
    segment: Option<&TextSegment>,
) -> Result<Row, EmbedStoreError> {
    let id = Uuid::parse_str(id).map_err(|e| {
        EmbedStoreError::Validation(format!("id '{id}' is not a UUID: {e}"))
    })?;

    let dimension = schema.dimension();
    if dimension > 0 && vector.len() != dimension {
        return Err(EmbedStoreError::Validation(format!(
            "vector for id '{id}' has {} dimensions, expected {dimension}",
            vector.len()
        )));
    }
    let vector = dialect
        .bind_vector_parameter(VectorParam::Floats(vector))
        .unwrap_or_else(|| SqlValue::Text(format_vector(vector)));

    let metadata = schema
        .metadata_keys()
        .iter()
        .map(|key| {
            let value = segment.and_then(|s| s.metadata.get(&key.name));
            coerce_metadata(key, &metadata_column_type(schema, key), value)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let text = schema.has_text().then(|| match segment {
        Some(segment) => SqlValue::Text(segment.text.clone()),
        None => SqlValue::Null,
    });

    Ok(Row {
        id: SqlValue::Uuid(id),
        vector,
        metadata,
        text,
    })
}

/// Coerce a metadata value into a parameter for a column of `column_type`.
///
/// A missing key and JSON `null` both become SQL `NULL`.
pub fn coerce_metadata(
    key: &MetaDataKey,
    column_type: &ColumnType,
    value: Option<&Value>,
) -> Result<SqlValue, EmbedStoreError> {
    let column = key.name.as_str();
    let value = match value {
        None | Some(Value::Null) if key.allow_null => return Ok(SqlValue::Null),
        None | Some(Value::Null) => {
            return Err(EmbedStoreError::Validation(format!(
                "metadata column '{column}' does not allow null"
            )));
        }
        Some(value) => value,
    };
    let mismatch = || {
        EmbedStoreError::Validation(format!(
            "cannot store {value} in metadata column '{column}' of type {column_type}"
        ))
    };

    match column_type {
        ColumnType::Text => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            _ => Err(mismatch()),
        },
        ColumnType::Number => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::Double).ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(SqlValue::Double)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(SqlValue::Integer)
                .ok_or_else(mismatch),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnType::Identifier => match value {
            Value::String(s) => Uuid::parse_str(s.trim())
                .map(SqlValue::Uuid)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ColumnType::DateTime => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            _ => Err(mismatch()),
        },
        ColumnType::Vector { .. } | ColumnType::Other { .. } => {
            Err(EmbedStoreError::Validation(format!(
                "metadata column '{column}' has unsupported type {column_type}"
            )))
        }
    }
}

fn metadata_column_type(schema: &TableSchema, key: &MetaDataKey) -> ColumnType {
    schema
        .column_type(&key.name)
        .cloned()
        .unwrap_or_else(|| ColumnType::from(key.kind))
}

fn delete_sql(schema: &TableSchema, dialect: &dyn Dialect, natural_key: &[usize]) -> String {
    let keys = schema.metadata_keys();
    let predicates: Vec<String> = natural_key
        .iter()
        .enumerate()
        .map(|(n, &k)| {
            let key = &keys[k];
            format!(
                "{} = {}",
                dialect.quote_ident(&key.name),
                dialect.param_expr(&metadata_column_type(schema, key), n + 1)
            )
        })
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote_table(schema.table_name()),
        predicates.join(" AND ")
    )
}

fn insert_sql(schema: &TableSchema, dialect: &dyn Dialect) -> String {
    let mut columns = vec![
        (EMBEDDING_ID_COLUMN.to_string(), ColumnType::Identifier),
        (
            EMBEDDING_COLUMN.to_string(),
            ColumnType::Vector {
                dimension: schema.dimension(),
            },
        ),
    ];
    for key in schema.metadata_keys() {
        columns.push((key.name.clone(), metadata_column_type(schema, key)));
    }
    if schema.has_text() {
        columns.push((TEXT_COLUMN.to_string(), ColumnType::Text));
    }

    let names: Vec<String> = columns
        .iter()
        .map(|(name, _)| dialect.quote_ident(name))
        .collect();
    let params: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (_, column_type))| dialect.param_expr(column_type, i + 1))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_table(schema.table_name()),
        names.join(", "),
        params.join(", ")
    )
}
