use embedstore_core::{
    format_vector, ColumnType, EmbedStoreError, Metadata, SearchMatch, SearchRequest, SqlValue,
    Statement,
};

use crate::dialect::{Dialect, VectorParam};
use crate::schema::{TableSchema, EMBEDDING_COLUMN, EMBEDDING_ID_COLUMN, SCORE_ALIAS, TEXT_COLUMN};

/// A similarity query plus the decode type of every selected column.
#[derive(Debug, Clone)]
pub struct PreparedSearch {
    pub statement: Statement,
    pub columns: Vec<ColumnType>,
}

/// Build the similarity query for `request`.
///
/// Selects id, vector, text (when present), every metadata column and the score,
/// keeps rows scoring at least `min_score`, best first, at most `max_results`.
pub fn build_query(
    schema: &TableSchema,
    dialect: &dyn Dialect,
    request: &SearchRequest,
) -> Result<PreparedSearch, EmbedStoreError> {
    if request.max_results == 0 {
        return Err(EmbedStoreError::Validation(
            "max_results must be > 0".to_string(),
        ));
    }
    if !request.min_score.is_finite() {
        return Err(EmbedStoreError::Validation(format!(
            "min_score must be finite, got {}",
            request.min_score
        )));
    }
    let dimension = schema.dimension();
    if dimension > 0 && request.query_vector.len() != dimension {
        return Err(EmbedStoreError::Validation(format!(
            "query vector has {} dimensions, expected {dimension}",
            request.query_vector.len()
        )));
    }
    if request.query_vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbedStoreError::Validation(
            "query vector contains a non-finite value".to_string(),
        ));
    }
    // Cosine similarity is undefined against a zero vector.
    if request.query_vector.iter().all(|v| *v == 0.0) {
        return Err(EmbedStoreError::Validation(
            "query vector must not be all zeros".to_string(),
        ));
    }

    let vector_type = ColumnType::Vector { dimension };
    let mut columns = vec![ColumnType::Identifier, vector_type.clone()];
    let mut select = vec![
        dialect.select_expr(EMBEDDING_ID_COLUMN, &ColumnType::Identifier),
        dialect.select_expr(EMBEDDING_COLUMN, &vector_type),
    ];
    if schema.has_text() {
        select.push(dialect.select_expr(TEXT_COLUMN, &ColumnType::Text));
        columns.push(ColumnType::Text);
    }
    for key in schema.metadata_keys() {
        let column_type = schema
            .column_type(&key.name)
            .cloned()
            .unwrap_or_else(|| ColumnType::from(key.kind));
        select.push(dialect.select_expr(&key.name, &column_type));
        columns.push(column_type);
    }
    select.push(format!(
        "{} AS {}",
        dialect.score_expr(EMBEDDING_COLUMN, 1),
        dialect.quote_ident(SCORE_ALIAS)
    ));
    columns.push(ColumnType::Number);

    let score = dialect.quote_ident(SCORE_ALIAS);
    let sql = format!(
        "SELECT * FROM (SELECT {} FROM {}) AS candidates WHERE {score} >= {} ORDER BY {score} DESC LIMIT {}",
        select.join(", "),
        dialect.quote_table(schema.table_name()),
        dialect.param_expr(&ColumnType::Number, 2),
        dialect.param_expr(&ColumnType::Integer, 3),
    );

    let query_vector = dialect
        .bind_vector_parameter(VectorParam::Floats(&request.query_vector))
        .unwrap_or_else(|| SqlValue::Text(format_vector(&request.query_vector)));
    let max_results = i64::try_from(request.max_results).unwrap_or(i64::MAX);

    Ok(PreparedSearch {
        statement: Statement::with_params(
            sql,
            vec![
                query_vector,
                SqlValue::Double(request.min_score),
                SqlValue::Integer(max_results),
            ],
        ),
        columns,
    })
}

/// Turn result rows into matches, applying the request's metadata filter.
pub fn map_rows(
    schema: &TableSchema,
    dialect: &dyn Dialect,
    request: &SearchRequest,
    rows: Vec<Vec<SqlValue>>,
) -> Result<Vec<SearchMatch>, EmbedStoreError> {
    let mut matches = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = row.into_iter();
        let mut next = || {
            values.next().ok_or_else(|| {
                EmbedStoreError::Search("result row has fewer columns than selected".to_string())
            })
        };

        let id = match next()? {
            SqlValue::Uuid(id) => id.to_string(),
            SqlValue::Text(id) => id,
            other => {
                return Err(EmbedStoreError::Search(format!(
                    "unexpected id value {other:?}"
                )))
            }
        };
        let embedding = match next()? {
            SqlValue::Vector(v) => v,
            SqlValue::Text(text) => dialect
                .parse_vector(&text)
                .map_err(|e| EmbedStoreError::Search(format!("malformed stored vector: {e}")))?,
            SqlValue::Null => Vec::new(),
            other => {
                return Err(EmbedStoreError::Search(format!(
                    "unexpected vector value {other:?}"
                )))
            }
        };
        let text = if schema.has_text() {
            match next()? {
                SqlValue::Null => None,
                SqlValue::Text(text) => Some(text),
                other => Some(other.to_json().to_string()),
            }
        } else {
            None
        };

        let mut metadata = Metadata::new();
        for key in schema.metadata_keys() {
            let value = next()?;
            if !value.is_null() {
                metadata.insert(key.name.clone(), value.to_json());
            }
        }

        let score = match next()? {
            SqlValue::Double(score) => score,
            SqlValue::Integer(score) => score as f64,
            other => {
                return Err(EmbedStoreError::Search(format!(
                    "unexpected score value {other:?}"
                )))
            }
        };

        if let Some(filter) = &request.filter {
            if !filter.matches(&metadata) {
                continue;
            }
        }

        matches.push(SearchMatch {
            id,
            score,
            embedding,
            text,
            metadata,
        });
    }
    Ok(matches)
}
