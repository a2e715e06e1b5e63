//! Text-to-SQL generation with layered context.
//!
//! The prompt is assembled from six layers: static table schemas, business
//! rules, similar validated queries, defect synonym mappings, learnings, and
//! (on demand) runtime introspection. Generated SQL passes a conservative
//! static safety check and an EXPLAIN round before anything executes; the
//! check intentionally rejects forbidden tokens even inside string literals.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::{SqlExecution, SqlGeneration};
use crate::services::knowledge::KnowledgeRepository;
use crate::services::llm::{LlmService, extract_json};
use crate::utils::ApiResult;

static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bDROP\b",
        r"\bDELETE\b",
        r"\bTRUNCATE\b",
        r"\bINSERT\b",
        r"\bUPDATE\b",
        r"\bALTER\b",
        r"\bCREATE\b",
        r"\bGRANT\b",
        r"\bREVOKE\b",
        r"--",
        r";.*;",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("valid pattern"))
    .collect()
});

static TABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+(\w+)").expect("valid pattern"));

static SELECT_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)SELECT\s+.+?(?:;|$)").expect("valid pattern"));

// ============================================================================
// Static knowledge files
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    #[serde(default)]
    pub table_description: Option<String>,
    #[serde(default)]
    pub columns: Vec<SchemaColumn>,
    #[serde(default)]
    pub data_quality_notes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub important: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusinessRules {
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub common_gotchas: Vec<Gotcha>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Gotcha {
    pub issue: String,
    #[serde(default)]
    pub solution: Option<String>,
}

// ============================================================================
// Generator
// ============================================================================

pub struct TextToSqlGenerator {
    pool: PgPool,
    llm: Arc<dyn LlmService>,
    knowledge: Arc<KnowledgeRepository>,
    table_schemas: Vec<TableSchema>,
    business_rules: BusinessRules,
}

impl TextToSqlGenerator {
    pub fn new(
        pool: PgPool,
        llm: Arc<dyn LlmService>,
        knowledge: Arc<KnowledgeRepository>,
        knowledge_dir: impl Into<PathBuf>,
    ) -> Self {
        let knowledge_dir = knowledge_dir.into();
        let table_schemas = load_table_schemas(&knowledge_dir);
        let business_rules = load_business_rules(&knowledge_dir);
        tracing::info!("Loaded {} table schemas", table_schemas.len());

        Self { pool, llm, knowledge, table_schemas, business_rules }
    }

    /// Generate SQL for a natural-language question.
    pub async fn generate(&self, question: &str, expanded: Option<&str>) -> SqlGeneration {
        let query = expanded.unwrap_or(question);

        let (context, context_used) = self.build_context(query).await;
        let (sql, explanation) = self.generate_with_llm(question, &context).await;

        let static_check = validate_sql_static(&sql);
        let validation = match static_check {
            Ok(()) => self.validate_with_explain(&sql).await,
            Err(e) => Err(e),
        };

        match validation {
            Ok(()) => SqlGeneration {
                tables_used: extract_tables(&sql),
                sql: Some(sql),
                valid: true,
                error: None,
                context_used,
                explanation,
            },
            Err(error) => SqlGeneration {
                sql: None,
                valid: false,
                error: Some(error),
                tables_used: Vec::new(),
                context_used,
                explanation,
            },
        }
    }

    /// Execute a validated SELECT, fetching at most `limit` rows plus the
    /// unclamped total count.
    pub async fn execute(&self, sql: &str, limit: usize) -> ApiResult<SqlExecution> {
        let sql = sql.trim().trim_end_matches(';').trim();

        validate_sql_static(sql).map_err(crate::utils::ApiError::sql_safety_violation)?;
        self.validate_with_explain(sql)
            .await
            .map_err(crate::utils::ApiError::invalid_sql)?;

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let total_count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM ({}) AS subq", sql))
                .fetch_one(&self.pool)
                .await?;

        let values: Vec<Vec<serde_json::Value>> =
            rows.iter().take(limit).map(row_to_values).collect();
        let row_count = values.len();

        Ok(SqlExecution { columns, rows: values, row_count, total_count })
    }

    // ========================================================================
    // Context layers
    // ========================================================================

    async fn build_context(&self, query: &str) -> (String, Vec<String>) {
        let mut sections = Vec::new();
        let mut used = Vec::new();

        sections.push(self.format_table_schemas());
        used.push("table_schemas".to_string());

        sections.push(self.format_business_rules());
        used.push("business_rules".to_string());

        if let Some(similar) = self.format_similar_queries(query).await {
            sections.push(similar);
            used.push("similar_queries".to_string());
        }

        if let Some(synonyms) = self.format_synonym_mappings(query).await {
            sections.push(synonyms);
            used.push("synonyms".to_string());
        }

        if let Some(learnings) = self.format_learnings().await {
            sections.push(learnings);
            used.push("learnings".to_string());
        }

        (sections.join("\n\n"), used)
    }

    /// Layer 1: table schemas from static JSON files
    fn format_table_schemas(&self) -> String {
        if self.table_schemas.is_empty() {
            return "No table schemas available.".to_string();
        }

        let mut lines = vec!["## Available Tables".to_string(), String::new()];
        for schema in &self.table_schemas {
            lines.push(format!("### {}", schema.table_name));
            if let Some(description) = &schema.table_description {
                lines.push(description.clone());
            }

            let important: Vec<&SchemaColumn> =
                schema.columns.iter().filter(|c| c.important).collect();
            if !important.is_empty() {
                lines.push("\n**Key Columns:**".to_string());
                for col in important {
                    lines.push(format!(
                        "- `{}` ({}): {}",
                        col.name,
                        col.column_type,
                        col.description.as_deref().unwrap_or("")
                    ));
                }
            }

            if !schema.data_quality_notes.is_empty() {
                lines.push("\n**Data Quality Notes:**".to_string());
                for note in &schema.data_quality_notes {
                    lines.push(format!("- {}", note));
                }
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    /// Layer 2: business rules and gotchas
    fn format_business_rules(&self) -> String {
        let mut lines = vec!["## Business Rules".to_string(), String::new()];
        for rule in &self.business_rules.business_rules {
            lines.push(format!("- {}", rule));
        }
        if !self.business_rules.common_gotchas.is_empty() {
            lines.push(String::new());
            lines.push("## Common Gotchas".to_string());
            lines.push(String::new());
            for gotcha in &self.business_rules.common_gotchas {
                lines.push(format!("**{}**", gotcha.issue));
                if let Some(solution) = &gotcha.solution {
                    lines.push(format!("  Solution: {}", solution));
                }
            }
        }
        lines.join("\n")
    }

    /// Layer 3: up to 3 validated queries by word overlap with the question
    async fn format_similar_queries(&self, question: &str) -> Option<String> {
        let queries = match self.knowledge.load_validated_queries().await {
            Ok(queries) => queries,
            Err(e) => {
                tracing::debug!("No validated queries available: {}", e);
                return None;
            }
        };

        let similar = rank_by_word_overlap(question, &queries, 3);
        if similar.is_empty() {
            return None;
        }

        let mut lines = vec!["## Similar Validated Queries".to_string(), String::new()];
        for query in similar {
            lines.push(format!("**Q:** {}", query.question));
            lines.push(format!("```sql\n{}\n```\n", query.sql_query.trim()));
        }
        Some(lines.join("\n"))
    }

    /// Layer 4: defect synonym groups appearing in the query
    async fn format_synonym_mappings(&self, query: &str) -> Option<String> {
        let groups = match self.knowledge.defect_synonym_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!("Failed to get synonyms: {}", e);
                return None;
            }
        };

        let relevant: Vec<(String, Vec<String>)> = groups
            .into_iter()
            .filter(|(canonical, synonyms)| {
                query.contains(canonical.as_str())
                    || synonyms.iter().any(|s| query.contains(s.as_str()))
            })
            .collect();

        if relevant.is_empty() {
            return None;
        }

        let mut lines = vec![
            "## Relevant Synonyms".to_string(),
            String::new(),
            "These terms are equivalent in the database:".to_string(),
        ];
        for (canonical, synonyms) in relevant {
            lines.push(format!("- **{}**: {}", canonical, synonyms.join(", ")));
        }
        Some(lines.join("\n"))
    }

    /// Layer 5: top learnings by usage
    async fn format_learnings(&self) -> Option<String> {
        let learnings = match self.knowledge.top_learnings(3).await {
            Ok(learnings) => learnings,
            Err(e) => {
                tracing::debug!("No learnings available: {}", e);
                return None;
            }
        };
        if learnings.is_empty() {
            return None;
        }

        let mut lines = vec!["## Learnings (Past Mistakes to Avoid)".to_string(), String::new()];
        for learning in learnings {
            lines.push(format!("**{}**: {}", learning.title, learning.learning));
        }
        Some(lines.join("\n"))
    }

    /// Layer 6: runtime introspection of a table, used on demand
    pub async fn introspect_table(&self, table_name: &str) -> ApiResult<serde_json::Value> {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name, data_type, is_nullable
            FROM information_schema.columns
            WHERE table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(serde_json::json!({
            "table_name": table_name,
            "columns": columns
                .into_iter()
                .map(|(name, data_type, nullable)| serde_json::json!({
                    "name": name,
                    "type": data_type,
                    "nullable": nullable,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    // ========================================================================
    // LLM generation
    // ========================================================================

    async fn generate_with_llm(&self, question: &str, context: &str) -> (String, Option<String>) {
        let prompt = format!(
            r#"你是一个SQL专家，专门为故障排除数据库生成查询。

{context}

## SQL 规则
- 只生成 SELECT 查询，禁止 DROP/DELETE/UPDATE/INSERT
- 使用 LIMIT 50 防止返回过多结果
- 对于数组字段（如 defect_types），使用 @> 操作符
- 结果状态判断用 result_t1 = 'OK' OR result_t2 = 'OK'
- 中文字符串使用单引号

## 用户问题
{question}

请生成SQL查询。只返回JSON格式:
{{"sql": "SELECT ...", "explanation": "简短解释查询逻辑"}}"#
        );

        match self.llm.complete(&prompt, 500).await {
            Ok(content) => {
                if let Some(value) = extract_json(&content) {
                    let sql = value
                        .get("sql")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let explanation = value
                        .get("explanation")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    if !sql.is_empty() {
                        return (sql, explanation);
                    }
                }
                // not strict JSON; salvage the first SELECT statement
                if let Some(found) = SELECT_FALLBACK.find(&content) {
                    return (found.as_str().trim_end_matches(';').to_string(), None);
                }
                (String::new(), None)
            }
            Err(e) => {
                tracing::error!("LLM SQL generation failed: {}", e);
                (String::new(), None)
            }
        }
    }

    async fn validate_with_explain(&self, sql: &str) -> Result<(), String> {
        sqlx::query(&format!("EXPLAIN {}", sql))
            .fetch_all(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Conservative safety screen. Forbidden tokens are rejected wherever they
/// appear, including inside string literals.
pub fn validate_sql_static(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("Empty SQL".to_string());
    }

    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return Err(format!("Dangerous SQL pattern detected: {}", pattern.as_str()));
        }
    }

    if !trimmed.to_uppercase().starts_with("SELECT") {
        return Err("Only SELECT queries are allowed".to_string());
    }

    Ok(())
}

/// Table names referenced after FROM / JOIN, deduplicated
pub fn extract_tables(sql: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    for capture in TABLE_PATTERN.captures_iter(sql) {
        let table = capture[1].to_string();
        if seen.insert(table.clone()) {
            tables.push(table);
        }
    }
    tables
}

/// Whitespace-token overlap ranking for validated queries. Placeholder for
/// embedding similarity once query embeddings land in the knowledge table.
fn rank_by_word_overlap<'a>(
    question: &str,
    queries: &'a [crate::models::ValidatedQuery],
    limit: usize,
) -> Vec<&'a crate::models::ValidatedQuery> {
    let question_lower = question.to_lowercase();
    let words: Vec<&str> = question_lower.split_whitespace().collect();

    let mut scored: Vec<(usize, &crate::models::ValidatedQuery)> = queries
        .iter()
        .filter_map(|query| {
            let candidate = query.question.to_lowercase();
            let overlap = words.iter().filter(|w| candidate.contains(**w)).count();
            (overlap > 0).then_some((overlap, query))
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, q)| q).collect()
}

fn row_to_values(row: &PgRow) -> Vec<serde_json::Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| decode_column(row, i, column.type_info().name()))
        .collect()
}

/// Decode a column by type name; anything undecodable becomes null rather
/// than failing the whole result set.
fn decode_column(row: &PgRow, index: usize, type_name: &str) -> serde_json::Value {
    match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::from(v as f64))
            .unwrap_or(serde_json::Value::Null),
        "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Option<Vec<String>>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::String(v.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}

fn load_table_schemas(knowledge_dir: &std::path::Path) -> Vec<TableSchema> {
    let tables_dir = knowledge_dir.join("tables");
    let mut schemas = Vec::new();

    let Ok(entries) = std::fs::read_dir(&tables_dir) else {
        tracing::warn!("Tables directory not found: {}", tables_dir.display());
        return schemas;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| serde_json::from_str::<TableSchema>(&content).map_err(Into::into))
        {
            Ok(schema) => schemas.push(schema),
            Err(e) => tracing::error!("Failed to load {}: {}", path.display(), e),
        }
    }

    schemas.sort_by(|a, b| a.table_name.cmp(&b.table_name));
    schemas
}

fn load_business_rules(knowledge_dir: &std::path::Path) -> BusinessRules {
    let business_dir = knowledge_dir.join("business");
    let mut rules = BusinessRules::default();

    let Ok(entries) = std::fs::read_dir(&business_dir) else {
        tracing::warn!("Business directory not found: {}", business_dir.display());
        return rules;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                serde_json::from_str::<BusinessRules>(&content).map_err(Into::into)
            }) {
            Ok(mut loaded) => {
                rules.business_rules.append(&mut loaded.business_rules);
                rules.common_gotchas.append(&mut loaded.common_gotchas);
            }
            Err(e) => tracing::error!("Failed to load {}: {}", path.display(), e),
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_queries_pass_static_validation() {
        assert!(validate_sql_static("SELECT COUNT(*) FROM troubleshooting_issues").is_ok());
        assert!(
            validate_sql_static(
                "select issue_id, problem from troubleshooting_issues limit 50"
            )
            .is_ok()
        );
    }

    #[test]
    fn mutating_statements_are_rejected() {
        assert!(validate_sql_static("DROP TABLE troubleshooting_cases").is_err());
        assert!(validate_sql_static("DELETE FROM troubleshooting_issues").is_err());
        assert!(validate_sql_static("UPDATE troubleshooting_issues SET problem = ''").is_err());
        assert!(validate_sql_static("").is_err());
        assert!(validate_sql_static("EXPLAIN SELECT 1").is_err());
    }

    #[test]
    fn comments_and_stacked_statements_are_rejected() {
        assert!(validate_sql_static("SELECT 1 -- sneaky").is_err());
        assert!(validate_sql_static("SELECT 1; SELECT 2;").is_err());
    }

    #[test]
    fn forbidden_tokens_inside_literals_still_reject() {
        // intentionally conservative policy
        assert!(
            validate_sql_static("SELECT * FROM troubleshooting_issues WHERE problem = 'DELETE'")
                .is_err()
        );
    }

    #[test]
    fn tables_extracted_from_from_and_join() {
        let sql = "SELECT * FROM troubleshooting_issues i \
                   JOIN troubleshooting_cases c ON c.case_id = i.case_id \
                   WHERE i.case_id IN (SELECT case_id FROM troubleshooting_cases)";
        let tables = extract_tables(sql);
        assert_eq!(tables, vec!["troubleshooting_issues", "troubleshooting_cases"]);
    }

    #[test]
    fn word_overlap_ranks_most_similar_first() {
        let queries = vec![
            crate::models::ValidatedQuery {
                name: "count_defects".into(),
                question: "how many defect issues".into(),
                sql_query: "SELECT COUNT(*) FROM troubleshooting_issues".into(),
                tables_used: vec![],
                summary: None,
            },
            crate::models::ValidatedQuery {
                name: "list_cases".into(),
                question: "list all cases".into(),
                sql_query: "SELECT * FROM troubleshooting_cases".into(),
                tables_used: vec![],
                summary: None,
            },
        ];

        let ranked = rank_by_word_overlap("how many issues", &queries, 3);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "count_defects");
    }
}
