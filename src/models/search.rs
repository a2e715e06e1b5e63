//! Search request / response model
//!
//! Result payloads are closed tagged variants (case / issue / sql_row), not
//! free-form maps; SQL rows keep their dynamic columns behind a flatten.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::case::{Severity, UserContext};

// ============================================================================
// Intent and modes
// ============================================================================

/// Query intent from the expander
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Structured,
    Semantic,
    Hybrid,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "STRUCTURED",
            Self::Semantic => "SEMANTIC",
            Self::Hybrid => "HYBRID",
        }
    }
}

/// Top-level search mode; AUTO resolves to the detected intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchMode {
    Auto,
    Structured,
    Semantic,
    Hybrid,
}

impl Default for SearchMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Structured => "STRUCTURED",
            Self::Semantic => "SEMANTIC",
            Self::Hybrid => "HYBRID",
        }
    }
}

impl From<Intent> for SearchMode {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::Structured => Self::Structured,
            Intent::Semantic => Self::Semantic,
            Intent::Hybrid => Self::Hybrid,
        }
    }
}

/// Vector search granularity inside the semantic searcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    CaseLevel,
    IssueLevel,
    Hybrid,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaseLevel => "CASE_LEVEL",
            Self::IssueLevel => "ISSUE_LEVEL",
            Self::Hybrid => "HYBRID",
        }
    }
}

// ============================================================================
// Query expansion
// ============================================================================

/// One synonym replacement applied during expansion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SynonymUse {
    pub surface: String,
    pub canonical: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Expansion {
    pub original: String,
    pub cleaned: String,
    pub expanded: String,
    pub intent: Intent,
    pub synonyms_used: Vec<SynonymUse>,
    pub confidence: f64,
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_version: Option<String>,
    /// Matches result_t1 (OK/NG)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.part_number.is_none()
            && self.material.is_none()
            && self.trial_version.is_none()
            && self.result.is_none()
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Structured,
    Semantic,
}

impl SearchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CaseHit {
    pub case_id: String,
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub total_issues: Option<i64>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub text_summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct IssueHit {
    pub issue_id: String,
    pub case_id: String,
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub trial_version: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub result_t1: Option<String>,
    #[serde(default)]
    pub result_t2: Option<String>,
    #[serde(default)]
    pub defect_types: Vec<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub has_images: bool,
    #[serde(default)]
    pub image_count: i64,
    #[serde(default)]
    pub vl_descriptions: Vec<String>,
}

/// One row out of a generated SELECT, columns preserved as-is
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SqlRowHit {
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub columns: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchItem {
    Case(CaseHit),
    Issue(IssueHit),
    SqlRow(SqlRowHit),
}

impl SearchItem {
    /// Dedup key across retrievers: issue_id, else case_id, else a hash of
    /// the problem text / row content.
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Issue(hit) => hit.issue_id.clone(),
            Self::Case(hit) => hit.case_id.clone(),
            Self::SqlRow(hit) => {
                if let Some(serde_json::Value::String(id)) = hit.columns.get("issue_id") {
                    return id.clone();
                }
                if let Some(serde_json::Value::String(id)) = hit.columns.get("case_id") {
                    return id.clone();
                }
                let body = hit
                    .columns
                    .get("problem")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| serde_json::Value::Object(hit.columns.clone()).to_string());
                crate::utils::md5_hex(&body)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RankedResult {
    #[serde(flatten)]
    pub item: SearchItem,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SearchSource>,
}

// ============================================================================
// SQL generation / execution
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SqlGeneration {
    #[serde(default)]
    pub sql: Option<String>,
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tables_used: Vec<String>,
    #[serde(default)]
    pub context_used: Vec<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SqlExecution {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub total_count: i64,
}

// ============================================================================
// API request / response
// ============================================================================

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default = "default_top_k")]
    #[validate(range(min = 1, max = 100))]
    pub top_k: usize,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
    #[serde(default)]
    pub return_sql: bool,
    /// Identity of the caller; normally injected by the auth middleware
    #[serde(default)]
    pub user_context: Option<UserContext>,
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueryResponse {
    pub query: String,
    pub expanded_query: String,
    pub mode: SearchMode,
    pub intent_confidence: f64,
    pub synonyms_used: Vec<SynonymUse>,
    pub total_found: usize,
    pub results: Vec<RankedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when a dependency degraded the response (e.g. reranker down)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub _cached_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub relational: serde_json::Value,
    pub vector: serde_json::Value,
    pub cache: serde_json::Value,
}
