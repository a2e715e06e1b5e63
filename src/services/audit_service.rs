//! Audit sink: one append-only row per tool invocation.
//!
//! Parameters are hashed (sha256 prefix) so no query text or PII lands in
//! the log. Delivery is best-effort - a failed insert is logged and never
//! propagates to the caller.

use sqlx::PgPool;
use std::time::Instant;

use crate::utils::params_hash;

pub struct AuditService {
    pool: PgPool,
}

impl AuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a completed tool invocation. Runs after the tool call, for
    /// successes and failures alike.
    pub async fn record(
        &self,
        user_id: Option<&str>,
        tool_name: &str,
        params: &serde_json::Value,
        result: &serde_json::Value,
        started: Instant,
    ) {
        let record_status = derive_result_status(result);
        let latency_ms = started.elapsed().as_millis() as i64;
        let hash = params_hash(params);

        let insert = sqlx::query(
            r#"
            INSERT INTO audit_log (user_id, tool_name, params_hash, result_status, latency_ms)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(tool_name)
        .bind(&hash)
        .bind(record_status)
        .bind(latency_ms)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => tracing::info!(
                "Audit captured: tool={} status={} latency={}ms",
                tool_name,
                record_status,
                latency_ms
            ),
            Err(e) => tracing::error!("Failed to write audit record: {}", e),
        }
    }
}

/// Derive the audit status by inspecting the tool result shape.
pub fn derive_result_status(result: &serde_json::Value) -> &'static str {
    match result {
        serde_json::Value::Null => "unknown",
        serde_json::Value::Object(map) => {
            if map.contains_key("error") {
                return "error";
            }
            if let Some(status) = map.get("status") {
                let status = status.as_str().unwrap_or_default().to_lowercase();
                if status.contains("not_configured") {
                    return "not_configured";
                }
                if status.contains("error") || status.contains("fail") {
                    return "error";
                }
                return "success";
            }
            "success"
        }
        serde_json::Value::Array(items) => {
            if items.is_empty() { "unknown" } else { "success" }
        }
        serde_json::Value::String(s) => {
            if s.is_empty() { "unknown" } else { "success" }
        }
        _ => "success",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_key_wins() {
        assert_eq!(derive_result_status(&json!({"error": "boom"})), "error");
        assert_eq!(
            derive_result_status(&json!({"error": "boom", "status": "success"})),
            "error"
        );
    }

    #[test]
    fn status_string_is_inspected() {
        assert_eq!(derive_result_status(&json!({"status": "llm_not_configured"})), "not_configured");
        assert_eq!(derive_result_status(&json!({"status": "failed"})), "error");
        assert_eq!(derive_result_status(&json!({"status": "error: bad input"})), "error");
        assert_eq!(derive_result_status(&json!({"status": "done"})), "success");
    }

    #[test]
    fn empty_and_plain_results() {
        assert_eq!(derive_result_status(&serde_json::Value::Null), "unknown");
        assert_eq!(derive_result_status(&json!([])), "unknown");
        assert_eq!(derive_result_status(&json!("")), "unknown");
        assert_eq!(derive_result_status(&json!(["row"])), "success");
        assert_eq!(derive_result_status(&json!({"results": []})), "success");
    }
}
