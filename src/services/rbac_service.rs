//! RBAC gate over protected tool invocations.
//!
//! Policies are `p, <role>, <tool>, invoke` rules loaded from static
//! configuration into a casbin enforcer with an in-memory adapter. Tools not
//! listed in the configuration are open. Roles match case-insensitively. A
//! null user context is denied only when strict mode is on.

use casbin::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::RbacConfig;
use crate::models::UserContext;
use crate::utils::{ApiError, ApiResult};

const ACTION_INVOKE: &str = "invoke";

pub struct RbacService {
    enforcer: Arc<RwLock<Enforcer>>,
    /// tool -> allowed roles (lower-cased), kept for error messages
    protected_tools: HashMap<String, Vec<String>>,
    strict: bool,
}

impl RbacService {
    /// Create the enforcer with the RBAC model declared in code and policies
    /// built from the configured tool -> roles table.
    pub async fn new(config: &RbacConfig) -> ApiResult<Self> {
        let model_str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

        let model = DefaultModel::from_str(model_str).await.map_err(|e| {
            tracing::error!("Failed to create Casbin model: {:?}", e);
            ApiError::internal_error(format!("Failed to initialize RBAC model: {}", e))
        })?;

        let adapter = MemoryAdapter::default();
        let mut enforcer = Enforcer::new(model, adapter).await.map_err(|e| {
            tracing::error!("Failed to create Casbin enforcer: {:?}", e);
            ApiError::internal_error(format!("Failed to initialize RBAC enforcer: {}", e))
        })?;

        let mut protected_tools = HashMap::new();
        for (tool, roles) in &config.protected_tools {
            let normalized: Vec<String> = roles.iter().map(|r| r.to_lowercase()).collect();
            for role in &normalized {
                enforcer
                    .add_policy(vec![
                        role.clone(),
                        tool.clone(),
                        ACTION_INVOKE.to_string(),
                    ])
                    .await
                    .map_err(|e| {
                        ApiError::internal_error(format!("Failed to add policy: {}", e))
                    })?;
            }
            protected_tools.insert(tool.clone(), normalized);
        }

        tracing::info!(
            "RBAC gate initialized: {} protected tools, strict={}",
            protected_tools.len(),
            config.strict
        );

        Ok(Self {
            enforcer: Arc::new(RwLock::new(enforcer)),
            protected_tools,
            strict: config.strict,
        })
    }

    pub fn is_protected(&self, tool_name: &str) -> bool {
        self.protected_tools.contains_key(tool_name)
    }

    /// Gate one tool invocation. Returns the denial as a first-class error so
    /// callers surface it instead of a generic failure.
    pub async fn authorize(
        &self,
        tool_name: &str,
        user: Option<&UserContext>,
    ) -> ApiResult<()> {
        let Some(allowed) = self.protected_tools.get(tool_name) else {
            return Ok(());
        };

        let Some(user) = user else {
            if self.strict {
                tracing::warn!(
                    "Denied anonymous invocation of protected tool '{}' (strict mode)",
                    tool_name
                );
                return Err(self.denial(tool_name, allowed));
            }
            return Ok(());
        };

        let enforcer = self.enforcer.read().await;
        for role in &user.roles {
            let permitted = enforcer
                .enforce(vec![
                    role.to_lowercase(),
                    tool_name.to_string(),
                    ACTION_INVOKE.to_string(),
                ])
                .map_err(|e| {
                    tracing::error!("Casbin enforce error: {:?}", e);
                    ApiError::internal_error(format!("Permission check failed: {}", e))
                })?;
            if permitted {
                return Ok(());
            }
        }

        tracing::warn!(
            "Denied user {} on tool '{}' (roles: {:?})",
            user.user_id,
            tool_name,
            user.roles
        );
        Err(self.denial(tool_name, allowed))
    }

    fn denial(&self, tool_name: &str, allowed: &[String]) -> ApiError {
        ApiError::PermissionDenied { tool: tool_name.to_string(), required: allowed.join(", ") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strict: bool) -> RbacConfig {
        let mut protected_tools = HashMap::new();
        protected_tools.insert(
            "get_financial_summary".to_string(),
            vec!["admin".to_string(), "finance".to_string()],
        );
        RbacConfig { strict, protected_tools }
    }

    fn user(roles: &[&str]) -> UserContext {
        UserContext {
            user_id: "alice@company.com".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            org_id: Some("org_001".into()),
        }
    }

    #[tokio::test]
    async fn finance_role_is_authorized() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        assert!(
            gate.authorize("get_financial_summary", Some(&user(&["finance"])))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn viewer_role_is_denied() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        let err = gate
            .authorize("get_financial_summary", Some(&user(&["viewer"])))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn unprotected_tools_are_open() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        assert!(!gate.is_protected("query_knowledge_base"));
        assert!(gate.authorize("query_knowledge_base", None).await.is_ok());
    }

    #[tokio::test]
    async fn strict_mode_denies_anonymous_protected_calls() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        assert!(gate.authorize("get_financial_summary", None).await.is_err());

        let relaxed = RbacService::new(&config(false)).await.unwrap();
        assert!(relaxed.authorize("get_financial_summary", None).await.is_ok());
    }

    #[tokio::test]
    async fn roles_match_case_insensitively() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        assert!(
            gate.authorize("get_financial_summary", Some(&user(&["FINANCE", "Admin"])))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn multiple_unrelated_roles_are_denied() {
        let gate = RbacService::new(&config(true)).await.unwrap();
        assert!(
            gate.authorize("get_financial_summary", Some(&user(&["procurement", "viewer"])))
                .await
                .is_err()
        );
    }
}
