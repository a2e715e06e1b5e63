// RBAC denial surfaced as a first-class error plus the audit-side view of it.

use std::collections::HashMap;

use crate::config::RbacConfig;
use crate::models::UserContext;
use crate::services::RbacService;
use crate::services::audit_service::derive_result_status;
use crate::utils::{ApiError, params_hash};

fn config() -> RbacConfig {
    let mut protected_tools = HashMap::new();
    protected_tools.insert(
        "get_financial_summary".to_string(),
        vec!["admin".to_string(), "finance".to_string()],
    );
    RbacConfig { strict: true, protected_tools }
}

#[tokio::test]
async fn denied_invocation_audits_as_error() {
    let gate = RbacService::new(&config()).await.unwrap();
    let viewer = UserContext {
        user_id: "bob@company.com".into(),
        roles: vec!["viewer".into()],
        org_id: Some("org_001".into()),
    };

    let denial = gate
        .authorize("get_financial_summary", Some(&viewer))
        .await
        .unwrap_err();

    // the denial names the tool and required roles, not a generic 500
    let ApiError::PermissionDenied { tool, required } = &denial else {
        panic!("expected PermissionDenied, got {:?}", denial);
    };
    assert_eq!(tool, "get_financial_summary");
    assert!(required.contains("finance"));
    assert_eq!(denial.error_code(), 1002);

    // the audit record derives an error status from the denial result
    let result = serde_json::json!({"error": denial.to_string()});
    assert_eq!(derive_result_status(&result), "error");

    let hash = params_hash(&serde_json::json!({"period": "Q4"}));
    assert_eq!(hash.len(), 16);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn granted_invocation_audits_as_success() {
    let gate = RbacService::new(&config()).await.unwrap();
    let finance = UserContext {
        user_id: "alice@company.com".into(),
        roles: vec!["finance".into()],
        org_id: Some("org_001".into()),
    };

    assert!(
        gate.authorize("get_financial_summary", Some(&finance))
            .await
            .is_ok()
    );

    let result = serde_json::json!({"total_found": 3, "results": []});
    assert_eq!(derive_result_status(&result), "success");
}
