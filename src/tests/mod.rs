mod common;

mod enricher_test;
mod expander_test;
mod rbac_audit_test;
