pub mod case;
pub mod query;
pub mod vlm_webhook;
