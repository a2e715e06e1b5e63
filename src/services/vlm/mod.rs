pub mod client;
pub mod enricher;
pub mod job_store;

pub use client::{HttpVlmClient, VlmService};
pub use enricher::VlmEnricher;
pub use job_store::VlmJobStore;
