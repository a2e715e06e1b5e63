pub mod case;
pub mod search;
pub mod vlm;

pub use case::{
    Anchor, AnchorType, Case, CaseMetadata, ImageRef, Issue, Learning, MappingMethod,
    MappingStatus, MappingStatusCounts, MappingValidation, Severity, SpatialMatch,
    SpatialMatchKind, Synonym, UserContext, ValidatedQuery, ValidationStatus, ValidationSummary,
    VlAnalysis, EMU_PER_INCH,
};
pub use search::{
    CaseHit, Expansion, Granularity, Intent, IssueHit, QueryRequest, QueryResponse, RankedResult,
    SearchFilters, SearchItem, SearchMode, SearchSource, SqlExecution, SqlGeneration, SqlRowHit,
    StatsResponse, SynonymUse,
};
pub use vlm::{
    JobStatus, MappingContext, MappingImage, MappingRow, MappingVerdict, VlmHealth,
    VlmJobOptions, VlmJobResponse, VlmJobStatus, VlmResult, VlmWebhookPayload,
};
