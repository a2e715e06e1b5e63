pub mod error;
pub mod hashing;
pub mod jwt;

pub use error::{ApiError, ApiResult};
pub use hashing::{canonical_json, md5_hex, params_hash};
pub use jwt::{Claims, JwtUtil};
