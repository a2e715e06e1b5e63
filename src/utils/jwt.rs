use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult};

/// Claims carried by caller-supplied bearer tokens.
///
/// The engine does not issue tokens; an upstream identity provider does.
/// We only verify the signature and lift the claims into a UserContext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier
    pub sub: String,
    /// Role names, matched case-insensitively by the RBAC gate
    #[serde(default)]
    pub roles: Vec<String>,
    /// Organization identifier
    #[serde(default)]
    pub org_id: Option<String>,
    /// Expiration timestamp (seconds since epoch)
    pub exp: i64,
}

pub struct JwtUtil {
    decoding_key: DecodingKey,
}

impl JwtUtil {
    pub fn new(secret: &str) -> Self {
        Self { decoding_key: DecodingKey::from_secret(secret.as_bytes()) }
    }

    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| ApiError::unauthorized(format!("JWT verification failed: {}", e)))?;
        Ok(data.claims)
    }
}
