use std::time::Duration;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::CurrentUser;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    // user id as decimal string
    pub sub: String,
    // expiry (unix timestamp seconds)
    pub exp: usize,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Deserialize)]
struct ValidateTokenResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    username: Option<String>,
}

/// Resolves a bearer token to the calling user.
///
/// `Ok(None)` means the token was rejected; `Err` means the answer is unknown
/// because the user service could not be asked.
#[derive(Clone)]
pub enum TokenVerifier {
    Remote { http: Client, base_url: String },
    Jwt { secret: String },
}

impl TokenVerifier {
    pub fn remote(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(5)).build()?;

        Ok(TokenVerifier::Remote {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn jwt(secret: impl Into<String>) -> Self {
        TokenVerifier::Jwt { secret: secret.into() }
    }

    pub async fn verify(&self, token: &str) -> Result<Option<CurrentUser>, AuthError> {
        match self {
            TokenVerifier::Jwt { secret } => Ok(verify_jwt(secret, token)),
            TokenVerifier::Remote { http, base_url } => {
                let res = http
                    .post(format!("{base_url}/validate-token"))
                    .json(&json!({ "token": token }))
                    .send()
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "user service unreachable");
                        AuthError::Unavailable(e.to_string())
                    })?;

                if !res.status().is_success() {
                    tracing::warn!(status = %res.status(), "token validation failed");
                    return Ok(None);
                }

                let body = res
                    .json::<ValidateTokenResponse>()
                    .await
                    .map_err(|e| AuthError::Unavailable(e.to_string()))?;

                match (body.valid, body.user_id) {
                    (true, Some(id)) => Ok(Some(CurrentUser {
                        id,
                        username: body.username,
                    })),
                    _ => Ok(None),
                }
            }
        }
    }
}

fn verify_jwt(secret: &str, token: &str) -> Option<CurrentUser> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation).ok()?;
    let id = data.claims.sub.parse::<i64>().ok()?;

    Some(CurrentUser { id, username: None })
}
