use std::sync::LazyLock;

use axum::{async_trait, extract::FromRequestParts, RequestPartsExt};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

static KEYS: LazyLock<Keys> = LazyLock::new(|| {
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    Keys::new(&secret)
});

pub const LONG_TTL: usize = 24 * 60 * 60; // 24 hours

#[cfg(debug_assertions)]
pub fn generate_dev_token(user_id: &str, email: &str) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        exp: Utc::now().timestamp() as usize + LONG_TTL,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &KEYS.encoding)
        .map_err(|_| AuthError::TokenCreation)
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn new(secret: &str) -> Self {
        let decoded_secret = hex::decode(secret).expect("Secret was not valid hex");
        Self {
            encoding: EncodingKey::from_secret(&decoded_secret),
            decoding: DecodingKey::from_secret(&decoded_secret),
        }
    }
}

/// Claims minted by the identity front-end after the MSAL flow completes.
/// `sub` is the provider's stable user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

#[derive(Debug)]
pub enum AuthError {
    MissingCredentials,
    TokenCreation,
    InvalidToken,
}

#[async_trait]
impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Extract the token from the authorization header
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::MissingCredentials)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = 10 * 60; // 10 minute leeway for expired tokens

        let token_data =
            jsonwebtoken::decode::<Claims>(bearer.token(), &KEYS.decoding, &validation).map_err(
                |e| {
                    tracing::error!("Error decoding token: {:?}", e);
                    AuthError::InvalidToken
                },
            )?;

        Ok(token_data.claims)
    }
}
