use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{User, UserRepository};
use crate::error::{AppError, AppResult};

/// Claims of the bearer tokens issued by the identity service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

pub struct AuthService;

impl AuthService {
    /// Decode and validate an HS256 JWT, returning the claims.
    pub fn decode_jwt(secret: &str, token: &str) -> AppResult<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    /// Resolve a bearer token to its user row.
    pub async fn get_user_from_token(db: &SqlitePool, secret: &str, token: &str) -> AppResult<User> {
        let claims = Self::decode_jwt(secret, token)?;
        UserRepository::find_by_id(db, &claims.sub)
            .await?
            .ok_or(AppError::Unauthorized)
    }

    #[cfg(test)]
    pub fn create_jwt(secret: &str, user_id: &str) -> AppResult<String> {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let now = chrono::Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + chrono::Duration::hours(1)).timestamp() as usize,
        };
        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?)
    }
}
