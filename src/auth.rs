//! Auth Core
//! Mission: Password hashing and JWT session tokens, callable without HTTP

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::models::Account;

/// JWT claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

pub fn hash_password(password: &str) -> Result<String> {
    hash(password, DEFAULT_COST)
        .map_err(|e| GatewayError::Internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    verify(password, password_hash).unwrap_or(false)
}

/// Issues and validates access tokens signed with `security.secret_key`.
pub struct JwtHandler {
    secret: String,
    algorithm: Algorithm,
    expire_minutes: i64,
}

impl JwtHandler {
    pub fn new(secret: String, algorithm: &str, expire_minutes: i64) -> Self {
        let algorithm = match algorithm.to_uppercase().as_str() {
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            _ => Algorithm::HS256,
        };
        Self {
            secret,
            algorithm,
            expire_minutes,
        }
    }

    /// Generate a token for an account. Returns (token, expires_in_secs).
    pub fn generate_token(&self, account: &Account) -> Result<(String, usize)> {
        let expires_in = (self.expire_minutes * 60) as usize;
        let exp = (Utc::now() + chrono::Duration::minutes(self.expire_minutes)).timestamp() as usize;

        let claims = Claims {
            sub: account.id.to_string(),
            email: account.email.clone(),
            exp,
        };

        debug!(account_id = account.id, "issuing access token");

        let token = encode(
            &Header::new(self.algorithm),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| GatewayError::Internal(format!("token generation failed: {e}")))?;

        Ok((token, expires_in))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(self.algorithm),
        )
        .map_err(|_| GatewayError::AuthenticationFailed("invalid or expired token".to_string()))?;

        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_account() -> Account {
        Account {
            id: 7,
            name: "trader".to_string(),
            email: "trader@example.com".to_string(),
            is_active: true,
            password_hash: String::new(),
            max_position_size_usd: 100_000.0,
            max_leverage: 10.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_token_round_trip() {
        let handler = JwtHandler::new("test-secret".to_string(), "HS256", 30);
        let (token, expires_in) = handler.generate_token(&test_account()).unwrap();
        assert_eq!(expires_in, 30 * 60);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.email, "trader@example.com");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = JwtHandler::new("secret-a".to_string(), "HS256", 30);
        let b = JwtHandler::new("secret-b".to_string(), "HS256", 30);
        let (token, _) = a.generate_token(&test_account()).unwrap();
        assert!(matches!(
            b.validate_token(&token),
            Err(GatewayError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hashed = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hashed));
        assert!(!verify_password("hunter3", &hashed));
    }
}
