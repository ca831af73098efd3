use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token verification failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("no extension in token")]
    NoExtension,
}

/// Claims carried by the softphone bearer token.
#[derive(Serialize, Deserialize)]
pub struct PhoneClaims {
    #[serde(default)]
    pub ext: String,
    pub exp: u64,
}

/// Verifies the signed bearer token a browser presents on upgrade and
/// yields the extension it is entitled to register.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> TokenVerifier {
        TokenVerifier {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<PhoneClaims>(token, &self.key, &self.validation)?;
        if data.claims.ext.is_empty() {
            return Err(AuthError::NoExtension);
        }
        Ok(data.claims.ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn mint(ext: &str, exp_offset: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = PhoneClaims {
            ext: ext.to_string(),
            exp: (now + exp_offset) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_extension() {
        let verifier = TokenVerifier::new(SECRET);
        assert_eq!(verifier.verify(&mint("1001", 600)).unwrap(), "1001");
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        // past the default validation leeway
        assert!(matches!(
            verifier.verify(&mint("1001", -600)),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = TokenVerifier::new("other-secret");
        assert!(verifier.verify(&mint("1001", 600)).is_err());
    }

    #[test]
    fn empty_extension_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(matches!(
            verifier.verify(&mint("", 600)),
            Err(AuthError::NoExtension)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let verifier = TokenVerifier::new(SECRET);
        assert!(verifier.verify("not.a.token").is_err());
    }
}
