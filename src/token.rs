//! Bearer token verification
//!
//! Only asymmetric algorithms are accepted: the gateway holds a public key
//! and never signs tokens itself.

use anyhow::{bail, Context, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Outcome of checking one token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerdict {
    /// Signature and claims check out; carries the subject
    Valid(String),
    Expired,
    Invalid,
}

/// Parse an algorithm name ("RS256", "ES256", "EdDSA", ...), rejecting the
/// symmetric HMAC family
pub fn parse_algorithm(name: &str) -> Result<Algorithm> {
    let algorithm = Algorithm::from_str(name)
        .map_err(|_| anyhow::anyhow!("Unknown JWT algorithm: {}", name))?;
    if matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
        bail!("JWT algorithm {} is symmetric; a public-key algorithm is required", name);
    }
    Ok(algorithm)
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier from a PEM-encoded public key
    pub fn from_pem(
        pem: &[u8],
        algorithm: Algorithm,
        issuer: Option<&str>,
        leeway_secs: u64,
    ) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => {
                DecodingKey::from_rsa_pem(pem).context("Failed to parse RSA public key PEM")?
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                DecodingKey::from_ec_pem(pem).context("Failed to parse EC public key PEM")?
            }
            Algorithm::EdDSA => {
                DecodingKey::from_ed_pem(pem).context("Failed to parse Ed25519 public key PEM")?
            }
            other => bail!("JWT algorithm {:?} is not supported for verification", other),
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = leeway_secs;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Ok(Self { key, validation })
    }

    /// Build a verifier from a PEM file on disk
    pub fn from_pem_file(
        path: impl AsRef<Path>,
        algorithm: Algorithm,
        issuer: Option<&str>,
        leeway_secs: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read token public key {:?}", path))?;
        let verifier = Self::from_pem(&pem, algorithm, issuer, leeway_secs)?;
        info!("Loaded {:?} token verification key from {:?}", algorithm, path);
        Ok(verifier)
    }

    pub fn verify(&self, token: &str) -> TokenVerdict {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => TokenVerdict::Valid(data.claims.sub),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => TokenVerdict::Expired,
                _ => {
                    debug!("Rejected bearer token: {}", e);
                    TokenVerdict::Invalid
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/jwt_signing_key.pem");
    const VERIFYING_KEY: &[u8] = include_bytes!("../tests/fixtures/jwt_verifying_key.pem");
    const FOREIGN_KEY: &[u8] = include_bytes!("../tests/fixtures/jwt_foreign_key.pem");

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: i64,
        iss: &'a str,
    }

    fn sign(key: &[u8], sub: &str, exp_offset_secs: i64, iss: &str) -> String {
        let claims = TestClaims {
            sub,
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
            iss,
        };
        encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(key).unwrap(),
        )
        .unwrap()
    }

    fn verifier(issuer: Option<&str>) -> TokenVerifier {
        TokenVerifier::from_pem(VERIFYING_KEY, Algorithm::RS256, issuer, 0).unwrap()
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let token = sign(SIGNING_KEY, "user-42", 300, "aegis");
        assert_eq!(verifier(None).verify(&token), TokenVerdict::Valid("user-42".into()));
    }

    #[test]
    fn test_expired_token() {
        let token = sign(SIGNING_KEY, "user-42", -600, "aegis");
        assert_eq!(verifier(None).verify(&token), TokenVerdict::Expired);
    }

    #[test]
    fn test_wrong_key_and_garbage_are_invalid() {
        let token = sign(FOREIGN_KEY, "user-42", 300, "aegis");
        assert_eq!(verifier(None).verify(&token), TokenVerdict::Invalid);
        assert_eq!(verifier(None).verify("not.a.jwt"), TokenVerdict::Invalid);
    }

    #[test]
    fn test_issuer_mismatch_is_invalid() {
        let token = sign(SIGNING_KEY, "user-42", 300, "someone-else");
        assert_eq!(verifier(Some("aegis")).verify(&token), TokenVerdict::Invalid);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(parse_algorithm("RS256").unwrap(), Algorithm::RS256);
        assert_eq!(parse_algorithm("EdDSA").unwrap(), Algorithm::EdDSA);
        assert!(parse_algorithm("HS256").is_err());
        assert!(parse_algorithm("XX999").is_err());
    }
}
