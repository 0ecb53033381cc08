//! Signed event envelopes.
//!
//! An envelope is a JWT whose claims carry the event payload. It is emitted
//! in JWS general JSON serialization, with the signature keyed by the
//! application name:
//!
//! ```json
//! {
//!   "payload": "<base64url claims>",
//!   "signatures": [
//!     { "protected": "<base64url header>", "header": { "kid": "<app>" }, "signature": "<base64url>" }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::{Payload, SigningConfig};
use crate::ENVELOPE_TTL_SECS;

/// Errors raised while building or signing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing key for {algorithm:?}: {source}")]
    Key {
        algorithm: Algorithm,
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    #[error("failed to sign envelope: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("signed token is not in compact form")]
    MalformedToken,
}

/// Claims carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeClaims {
    /// Issuer, the application name
    pub iss: String,

    /// Unique id of this envelope
    pub jti: String,

    /// Issued at, seconds since epoch
    pub iat: i64,

    /// Expires at, `iat` + 60 seconds
    pub exp: i64,

    /// The wrapped event payload
    pub event: Payload,
}

impl EnvelopeClaims {
    pub fn new(issuer: &str, event: Payload, issued_at: DateTime<Utc>) -> Self {
        let iat = issued_at.timestamp();
        Self {
            iss: issuer.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat,
            exp: iat + ENVELOPE_TTL_SECS,
            event,
        }
    }
}

/// Signs event payloads on behalf of one issuer.
pub struct EnvelopeSigner {
    issuer: String,
    algorithm: Algorithm,
    key: EncodingKey,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner")
            .field("issuer", &self.issuer)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    /// Build a signer from decoded key material.
    ///
    /// PEM keys are expected for RSA, EC and EdDSA algorithms; HMAC
    /// algorithms use the bytes as the shared secret.
    pub fn new(issuer: impl Into<String>, config: &SigningConfig) -> Result<Self, SigningError> {
        let algorithm = config.algorithm;
        let pem = config.private_key.as_slice();

        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                Ok(EncodingKey::from_secret(pem))
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
        }
        .map_err(|source| SigningError::Key { algorithm, source })?;

        Ok(Self {
            issuer: issuer.into(),
            algorithm,
            key,
        })
    }

    /// Wrap `event` in a freshly issued, signed envelope.
    pub fn sign(&self, event: Payload) -> Result<Payload, SigningError> {
        self.sign_claims(&EnvelopeClaims::new(&self.issuer, event, Utc::now()))
    }

    /// Sign prepared claims.
    pub fn sign_claims(&self, claims: &EnvelopeClaims) -> Result<Payload, SigningError> {
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), claims, &self.key)
            .map_err(SigningError::Sign)?;

        let mut parts = token.splitn(3, '.');
        let (Some(protected), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SigningError::MalformedToken);
        };

        let envelope = json!({
            "payload": payload,
            "signatures": [{
                "protected": protected,
                "header": { "kid": self.issuer },
                "signature": signature,
            }],
        });

        match envelope {
            Value::Object(map) => Ok(map),
            _ => Err(SigningError::MalformedToken),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{DecodingKey, Validation};
    use pretty_assertions::assert_eq;

    pub(crate) const TEST_EC_PRIVATE_KEY: &str = include_str!("../../tests/fixtures/ec_private.pem");
    const TEST_EC_PUBLIC_KEY: &str = include_str!("../../tests/fixtures/ec_public.pem");

    pub(crate) fn test_signing_config() -> SigningConfig {
        let encoded = URL_SAFE_NO_PAD.encode(TEST_EC_PRIVATE_KEY);
        SigningConfig::from_encoded(&encoded, "ES256").unwrap()
    }

    fn event() -> Payload {
        json!({"record": {"id": 1}, "name": "model.order.created"})
            .as_object()
            .cloned()
            .unwrap()
    }

    /// Reassemble the compact token from a general-serialization envelope.
    pub(crate) fn compact(envelope: &Payload) -> String {
        let signature = &envelope["signatures"][0];
        format!(
            "{}.{}.{}",
            signature["protected"].as_str().unwrap(),
            envelope["payload"].as_str().unwrap(),
            signature["signature"].as_str().unwrap()
        )
    }

    pub(crate) fn verify(envelope: &Payload) -> EnvelopeClaims {
        let key = DecodingKey::from_ec_pem(TEST_EC_PUBLIC_KEY.as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_aud = false;
        jsonwebtoken::decode::<EnvelopeClaims>(&compact(envelope), &key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn test_claims_expire_sixty_seconds_after_issue() {
        let issued_at = Utc::now();
        let claims = EnvelopeClaims::new("peatio", event(), issued_at);

        assert_eq!(claims.iat, issued_at.timestamp());
        assert_eq!(claims.exp, claims.iat + 60);
        assert_eq!(claims.iss, "peatio");
    }

    #[test]
    fn test_claims_ids_are_unique() {
        let now = Utc::now();
        let first = EnvelopeClaims::new("peatio", event(), now);
        let second = EnvelopeClaims::new("peatio", event(), now);
        assert_ne!(first.jti, second.jti);
    }

    #[test]
    fn test_signed_envelope_verifies() {
        let signer = EnvelopeSigner::new("peatio", &test_signing_config()).unwrap();
        let envelope = signer.sign(event()).unwrap();

        assert_eq!(envelope["signatures"][0]["header"]["kid"], "peatio");

        let claims = verify(&envelope);
        assert_eq!(claims.iss, "peatio");
        assert_eq!(claims.exp, claims.iat + 60);
        assert_eq!(claims.event, event());
    }

    #[test]
    fn test_identical_payloads_get_distinct_envelopes() {
        let signer = EnvelopeSigner::new("peatio", &test_signing_config()).unwrap();
        let first = verify(&signer.sign(event()).unwrap());
        let second = verify(&signer.sign(event()).unwrap());
        assert_ne!(first.jti, second.jti);
    }

    #[test]
    fn test_rejects_garbage_key() {
        let config = SigningConfig::from_encoded(&URL_SAFE_NO_PAD.encode("not a pem"), "RS256")
            .unwrap();
        let err = EnvelopeSigner::new("peatio", &config).unwrap_err();
        assert!(matches!(
            err,
            SigningError::Key {
                algorithm: Algorithm::RS256,
                ..
            }
        ));
    }
}
