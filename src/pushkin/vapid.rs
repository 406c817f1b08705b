use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};

/// Lifetime claimed in VAPID tokens; RFC 8292 caps this at 24 hours.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(12 * 60 * 60);

/// Cached headers are reused for most of the token lifetime, then re-minted
/// with an hour to spare.
const REUSE_PERIOD: Duration = Duration::from_secs(11 * 60 * 60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    aud: &'a str,
    exp: u64,
    sub: &'a str,
}

struct MintedHeader {
    value: Arc<String>,
    create_time: SystemTime,
}

/// Signs `Authorization: vapid t=...,k=...` headers, one cached per push
/// service origin.
pub struct VapidSigner {
    key: EncodingKey,
    public_key: String,
    subject: String,
    cache: RwLock<HashMap<String, MintedHeader>>,
}

impl VapidSigner {
    /// Accepts the key as a PEM file path, an inline PEM block, or the raw
    /// base64url P-256 scalar.
    pub fn new(private_key: &str, contact_email: &str) -> Result<Self> {
        let secret = load_private_key(private_key)?;

        let public_key = URL_SAFE_NO_PAD.encode(
            secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes(),
        );

        let pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::Credentials(format!("bad VAPID key: {err}")))?;
        let key = EncodingKey::from_ec_pem(pem.as_bytes())?;

        let subject = if contact_email.starts_with("mailto:") {
            contact_email.to_owned()
        } else {
            format!("mailto:{contact_email}")
        };

        Ok(Self {
            key,
            public_key,
            subject,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// The application server key in the form browsers subscribe with.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The authorization header value for a push endpoint, minted or cached.
    pub fn authorization(&self, endpoint: &Url) -> Result<Arc<String>> {
        let audience = origin_of(endpoint)?;

        {
            let cache = self.cache.read().unwrap();
            if let Some(minted) = cache.get(&audience) {
                if SystemTime::now().duration_since(minted.create_time)? < REUSE_PERIOD {
                    return Ok(minted.value.clone());
                }
            }
        }

        let mut cache = self.cache.write().unwrap();
        if let Some(minted) = cache.get(&audience) {
            if SystemTime::now().duration_since(minted.create_time)? < REUSE_PERIOD {
                return Ok(minted.value.clone());
            }
        }

        let minted = self.mint(&audience)?;
        let value = minted.value.clone();
        cache.insert(audience, minted);
        Ok(value)
    }

    fn mint(&self, audience: &str) -> Result<MintedHeader> {
        let create_time = SystemTime::now();
        let exp = (create_time.duration_since(UNIX_EPOCH)? + TOKEN_LIFETIME).as_secs();

        let claims = Claims {
            aud: audience,
            exp,
            sub: &self.subject,
        };
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.key)?;

        Ok(MintedHeader {
            value: Arc::new(format!("vapid t={jwt},k={}", self.public_key)),
            create_time,
        })
    }
}

/// The scheme://host[:port] origin a VAPID token is scoped to.
pub fn origin_of(endpoint: &Url) -> Result<String> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| Error::Config(format!("endpoint {endpoint} has no host")))?;
    Ok(match endpoint.port() {
        Some(port) => format!("{}://{}:{}", endpoint.scheme(), host, port),
        None => format!("{}://{}", endpoint.scheme(), host),
    })
}

fn load_private_key(material: &str) -> Result<SecretKey> {
    let material = material.trim();

    if material.contains("BEGIN") {
        return parse_pem(material);
    }

    let path = Path::new(material);
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        return parse_pem(raw.trim());
    }

    let raw = URL_SAFE_NO_PAD
        .decode(material.trim_end_matches('='))
        .map_err(|err| Error::Credentials(format!("bad VAPID key: {err}")))?;
    SecretKey::from_slice(&raw)
        .map_err(|err| Error::Credentials(format!("bad VAPID key scalar: {err}")))
}

fn parse_pem(pem: &str) -> Result<SecretKey> {
    SecretKey::from_pkcs8_pem(pem)
        .or_else(|_| SecretKey::from_sec1_pem(pem))
        .map_err(|err| Error::Credentials(format!("bad VAPID key PEM: {err}")))
}

#[cfg(test)]
mod test {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use p256::pkcs8::EncodePublicKey;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        aud: String,
        exp: u64,
        sub: String,
    }

    fn random_key() -> SecretKey {
        SecretKey::random(&mut rand::rngs::OsRng)
    }

    #[test]
    fn accepts_raw_scalar_and_pem_key_material() {
        let secret = random_key();

        let raw = URL_SAFE_NO_PAD.encode(secret.to_bytes());
        VapidSigner::new(&raw, "ops@example.com").unwrap();

        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        VapidSigner::new(&pem, "ops@example.com").unwrap();
    }

    #[test]
    fn token_verifies_and_is_scoped_to_the_endpoint_origin() {
        let secret = random_key();
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let signer = VapidSigner::new(&pem, "ops@example.com").unwrap();

        let endpoint = Url::parse("https://updates.push.services.mozilla.com/wpush/v2/abc").unwrap();
        let header = signer.authorization(&endpoint).unwrap();

        let (token, key_part) = header
            .strip_prefix("vapid t=")
            .unwrap()
            .split_once(",k=")
            .unwrap();
        assert_eq!(key_part, signer.public_key());

        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&["https://updates.push.services.mozilla.com"]);
        let decoded = decode::<DecodedClaims>(
            token,
            &DecodingKey::from_ec_pem(public_pem.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.aud, "https://updates.push.services.mozilla.com");
        assert_eq!(decoded.claims.sub, "mailto:ops@example.com");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(decoded.claims.exp > now);
        assert!(decoded.claims.exp <= now + TOKEN_LIFETIME.as_secs() + 5);
    }

    #[test]
    fn headers_are_cached_per_origin() {
        let pem = random_key().to_pkcs8_pem(LineEnding::LF).unwrap();
        let signer = VapidSigner::new(&pem, "ops@example.com").unwrap();

        let a1 = signer
            .authorization(&Url::parse("https://push.example.com/sub/1").unwrap())
            .unwrap();
        let a2 = signer
            .authorization(&Url::parse("https://push.example.com/sub/2").unwrap())
            .unwrap();
        let b = signer
            .authorization(&Url::parse("https://other.example.com/sub/1").unwrap())
            .unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
