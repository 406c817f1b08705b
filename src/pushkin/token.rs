use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::error::Result;

/// Provider-token refresh period.
///
/// APNs wants tokens re-minted no more than once every 20 minutes and no
/// less than once every 60; anything older than an hour is rejected. 55
/// minutes keeps a healthy margin under that ceiling.
pub const TOKEN_REFRESH_PERIOD: Duration = Duration::from_secs(55 * 60);

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: u64,
}

struct Minted {
    jwt: Arc<String>,
    create_time: SystemTime,
}

/// Mints and caches the ES256 provider token sent with every APNs request.
///
/// Safe to share across tasks; concurrent callers that observe an expired
/// token race for the write lock and the losers reuse the winner's mint.
pub struct TokenFactory {
    key: EncodingKey,
    header: Header,
    iss: String,
    cache: RwLock<Minted>,
}

impl TokenFactory {
    /// Creates a factory from the p8 key PEM, validating the key material
    /// up front so a bad key fails at startup rather than on first push.
    pub fn new(key_id: &str, key_pem: &[u8], team_id: &str) -> Result<Self> {
        let key = EncodingKey::from_ec_pem(key_pem)?;
        let header = Header {
            alg: Algorithm::ES256,
            kid: Some(key_id.into()),
            ..Default::default()
        };

        let factory = TokenFactory {
            key,
            header,
            iss: team_id.into(),
            cache: RwLock::new(Minted {
                jwt: Default::default(),
                create_time: UNIX_EPOCH,
            }),
        };

        *factory.cache.write().unwrap() = factory.mint()?;

        Ok(factory)
    }

    /// Returns a token with at least five minutes of validity left.
    pub fn get(&self) -> Result<Arc<String>> {
        {
            let minted = self.cache.read().unwrap();
            if SystemTime::now().duration_since(minted.create_time)? < TOKEN_REFRESH_PERIOD {
                return Ok(minted.jwt.clone());
            }
        }
        self.refresh()
    }

    fn refresh(&self) -> Result<Arc<String>> {
        let mut cache = self.cache.write().unwrap();

        // Another task may have refreshed while we waited for the lock.
        if SystemTime::now().duration_since(cache.create_time)? < TOKEN_REFRESH_PERIOD {
            return Ok(cache.jwt.clone());
        }

        let minted = self.mint()?;
        let jwt = minted.jwt.clone();
        *cache = minted;
        Ok(jwt)
    }

    fn mint(&self) -> Result<Minted> {
        let create_time = SystemTime::now();
        let iat = create_time.duration_since(UNIX_EPOCH)?.as_secs();

        let claims = Claims {
            iss: &self.iss,
            iat,
        };

        let jwt = jsonwebtoken::encode(&self.header, &claims, &self.key)?;
        Ok(Minted {
            jwt: Arc::new(jwt),
            create_time,
        })
    }
}

#[cfg(test)]
mod test {
    use p256::pkcs8::{EncodePrivateKey, LineEnding};

    use super::*;

    fn test_key_pem() -> String {
        let key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    }

    #[test]
    fn mints_and_caches_a_token() {
        let pem = test_key_pem();
        let factory = TokenFactory::new("KEYID12345", pem.as_bytes(), "TEAMID1234").unwrap();

        let first = factory.get().unwrap();
        let second = factory.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Three dot-separated JWT segments.
        assert_eq!(first.split('.').count(), 3);
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(TokenFactory::new("KEYID12345", b"not a pem", "TEAMID1234").is_err());
    }
}
