//! Bearer credentials of the form `folio_<lookup>_<secret>`.
//!
//! The lookup is stored in clear and indexed; the full credential is only
//! kept as an argon2id PHC string.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::error::{Error, Result};

const TOKEN_PREFIX: &str = "folio";
const LOOKUP_BYTES: usize = 4;
const SECRET_BYTES: usize = 16;

// 64 MiB, one pass, four lanes.
const HASH_MEMORY_KIB: u32 = 64 * 1024;
const HASH_PASSES: u32 = 1;
const HASH_LANES: u32 = 4;
const HASH_LEN: usize = 32;

/// A freshly generated bearer credential. `raw` is shown to the issuer once;
/// only `lookup` and `hash` are persisted.
pub struct GeneratedToken {
    pub raw: String,
    pub lookup: String,
    pub hash: String,
}

/// The two halves of a well-formed raw credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenParts<'a> {
    pub lookup: &'a str,
    pub secret: &'a str,
}

pub struct TokenGenerator {
    argon2: Argon2<'static>,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(HASH_MEMORY_KIB, HASH_PASSES, HASH_LANES, Some(HASH_LEN))
            .unwrap_or_default();
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn generate(&self) -> Result<GeneratedToken> {
        let lookup = random_hex(LOOKUP_BYTES);
        let raw = format!("{TOKEN_PREFIX}_{lookup}_{}", random_hex(SECRET_BYTES));
        let hash = self.hash(&raw)?;
        Ok(GeneratedToken { raw, lookup, hash })
    }

    pub fn hash(&self, raw: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(raw.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Credential(format!("hashing failed: {e}")))
    }

    /// False on mismatch; an error only if `hash` is not a usable PHC string.
    pub fn verify(&self, raw: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Credential(format!("stored hash is malformed: {e}")))?;

        match self.argon2.verify_password(raw.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Credential(format!("verification failed: {e}"))),
        }
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_lower_hex(s: &str, bytes: usize) -> bool {
    s.len() == bytes * 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Splits a raw credential. Anything malformed is `TokenInvalid`.
pub fn parse_token(raw: &str) -> Result<TokenParts<'_>> {
    let mut parts = raw.splitn(3, '_');
    let (Some(TOKEN_PREFIX), Some(lookup), Some(secret)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::TokenInvalid);
    };

    if !is_lower_hex(lookup, LOOKUP_BYTES) || !is_lower_hex(secret, SECRET_BYTES) {
        return Err(Error::TokenInvalid);
    }
    Ok(TokenParts { lookup, secret })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_generated_token_parses() {
        let generated = TokenGenerator::new().generate().unwrap();

        let parts = parse_token(&generated.raw).unwrap();
        assert_eq!(parts.lookup, generated.lookup);
        assert_eq!(parts.secret.len(), 32);
        assert!(generated.raw.starts_with("folio_"));
        assert!(generated.hash.starts_with("$argon2id$"));
        assert!(!generated.hash.contains(parts.secret));
    }

    #[test]
    fn test_verify_matches_only_the_issued_token() {
        let generator = TokenGenerator::new();
        let generated = generator.generate().unwrap();
        assert!(generator.verify(&generated.raw, &generated.hash).unwrap());

        let other = generator.generate().unwrap();
        assert_ne!(other.raw, generated.raw);
        assert!(!generator.verify(&other.raw, &generated.hash).unwrap());

        assert!(matches!(
            generator.verify(&generated.raw, "not-a-phc-string"),
            Err(Error::Credential(_))
        ));
    }

    #[test]
    fn test_parse_token_rejects_malformed() {
        let raw = format!("folio_0badcafe_{SECRET}");
        let parts = parse_token(&raw).unwrap();
        assert_eq!(
            parts,
            TokenParts {
                lookup: "0badcafe",
                secret: SECRET
            }
        );

        for raw in [
            format!("other_0badcafe_{SECRET}"),
            format!("folio_0BADCAFE_{SECRET}"),
            format!("folio_0badcafe_{SECRET}_extra"),
            format!("folio_short_{SECRET}"),
            "folio_0badcafe".to_string(),
            String::new(),
        ] {
            assert!(matches!(parse_token(&raw), Err(Error::TokenInvalid)), "{raw}");
        }
    }
}
