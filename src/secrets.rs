//! Credential & secret engine
//!
//! bcrypt for passwords, API tokens and recovery codes; a single cost
//! profile covers all three. Token plaintexts are `prefix:secret` where the
//! prefix is indexed for O(1) lookup and the secret carries 192 bits of
//! entropy. Verification of an unknown prefix still performs one bcrypt
//! comparison so both failure paths cost the same.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use data_encoding::BASE32_NOPAD;
use rand::RngExt;
use totp_lite::{Sha1, totp_custom};

use crate::{Error, Result};

/// TOTP step length in seconds.
pub const TOTP_STEP_SECS: u64 = 30;

/// TOTP digit count.
pub const TOTP_DIGITS: u32 = 6;

/// Number of recovery codes issued per enrollment.
pub const RECOVERY_CODE_COUNT: usize = 10;

/// Length of the token prefix in base64url characters (9 random bytes).
const TOKEN_PREFIX_BYTES: usize = 9;

/// Length of the token secret in bytes (192 bits).
const TOKEN_SECRET_BYTES: usize = 24;

/// A freshly generated API token.
///
/// `plaintext` is shown to the caller exactly once; only `prefix` and
/// `hash` are persisted.
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    /// Full plaintext, `prefix:secret`.
    pub plaintext: String,
    /// Indexed lookup prefix.
    pub prefix: String,
    /// bcrypt hash over the full plaintext.
    pub hash: String,
}

/// Credential engine. Cheap to clone; carries only the cost parameter and
/// a precomputed dummy hash for timing equalization.
#[derive(Debug, Clone)]
pub struct SecretEngine {
    cost: u32,
    dummy_hash: String,
}

impl SecretEngine {
    /// Create an engine with the given bcrypt cost.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the dummy hash cannot be computed.
    pub fn new(cost: u32) -> Result<Self> {
        let dummy_hash = bcrypt::hash("dns-gateway-dummy-credential", cost)
            .map_err(|e| Error::Config(format!("bcrypt self-test failed: {e}")))?;
        Ok(Self { cost, dummy_hash })
    }

    /// Hash a password on the blocking pool.
    pub async fn hash_password(&self, plain: &str) -> Result<String> {
        let plain = plain.to_string();
        let cost = self.cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(&plain, cost))
            .await
            .map_err(|e| Error::Internal(format!("hash task: {e}")))?
            .map_err(|e| Error::Internal(format!("bcrypt: {e}")))
    }

    /// Verify a password against a stored hash on the blocking pool.
    pub async fn verify_password(&self, plain: &str, hash: &str) -> Result<bool> {
        let plain = plain.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(&plain, &hash))
            .await
            .map_err(|e| Error::Internal(format!("verify task: {e}")))?
            .map_err(|e| Error::Internal(format!("bcrypt: {e}")))
    }

    /// Burn one bcrypt verification against the dummy hash.
    ///
    /// Called on the unknown-prefix path so it is indistinguishable in time
    /// from a wrong-secret rejection.
    pub async fn burn_verification(&self) {
        let hash = self.dummy_hash.clone();
        let _ = tokio::task::spawn_blocking(move || {
            bcrypt::verify("dns-gateway-burned-attempt", &hash)
        })
        .await;
    }

    /// Generate a new API token: `prefix:secret`, 192-bit secret,
    /// base64url without padding, bcrypt hash over the full plaintext.
    pub async fn generate_token(&self) -> Result<GeneratedToken> {
        let mut secret_bytes = [0u8; TOKEN_SECRET_BYTES];
        let prefix_bytes: [u8; TOKEN_PREFIX_BYTES] = {
            let mut rng = rand::rng();
            let prefix_bytes: [u8; TOKEN_PREFIX_BYTES] = rng.random();
            rng.fill(&mut secret_bytes[..]);
            prefix_bytes
        };

        let prefix = URL_SAFE_NO_PAD.encode(prefix_bytes);
        let secret = URL_SAFE_NO_PAD.encode(secret_bytes);
        let plaintext = format!("{prefix}:{secret}");
        let hash = self.hash_password(&plaintext).await?;

        Ok(GeneratedToken {
            plaintext,
            prefix,
            hash,
        })
    }

    /// Verify a presented token plaintext against the stored hash.
    pub async fn verify_token(&self, plaintext: &str, hash: &str) -> Result<bool> {
        self.verify_password(plaintext, hash).await
    }

    /// Generate recovery codes. Returns `(plaintexts, hashes)` pairwise;
    /// the plaintexts leave the process exactly once.
    pub async fn generate_recovery_codes(&self) -> Result<(Vec<String>, Vec<String>)> {
        let mut codes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        let mut hashes = Vec::with_capacity(RECOVERY_CODE_COUNT);
        for _ in 0..RECOVERY_CODE_COUNT {
            let code = generate_recovery_code();
            hashes.push(self.hash_password(&code).await?);
            codes.push(code);
        }
        Ok((codes, hashes))
    }
}

/// Extract the lookup prefix from a presented token plaintext.
///
/// # Errors
///
/// Returns [`Error::InvalidToken`] if the shape is wrong. The error is the
/// same opaque kind the verification path uses.
pub fn split_token(plaintext: &str) -> Result<&str> {
    match plaintext.split_once(':') {
        Some((prefix, secret))
            if (8..=16).contains(&prefix.len())
                && !secret.is_empty()
                && is_base64url(prefix)
                && is_base64url(secret) =>
        {
            Ok(prefix)
        }
        _ => Err(Error::InvalidToken),
    }
}

fn is_base64url(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn generate_recovery_code() -> String {
    const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
    let mut rng = rand::rng();
    let mut pick = |n: usize| -> String {
        (0..n)
            .map(|_| {
                let idx: usize = rng.random_range(0..ALPHABET.len());
                ALPHABET[idx] as char
            })
            .collect()
    };
    format!("{}-{}", pick(4), pick(4))
}

/// Generate a fresh base32-encoded TOTP secret (160 bits).
#[must_use]
pub fn generate_totp_secret() -> String {
    let mut bytes = [0u8; 20];
    rand::rng().fill(&mut bytes[..]);
    BASE32_NOPAD.encode(&bytes)
}

/// Provisioning URI for authenticator apps.
#[must_use]
pub fn totp_provisioning_uri(secret_base32: &str, account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret_base32}&issuer={issuer}&digits={TOTP_DIGITS}&period={TOTP_STEP_SECS}"
    )
}

/// Verify a TOTP code within a ±1 step window.
///
/// Returns the matched step counter on success so the caller can persist it
/// and refuse replays within the same step. `last_used_step` is the most
/// recently accepted counter; any candidate at or below it is rejected.
///
/// # Errors
///
/// Returns [`Error::Config`] if the stored secret is not valid base32.
pub fn totp_verify(
    secret_base32: &str,
    code: &str,
    unix_now: u64,
    last_used_step: Option<u64>,
) -> Result<Option<u64>> {
    let secret = BASE32_NOPAD
        .decode(secret_base32.to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::Config("stored TOTP secret is not valid base32".to_string()))?;

    let current_step = unix_now / TOTP_STEP_SECS;
    for step in [
        current_step.saturating_sub(1),
        current_step,
        current_step + 1,
    ] {
        if let Some(last) = last_used_step {
            if step <= last {
                continue;
            }
        }
        let expected = totp_custom::<Sha1>(
            TOTP_STEP_SECS,
            TOTP_DIGITS,
            &secret,
            step * TOTP_STEP_SECS,
        );
        if constant_time_str_eq(&expected, code) {
            return Ok(Some(step));
        }
    }
    Ok(None)
}

/// Constant-time string equality via `subtle`.
#[must_use]
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cost 4 keeps the hashing tests fast; production floor is enforced in
    // config validation, not here.
    const TEST_COST: u32 = 4;

    #[tokio::test]
    async fn password_roundtrip() {
        // GIVEN: an engine and a password
        let engine = SecretEngine::new(TEST_COST).unwrap();

        // WHEN: hash then verify
        let hash = engine.hash_password("hunter2hunter2").await.unwrap();

        // THEN: correct password verifies, wrong does not
        assert!(engine.verify_password("hunter2hunter2", &hash).await.unwrap());
        assert!(!engine.verify_password("hunter3hunter3", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn generated_token_has_expected_shape() {
        // GIVEN/WHEN: a generated token
        let engine = SecretEngine::new(TEST_COST).unwrap();
        let token = engine.generate_token().await.unwrap();

        // THEN: prefix:secret with a 12-char prefix and 32-char secret
        let (prefix, secret) = token.plaintext.split_once(':').unwrap();
        assert_eq!(prefix, token.prefix);
        assert_eq!(prefix.len(), 12);
        assert_eq!(secret.len(), 32);
        assert!(engine.verify_token(&token.plaintext, &token.hash).await.unwrap());
    }

    #[test]
    fn split_token_accepts_valid_and_rejects_malformed() {
        // GIVEN: a well-formed plaintext
        let prefix = split_token("AbCdEf123456:0123456789abcdefghijklmnopqrstuv").unwrap();
        assert_eq!(prefix, "AbCdEf123456");

        // THEN: malformed shapes all map to the opaque invalid_token
        for bad in ["no-colon-here", ":emptyprefix", "short:x", "AbCdEf123456:", "spa ce:secret"] {
            assert!(matches!(split_token(bad), Err(Error::InvalidToken)), "{bad}");
        }
    }

    #[tokio::test]
    async fn recovery_codes_verify_pairwise() {
        // GIVEN: a batch of recovery codes
        let engine = SecretEngine::new(TEST_COST).unwrap();
        let (codes, hashes) = engine.generate_recovery_codes().await.unwrap();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);

        // THEN: each code verifies only against its own hash
        assert!(engine.verify_password(&codes[0], &hashes[0]).await.unwrap());
        assert!(!engine.verify_password(&codes[0], &hashes[1]).await.unwrap());
    }

    #[test]
    fn totp_accepts_adjacent_steps_and_refuses_replay() {
        // GIVEN: a secret and the code for the current step
        let secret = generate_totp_secret();
        let now = 1_700_000_000u64;
        let raw = BASE32_NOPAD.decode(secret.as_bytes()).unwrap();
        let code = totp_custom::<Sha1>(TOTP_STEP_SECS, TOTP_DIGITS, &raw, now);

        // WHEN: verifying with no replay history
        let step = totp_verify(&secret, &code, now, None).unwrap();

        // THEN: accepted at the current step
        let step = step.expect("code should verify");
        assert_eq!(step, now / TOTP_STEP_SECS);

        // AND: replay within the same step is refused
        assert!(totp_verify(&secret, &code, now, Some(step)).unwrap().is_none());

        // AND: the same code presented one step early still verifies (window)
        let early = now - TOTP_STEP_SECS;
        assert!(totp_verify(&secret, &code, early, None).unwrap().is_some());
    }

    #[test]
    fn totp_rejects_wrong_code() {
        let secret = generate_totp_secret();
        assert!(totp_verify(&secret, "000000", 1_700_000_000, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn provisioning_uri_contains_secret_and_issuer() {
        let uri = totp_provisioning_uri("JBSWY3DPEHPK3PXP", "alice", "dns-gateway");
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains("secret=JBSWY3DPEHPK3PXP"));
        assert!(uri.contains("issuer=dns-gateway"));
    }

    #[test]
    fn recovery_code_format() {
        let code = generate_recovery_code();
        let (a, b) = code.split_once('-').unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 4);
    }
}
