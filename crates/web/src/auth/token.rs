//! Shared-secret token verification.
//!
//! Tokens are HS256 JWTs carried in the `token` query parameter. The payload
//! must hold `vm` and `operation` string claims.

use std::borrow::Cow;
use std::fmt;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::{debug, warn};

use vmctl_common::{Claims, Error, Result};

/// Verifies tokens against one HMAC secret fixed at construction.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("key", &"<redacted>")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp/nbf are checked when present, never required.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a raw query-string token and decode its claims.
    ///
    /// Signature, algorithm and expiry problems are `Unauthorized`; a valid
    /// token with unusable claims is `BadRequest`.
    pub fn verify(&self, raw_token: &str) -> Result<Claims> {
        let token = escape_html(raw_token);

        let data = decode::<serde_json::Value>(&token, &self.key, &self.validation).map_err(|e| {
            debug!("token rejected: {}", e);
            Error::Unauthorized
        })?;

        Claims::from_payload(data.claims).map_err(|e| {
            warn!("verified token carries unusable claims: {}", e);
            e
        })
    }
}

/// HTML-escape `&`, `<`, `>`, `"` and `'`.
///
/// Well-formed JWTs contain none of these, so valid tokens pass through
/// unchanged.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}
