//! Telegram WebApp init-data verification.
//!
//! A Mini-App client asserts its identity with a signed key-value blob. The
//! signature is an HMAC-SHA256 over the sorted fields, keyed by a secret
//! derived from the bot token. Verification is pure: any malformed or
//! tampered input yields "no identity", never an error, and callers treat
//! absence as an unauthenticated request.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Fixed label Telegram specifies as key material for the secret key.
const SECRET_KEY_LABEL: &[u8] = b"WebAppData";

/// Identity extracted from a verified session blob.
#[derive(Debug, Clone)]
pub struct AuthenticatedIdentity {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Issuance timestamp of the session (`auth_date`), seconds since epoch.
    pub auth_date: Option<i64>,
}

/// JSON shape of the `user` field inside init-data.
#[derive(Debug, Deserialize)]
struct UserPayload {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

// No Debug derive: the derived secret key must never leak into logs.
pub struct WebAppAuthenticator {
    secret_key: [u8; 32],
}

impl WebAppAuthenticator {
    /// Derive the verification key from the shared bot credential.
    ///
    /// The credential itself is dropped after derivation and is never stored
    /// or logged.
    pub fn new(bot_token: &str) -> Self {
        assert!(!bot_token.is_empty(), "Bot token must be provided");
        let mut mac = HmacSha256::new_from_slice(SECRET_KEY_LABEL)
            .expect("HMAC accepts keys of any length");
        mac.update(bot_token.as_bytes());
        Self {
            secret_key: mac.finalize().into_bytes().into(),
        }
    }

    /// Verify a session string and extract the embedded identity.
    ///
    /// Returns `None` for a missing checksum field, a checksum mismatch, or
    /// a malformed/missing identity payload. The checksum is recomputed over
    /// all fields except `hash`, sorted lexicographically by key and joined
    /// as newline-separated `key=value` lines, using the decoded field
    /// values exactly as the client signed them.
    pub fn verify(&self, init_data: &str) -> Option<AuthenticatedIdentity> {
        let mut fields: Vec<(String, String)> = form_urlencoded::parse(init_data.as_bytes())
            .into_owned()
            .collect();

        let hash_index = fields.iter().position(|(key, _)| key == "hash")?;
        let (_, received_hash) = fields.remove(hash_index);
        let received = hex::decode(received_hash.trim()).ok()?;

        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let data_check_string = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut mac = HmacSha256::new_from_slice(&self.secret_key)
            .expect("HMAC accepts keys of any length");
        mac.update(data_check_string.as_bytes());
        if mac.verify_slice(&received).is_err() {
            tracing::warn!("WebApp session checksum mismatch");
            return None;
        }

        let user_json = fields
            .iter()
            .find(|(key, _)| key == "user")
            .map(|(_, value)| value.as_str())?;
        let user: UserPayload = match serde_json::from_str(user_json) {
            Ok(user) => user,
            Err(err) => {
                tracing::warn!("Verified session carries malformed user payload: {err}");
                return None;
            }
        };

        let auth_date = fields
            .iter()
            .find(|(key, _)| key == "auth_date")
            .and_then(|(_, value)| value.parse().ok());

        Some(AuthenticatedIdentity {
            user_id: user.id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            auth_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT_TOKEN: &str = "7000000001:AAtestbottokentestbottokentest";

    /// Sign fields the way the Telegram client does: hash over the sorted
    /// decoded pairs, percent-encoding applied afterwards.
    fn signed_init_data(fields: &[(&str, &str)]) -> String {
        let mut sorted: Vec<_> = fields.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let check_string = sorted
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut key_mac =
            HmacSha256::new_from_slice(SECRET_KEY_LABEL).expect("HMAC accepts any key");
        key_mac.update(BOT_TOKEN.as_bytes());
        let secret = key_mac.finalize().into_bytes();

        let mut mac = HmacSha256::new_from_slice(&secret).expect("HMAC accepts any key");
        mac.update(check_string.as_bytes());
        let hash = hex::encode(mac.finalize().into_bytes());

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in fields {
            serializer.append_pair(key, value);
        }
        serializer.append_pair("hash", &hash);
        serializer.finish()
    }

    fn sample_fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("query_id", "AAF9x1wAAAAA"),
            ("user", r#"{"id":6082937,"first_name":"Alice","username":"alice_w"}"#),
            ("auth_date", "1737000000"),
        ]
    }

    #[test]
    fn test_valid_session_yields_identity() {
        let auth = WebAppAuthenticator::new(BOT_TOKEN);
        let init_data = signed_init_data(&sample_fields());

        let identity = auth.verify(&init_data).expect("valid session must verify");
        assert_eq!(identity.user_id, 6082937);
        assert_eq!(identity.username.as_deref(), Some("alice_w"));
        assert_eq!(identity.first_name.as_deref(), Some("Alice"));
        assert_eq!(identity.auth_date, Some(1737000000));
    }

    #[test]
    fn test_any_single_character_tamper_is_rejected() {
        let auth = WebAppAuthenticator::new(BOT_TOKEN);
        let init_data = signed_init_data(&sample_fields());

        for index in 0..init_data.len() {
            if !init_data.is_char_boundary(index) {
                continue;
            }
            let mut tampered: Vec<u8> = init_data.clone().into_bytes();
            let original = tampered[index];
            tampered[index] = if original == b'0' { b'1' } else { b'0' };
            if tampered[index] == original {
                continue;
            }
            let Ok(tampered) = String::from_utf8(tampered) else {
                continue;
            };
            assert!(
                auth.verify(&tampered).is_none(),
                "tampered byte at {index} must not verify"
            );
        }
    }

    #[test]
    fn test_missing_hash_field_is_rejected() {
        let auth = WebAppAuthenticator::new(BOT_TOKEN);
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in sample_fields() {
            serializer.append_pair(key, value);
        }
        assert!(auth.verify(&serializer.finish()).is_none());
    }

    #[test]
    fn test_missing_user_payload_is_rejected() {
        let auth = WebAppAuthenticator::new(BOT_TOKEN);
        let init_data = signed_init_data(&[("query_id", "AAF9"), ("auth_date", "1737000000")]);
        assert!(auth.verify(&init_data).is_none());
    }

    #[test]
    fn test_malformed_user_json_is_rejected() {
        let auth = WebAppAuthenticator::new(BOT_TOKEN);
        let init_data = signed_init_data(&[
            ("user", "{not json"),
            ("auth_date", "1737000000"),
        ]);
        assert!(auth.verify(&init_data).is_none());
    }

    #[test]
    fn test_wrong_bot_token_is_rejected() {
        let other = WebAppAuthenticator::new("7000000002:AAdifferenttoken");
        let init_data = signed_init_data(&sample_fields());
        assert!(other.verify(&init_data).is_none());
    }
}
