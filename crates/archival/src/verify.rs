//! Chat-platform request verification
//!
//! Both verifiers authenticate the raw request body against a timestamp
//! header and reject requests older (or newer) than [`REPLAY_WINDOW_SECS`].
//! A bad request is a [`SignatureRejection`], never a panic.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Maximum distance between a request timestamp and now.
pub const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureRejection {
    #[error("missing signature headers")]
    MissingHeaders,
    #[error("request timestamp outside the allowed window")]
    StaleTimestamp,
    #[error("malformed signature")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

pub trait SignatureVerifier: Send + Sync {
    fn timestamp_header(&self) -> &'static str;

    fn signature_header(&self) -> &'static str;

    /// Verify against an explicit unix time.
    fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureRejection>;

    fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), SignatureRejection> {
        self.verify_at(
            timestamp,
            signature,
            body,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }
}

fn required<'a>(
    timestamp: Option<&'a str>,
    signature: Option<&'a str>,
) -> Result<(&'a str, &'a str), SignatureRejection> {
    match (timestamp, signature) {
        (Some(ts), Some(sig)) if !ts.is_empty() && !sig.is_empty() => Ok((ts, sig)),
        _ => Err(SignatureRejection::MissingHeaders),
    }
}

fn check_timestamp(timestamp: &str, now: i64) -> Result<(), SignatureRejection> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureRejection::Malformed)?;
    if (now - ts).abs() > REPLAY_WINDOW_SECS {
        return Err(SignatureRejection::StaleTimestamp);
    }
    Ok(())
}

/// Slack request signing: HMAC-SHA256 over `v0:{timestamp}:{body}`.
#[derive(Clone)]
pub struct SlackSignatureVerifier {
    signing_secret: String,
}

impl SlackSignatureVerifier {
    pub fn new(signing_secret: impl Into<String>) -> Self {
        Self {
            signing_secret: signing_secret.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn sign(&self, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for SlackSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSignatureVerifier")
            .field("signing_secret", &"[REDACTED]")
            .finish()
    }
}

impl SignatureVerifier for SlackSignatureVerifier {
    fn timestamp_header(&self) -> &'static str {
        "x-slack-request-timestamp"
    }

    fn signature_header(&self) -> &'static str {
        "x-slack-signature"
    }

    fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureRejection> {
        let (timestamp, signature) = required(timestamp, signature)?;
        check_timestamp(timestamp, now)?;

        let expected = signature
            .strip_prefix("v0=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(SignatureRejection::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .map_err(|_| SignatureRejection::Malformed)?;
        mac.update(format!("v0:{timestamp}:").as_bytes());
        mac.update(body);

        // Constant-time comparison
        mac.verify_slice(&expected)
            .map_err(|_| SignatureRejection::Mismatch)
    }
}

#[derive(Debug, Error)]
#[error("invalid Discord public key: {0}")]
pub struct InvalidPublicKey(String);

/// Discord interaction signing: Ed25519 over `{timestamp}{body}`.
#[derive(Debug, Clone)]
pub struct DiscordSignatureVerifier {
    public_key: VerifyingKey,
}

impl DiscordSignatureVerifier {
    pub fn new(public_key: VerifyingKey) -> Self {
        Self { public_key }
    }

    /// Parse the application's hex-encoded public key.
    pub fn from_hex(public_key_hex: &str) -> Result<Self, InvalidPublicKey> {
        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|e| InvalidPublicKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| InvalidPublicKey("expected 32 bytes".to_string()))?;
        let public_key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| InvalidPublicKey(e.to_string()))?;
        Ok(Self { public_key })
    }
}

impl SignatureVerifier for DiscordSignatureVerifier {
    fn timestamp_header(&self) -> &'static str {
        "x-signature-timestamp"
    }

    fn signature_header(&self) -> &'static str {
        "x-signature-ed25519"
    }

    fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureRejection> {
        let (timestamp, signature) = required(timestamp, signature)?;
        check_timestamp(timestamp, now)?;

        let sig_bytes = hex::decode(signature).map_err(|_| SignatureRejection::Malformed)?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| SignatureRejection::Malformed)?;
        let signature = Signature::from_bytes(&sig_array);

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.public_key
            .verify(&message, &signature)
            .map_err(|_| SignatureRejection::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn slack_accepts_valid_signature() {
        let verifier = SlackSignatureVerifier::new("8f742231b10e8888abcd99yyyzzz85a5");
        let body = br#"{"type":"event_callback"}"#;
        let sig = verifier.sign("1700000000", body);

        assert!(verifier
            .verify_at(Some("1700000000"), Some(&sig), body, NOW)
            .is_ok());
    }

    #[test]
    fn slack_rejects_tampered_body() {
        let verifier = SlackSignatureVerifier::new("secret");
        let sig = verifier.sign("1700000000", b"original");

        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some(&sig), b"tampered", NOW),
            Err(SignatureRejection::Mismatch)
        );
    }

    #[test]
    fn slack_rejects_stale_and_future_timestamps() {
        let verifier = SlackSignatureVerifier::new("secret");
        let old = (NOW - 301).to_string();
        let future = (NOW + 301).to_string();

        let sig = verifier.sign(&old, b"body");
        assert_eq!(
            verifier.verify_at(Some(&old), Some(&sig), b"body", NOW),
            Err(SignatureRejection::StaleTimestamp)
        );
        let sig = verifier.sign(&future, b"body");
        assert_eq!(
            verifier.verify_at(Some(&future), Some(&sig), b"body", NOW),
            Err(SignatureRejection::StaleTimestamp)
        );

        // Exactly at the edge of the window is still accepted
        let edge = (NOW - 300).to_string();
        let sig = verifier.sign(&edge, b"body");
        assert!(verifier.verify_at(Some(&edge), Some(&sig), b"body", NOW).is_ok());
    }

    #[test]
    fn slack_missing_and_malformed_headers() {
        let verifier = SlackSignatureVerifier::new("secret");
        assert_eq!(
            verifier.verify_at(None, Some("v0=abcd"), b"body", NOW),
            Err(SignatureRejection::MissingHeaders)
        );
        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some(""), b"body", NOW),
            Err(SignatureRejection::MissingHeaders)
        );
        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some("v1=abcd"), b"body", NOW),
            Err(SignatureRejection::Malformed)
        );
        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some("v0=not-hex"), b"body", NOW),
            Err(SignatureRejection::Malformed)
        );
        assert_eq!(
            verifier.verify_at(Some("yesterday"), Some("v0=abcd"), b"body", NOW),
            Err(SignatureRejection::Malformed)
        );
    }

    #[test]
    fn slack_debug_redacts_secret() {
        let verifier = SlackSignatureVerifier::new("super-secret");
        assert!(!format!("{verifier:?}").contains("super-secret"));
    }

    fn discord_pair() -> (SigningKey, DiscordSignatureVerifier) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifier =
            DiscordSignatureVerifier::from_hex(&hex::encode(signing.verifying_key().to_bytes()))
                .unwrap();
        (signing, verifier)
    }

    #[test]
    fn discord_accepts_valid_signature() {
        let (signing, verifier) = discord_pair();
        let body = br#"{"type":1}"#;
        let sig = signing.sign(&[b"1700000000".as_slice(), body.as_slice()].concat());

        assert!(verifier
            .verify_at(
                Some("1700000000"),
                Some(&hex::encode(sig.to_bytes())),
                body,
                NOW
            )
            .is_ok());
    }

    #[test]
    fn discord_rejects_signature_over_other_timestamp() {
        let (signing, verifier) = discord_pair();
        let body = br#"{"type":1}"#;
        let sig = signing.sign(&[b"1700000001".as_slice(), body.as_slice()].concat());

        assert_eq!(
            verifier.verify_at(
                Some("1700000000"),
                Some(&hex::encode(sig.to_bytes())),
                body,
                NOW
            ),
            Err(SignatureRejection::Mismatch)
        );
    }

    #[test]
    fn discord_malformed_signature_is_rejected_not_panicking() {
        let (_, verifier) = discord_pair();
        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some("zz"), b"{}", NOW),
            Err(SignatureRejection::Malformed)
        );
        assert_eq!(
            verifier.verify_at(Some("1700000000"), Some("abcd"), b"{}", NOW),
            Err(SignatureRejection::Malformed)
        );
        assert_eq!(
            verifier.verify_at(Some("1699999000"), Some("abcd"), b"{}", NOW),
            Err(SignatureRejection::StaleTimestamp)
        );
    }

    #[test]
    fn discord_invalid_public_key() {
        assert!(DiscordSignatureVerifier::from_hex("abcd").is_err());
        assert!(DiscordSignatureVerifier::from_hex("not hex").is_err());
    }
}
