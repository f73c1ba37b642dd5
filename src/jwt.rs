//! The session credential: a JWT carrying the session public key, signed
//! with the threshold-held session key.
//!
//! `header.payload` is the signing message; the third segment, when
//! present, is `R ‖ S` base64url. A two-segment token is unsigned and must
//! never be trusted by a verifier.
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use curve25519_dalek::{EdwardsPoint, Scalar};
use serde::{Deserialize, Serialize};

use crate::curve::{
    base_mul, cofactor_eq, point_from_bytes, point_to_base64, point_to_bytes, scalar_from_bytes,
    scalar_from_hash512,
};
use crate::error::ProtocolError;

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// The credential's claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// The session public key this credential vouches for.
    #[serde(rename = "gSessKeyPub")]
    pub session_public: String,
    /// The relying party's long-term public key.
    #[serde(rename = "gVVK")]
    pub vendor_public: String,
}

fn segment<T: Serialize>(value: &T) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).expect("failed to encode value"))
}

/// Build an unsigned credential expiring `minutes_to_expiry` from now.
pub fn issue(
    uid: &str,
    minutes_to_expiry: i64,
    session_public: &EdwardsPoint,
    vendor_public: &str,
    now: i64,
) -> String {
    let header = Header {
        alg: "EdDSA".to_string(),
        typ: "JWT".to_string(),
    };
    let claims = Claims {
        uid: uid.to_string(),
        exp: now + minutes_to_expiry * 60,
        session_public: point_to_base64(session_public),
        vendor_public: vendor_public.to_string(),
    };
    format!("{}.{}", segment(&header), segment(&claims))
}

/// Append the aggregate signature to an unsigned credential.
pub fn append_signature(token: &str, commitment: &EdwardsPoint, signature: &Scalar) -> String {
    let mut sig = point_to_bytes(commitment).to_vec();
    sig.extend_from_slice(&signature.to_bytes());
    format!("{}.{}", token, URL_SAFE_NO_PAD.encode(sig))
}

/// Read the claims back out of a credential.
pub fn claims(token: &str) -> Result<Claims, ProtocolError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ProtocolError::InvalidEncoding("credential has no payload".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ProtocolError::InvalidEncoding(format!("bad payload segment: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
}

/// Verify a detached `R ‖ S` signature over arbitrary bytes.
///
/// Standard cofactored check: `8·g·S == 8·R + 8·pub·k` with
/// `k = SHA-512(R ‖ pub ‖ msg)`. Out-of-range `S`, a zero `S`, or a bad
/// point all verify as false — never as a panic.
pub fn verify_detached(signature: &[u8], public: &EdwardsPoint, message: &[u8]) -> bool {
    if signature.len() != 64 {
        return false;
    }
    let Ok(r) = point_from_bytes(&signature[..32]) else {
        return false;
    };
    let Ok(s) = scalar_from_bytes(&signature[32..]) else {
        return false;
    };
    if s == Scalar::ZERO {
        return false;
    }
    let k = scalar_from_hash512(&[&signature[..32], &point_to_bytes(public), message]);
    cofactor_eq(&base_mul(&s), &(r + public * k))
}

/// Same as [`verify_detached`], for a base64-encoded signature.
pub fn verify_detached_base64(signature: &str, public: &EdwardsPoint, message: &[u8]) -> bool {
    match STANDARD.decode(signature) {
        Ok(sig) => verify_detached(&sig, public, message),
        Err(_) => false,
    }
}

/// Verify a signed credential against the aggregate session-signing public
/// key. Unsigned or malformed tokens verify as false.
pub fn verify(token: &str, public: &EdwardsPoint) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = segments[..] else {
        return false;
    };
    let Ok(sig) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let message = format!("{}.{}", header, payload);
    verify_detached(&sig, public, message.as_bytes())
}
