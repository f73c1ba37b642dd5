//! Ed25519 group helpers shared by every protocol round.
//!
//! All transported points are compressed Edwards-Y encodings, base64 where a
//! wire field needs text. Decoding is a security boundary: malformed or
//! off-curve input must fail loudly, never fall back to a default point.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{EdwardsPoint, Scalar};
use digest::Digest;
use sha2::{Sha256, Sha512};

use crate::error::ProtocolError;

/// Multiply the Ed25519 base point by a scalar.
pub fn base_mul(x: &Scalar) -> EdwardsPoint {
    EdwardsPoint::mul_base(x)
}

pub fn point_to_bytes(p: &EdwardsPoint) -> [u8; 32] {
    p.compress().to_bytes()
}

pub fn point_from_bytes(bytes: &[u8]) -> Result<EdwardsPoint, ProtocolError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidEncoding(format!("point must be 32 bytes, got {}", bytes.len())))?;
    CompressedEdwardsY(arr)
        .decompress()
        .ok_or_else(|| ProtocolError::InvalidEncoding("encoding is not a curve point".to_string()))
}

pub fn point_to_base64(p: &EdwardsPoint) -> String {
    STANDARD.encode(point_to_bytes(p))
}

pub fn point_from_base64(data: &str) -> Result<EdwardsPoint, ProtocolError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| ProtocolError::InvalidEncoding(format!("bad base64 point: {}", e)))?;
    point_from_bytes(&bytes)
}

pub fn scalar_to_bytes(x: &Scalar) -> [u8; 32] {
    x.to_bytes()
}

pub fn scalar_to_base64(x: &Scalar) -> String {
    STANDARD.encode(x.to_bytes())
}

/// Decode a scalar from its 32-byte little-endian form.
///
/// Non-canonical encodings (values at or above the group order) are
/// rejected rather than silently reduced.
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, ProtocolError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidEncoding(format!("scalar must be 32 bytes, got {}", bytes.len())))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(arr))
        .ok_or_else(|| ProtocolError::InvalidEncoding("scalar is not in canonical form".to_string()))
}

pub fn scalar_from_base64(data: &str) -> Result<Scalar, ProtocolError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| ProtocolError::InvalidEncoding(format!("bad base64 scalar: {}", e)))?;
    scalar_from_bytes(&bytes)
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hash to a scalar through SHA-512 with wide reduction.
///
/// This is the reduction rule for every signature challenge in the
/// protocol, so both sides of the wire agree bit-for-bit.
pub fn scalar_from_hash512(parts: &[&[u8]]) -> Scalar {
    Scalar::from_bytes_mod_order_wide(&sha512(parts))
}

/// Hash to a scalar through SHA-256, reducing the digest mod the group order.
pub fn scalar_from_hash256(parts: &[&[u8]]) -> Scalar {
    Scalar::from_bytes_mod_order(sha256(parts))
}

/// Deterministically map arbitrary bytes to a prime-order point.
///
/// Try-and-increment: interpret SHA-256(msg ‖ ctr) as a compressed point
/// until one decodes, then clear the cofactor. About half of all digests
/// decode, so the loop terminates almost immediately.
pub fn hash_to_point(msg: &[u8]) -> EdwardsPoint {
    for ctr in 0u8..=255 {
        let digest = sha256(&[msg, &[ctr]]);
        if let Some(p) = CompressedEdwardsY(digest).decompress() {
            let cleared = p.mul_by_cofactor();
            if cleared != EdwardsPoint::identity() {
                return cleared;
            }
        }
    }
    // 256 consecutive failures has probability ~2^-256.
    EdwardsPoint::mul_base(&Scalar::from_bytes_mod_order(sha256(&[msg])))
}

/// Modular inverse over the group order.
///
/// The order is prime, so zero is the only scalar without an inverse.
pub fn invert(x: &Scalar) -> Result<Scalar, ProtocolError> {
    if x == &Scalar::ZERO {
        return Err(ProtocolError::NotInvertible);
    }
    Ok(x.invert())
}

/// Equality after clearing the cofactor on both sides.
///
/// Every aggregate signature equation is checked in the prime-order
/// subgroup, so small-torsion components contributed by decoded points
/// cannot flip a verdict.
pub fn cofactor_eq(a: &EdwardsPoint, b: &EdwardsPoint) -> bool {
    a.mul_by_cofactor() == b.mul_by_cofactor()
}
