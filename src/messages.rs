//! Typed per-node payloads.
//!
//! Each value here is decoded from one node's wire response (or from a
//! decrypted blob inside one), folded into an aggregate exactly once, and
//! never retained. Field names follow the node fleet's JSON. Points and
//! scalars are validated on decode; a malformed field fails the whole
//! payload rather than defaulting.
use curve25519_dalek::{EdwardsPoint, Scalar};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

pub(crate) fn decode_json<T: DeserializeOwned>(data: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(data).map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("failed to encode value")
}

pub(crate) mod point_b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &EdwardsPoint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&crate::curve::point_to_base64(p))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<EdwardsPoint, D::Error> {
        let raw = String::deserialize(d)?;
        crate::curve::point_from_base64(&raw).map_err(D::Error::custom)
    }
}

pub(crate) mod opt_point_b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &Option<EdwardsPoint>, s: S) -> Result<S::Ok, S::Error> {
        match p {
            Some(p) => s.serialize_some(&crate::curve::point_to_base64(p)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<EdwardsPoint>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| crate::curve::point_from_base64(&r).map_err(D::Error::custom))
            .transpose()
    }
}

pub(crate) mod vec_opt_point_b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ps: &[Option<EdwardsPoint>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(
            ps.iter()
                .map(|p| p.as_ref().map(crate::curve::point_to_base64)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<Option<EdwardsPoint>>, D::Error> {
        let raw = Vec::<Option<String>>::deserialize(d)?;
        raw.into_iter()
            .map(|p| {
                p.map(|r| crate::curve::point_from_base64(&r).map_err(D::Error::custom))
                    .transpose()
            })
            .collect()
    }
}

pub(crate) mod scalar_b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &Scalar, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&crate::curve::scalar_to_base64(x))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Scalar, D::Error> {
        let raw = String::deserialize(d)?;
        crate::curve::scalar_from_base64(&raw).map_err(D::Error::custom)
    }
}

pub(crate) mod opt_scalar_b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &Option<Scalar>, s: S) -> Result<S::Ok, S::Error> {
        match x {
            Some(x) => s.serialize_some(&crate::curve::scalar_to_base64(x)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Scalar>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| crate::curve::scalar_from_base64(&r).map_err(D::Error::custom))
            .transpose()
    }
}

pub(crate) mod i64_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(x: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&x.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// One node's contribution to the share-generation round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenShardResponse {
    /// One ciphertext per destination node, in participant-id order.
    #[serde(rename = "YijCiphers")]
    pub yij_ciphers: Vec<String>,
    /// The node's random commitment contribution.
    #[serde(rename = "GRi", with = "point_b64")]
    pub commitment: EdwardsPoint,
    #[serde(rename = "Timestampi", with = "i64_string")]
    pub timestamp: i64,
    /// Supplied blinded points, each multiplied by the node's first secret.
    #[serde(rename = "GMultiplied", with = "vec_opt_point_b64")]
    pub multiplied: Vec<Option<EdwardsPoint>>,
    /// The node's contribution to the aggregate public key.
    #[serde(rename = "GK1i", with = "point_b64")]
    pub partial_public: EdwardsPoint,
}

/// One node's partial signature over the assembled key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendShardResponse {
    #[serde(rename = "Si", with = "scalar_b64")]
    pub partial_signature: Scalar,
}

/// One CMK node's answer to the blinded conversion round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertResponse {
    /// AEAD blob only the right password can open; see
    /// [`EncryptedConvertResponse`].
    #[serde(rename = "EncryptedData")]
    pub encrypted_data: String,
    #[serde(rename = "GBlurPassPrism", with = "point_b64")]
    pub blur_pass_prism: EdwardsPoint,
    #[serde(rename = "Timestampi", with = "i64_string")]
    pub timestamp: i64,
}

/// The password-only variant of the conversion round, used while changing
/// a password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrismConvertResponse {
    #[serde(rename = "EncryptedChallenge")]
    pub encrypted_challenge: String,
    #[serde(rename = "GBlurPassPrism", with = "point_b64")]
    pub blur_pass_prism: EdwardsPoint,
    #[serde(rename = "Timestampi", with = "i64_string")]
    pub timestamp: i64,
}

/// The plaintext inside a [`ConvertResponse`] blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedConvertResponse {
    /// One-time value to echo back during authentication.
    #[serde(rename = "Challengei")]
    pub challenge: String,
    /// The node's contribution to the blinded user-identity point.
    #[serde(rename = "GBlurUserCMKi", with = "point_b64")]
    pub blur_user_cmk: EdwardsPoint,
    /// The node's nonce commitment for the upcoming blind signature.
    #[serde(rename = "GCMKRi", with = "point_b64")]
    pub cmk_commitment: EdwardsPoint,
}

/// The client half of the authentication request, AEAD-encrypted per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "UserId")]
    pub user_id: String,
    #[serde(rename = "BlurHCMKMuli", with = "scalar_b64")]
    pub blur_h_cmk_mul: Scalar,
}

/// One node's blind-signature share, decrypted from its authentication
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    #[serde(rename = "Si", with = "scalar_b64")]
    pub partial_signature: Scalar,
    #[serde(rename = "GBlindHi", with = "point_b64")]
    pub blind_h: EdwardsPoint,
}

/// One session node's nonce commitments, decrypted from its pre-sign
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreSignInResponse {
    #[serde(rename = "GR1", with = "point_b64")]
    pub commitment: EdwardsPoint,
    /// Present only when a model-to-sign was requested.
    #[serde(rename = "GR2", default, with = "opt_point_b64")]
    pub model_commitment: Option<EdwardsPoint>,
}

/// One session node's final signature shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    #[serde(rename = "S1", with = "scalar_b64")]
    pub credential_share: Scalar,
    #[serde(rename = "S2", default, with = "opt_scalar_b64")]
    pub model_share: Option<Scalar>,
}

macro_rules! from_json_impl {
    ($($type:ty),* $(,)?) => {
        $(impl $type {
            pub fn from_json(data: &str) -> Result<Self, ProtocolError> {
                decode_json(data)
            }
        })*
    };
}

from_json_impl!(
    GenShardResponse,
    SendShardResponse,
    ConvertResponse,
    PrismConvertResponse,
    EncryptedConvertResponse,
    AuthRequest,
    AuthenticateResponse,
    PreSignInResponse,
    SignInResponse,
);
