//! The remote collaborators the protocol core drives, and the typed node
//! client built on top of them.
//!
//! Transport is deliberately opaque: one asynchronous call per logical node
//! operation, a text body in, a text body out. The implementation owns
//! connection handling, deadlines and retries; the core only requires that
//! every call eventually yields a result or a failure, and that failures
//! distinguish rate limiting from everything else.
use async_trait::async_trait;
use core::fmt;
use curve25519_dalek::{EdwardsPoint, Scalar};
use std::error;

use crate::curve::{point_to_base64, scalar_to_base64};
use crate::error::ProtocolError;
use crate::keygen::KeyType;
use crate::messages::{ConvertResponse, GenShardResponse, PrismConvertResponse, SendShardResponse};
use crate::orks::OrkInfo;

/// Represents an error surfaced by a single remote call.
#[derive(Debug)]
pub enum TransportError {
    /// The node refused because the account has made too many attempts.
    RateLimited,
    /// The node could not be reached at all.
    Unreachable(String),
    /// The node answered, but with an application-level failure.
    Node(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::RateLimited => write!(f, "too many attempts"),
            TransportError::Unreachable(e) => write!(f, "node unreachable: {}", e),
            TransportError::Node(e) => write!(f, "node error: {}", e),
        }
    }
}

impl error::Error for TransportError {}

impl TransportError {
    /// Collapse a collaborator failure outside any quorum round into the
    /// protocol taxonomy.
    pub(crate) fn into_protocol(self) -> ProtocolError {
        match self {
            TransportError::RateLimited => {
                ProtocolError::QuorumNotMet(crate::error::QuorumFailure::RateLimited)
            }
            _ => ProtocolError::QuorumNotMet(crate::error::QuorumFailure::NodesUnreachable),
        }
    }
}

/// A form-encoded POST to one endpoint, yielding the response body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(
        &self,
        endpoint: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError>;
}

/// The directory service mapping users to their node sets and key publics.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_all_orks(&self) -> Result<Vec<OrkInfo>, TransportError>;
    async fn list_active_orks(&self) -> Result<Vec<OrkInfo>, TransportError>;
    async fn get_user_orks(&self, uid: &str) -> Result<Vec<OrkInfo>, TransportError>;
    async fn get_key_public(&self, uid: &str) -> Result<EdwardsPoint, TransportError>;
}

/// The relying party's decryption-proof endpoint.
#[async_trait]
pub trait Vendor: Send + Sync {
    /// Submit a pair of ciphertexts and a credential; anything other than
    /// the `"Test Passed"` sentinel is a failure.
    async fn decryption_test(
        &self,
        encrypted_by_user_key: &str,
        encrypted_by_vendor_key: &str,
        credential: &str,
        ork_url: &str,
    ) -> Result<String, TransportError>;
}

/// Arguments for the final credential-signing call, one per session node.
pub struct SignInCvkArgs<'a> {
    /// The unsigned credential (header.payload).
    pub credential: &'a str,
    pub timestamp: i64,
    /// `gRMul`, the unblinded authentication commitment.
    pub auth_commitment: &'a EdwardsPoint,
    /// The verified aggregate blind signature.
    pub blind_signature: &'a Scalar,
    /// `gCVKR`, the aggregate session nonce commitment.
    pub session_commitment: &'a EdwardsPoint,
    /// This node's Lagrange coefficient for the surviving set.
    pub coefficient: &'a Scalar,
    pub blind_h: &'a EdwardsPoint,
    pub mode: &'a str,
    pub model_to_sign: Option<&'a str>,
    /// `gR2`, the aggregate model nonce commitment.
    pub model_commitment: Option<&'a EdwardsPoint>,
    pub committed: bool,
}

/// A typed client for one ORK node.
///
/// Builds the form bodies (points base64, integers decimal strings,
/// structured values JSON) and decodes responses into [`crate::messages`]
/// types. An undecodable response counts as that node failing, which the
/// quorum layer then absorbs or surfaces.
pub struct NodeClient<'a, T> {
    transport: &'a T,
    url: String,
}

fn decode<T>(result: Result<T, ProtocolError>) -> Result<T, TransportError> {
    result.map_err(|e| TransportError::Node(e.to_string()))
}

fn ids_field(ids: &[u64]) -> String {
    crate::messages::encode_json(&ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())
}

fn multipliers_field(multipliers: &[Option<EdwardsPoint>]) -> String {
    crate::messages::encode_json(
        &multipliers
            .iter()
            .map(|p| p.as_ref().map(point_to_base64))
            .collect::<Vec<_>>(),
    )
}

impl<'a, T: Transport> NodeClient<'a, T> {
    pub fn new(transport: &'a T, url: &str) -> Self {
        Self {
            transport,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str, uid: &str) -> String {
        format!("{}{}?uid={}", self.url, path, uid)
    }

    async fn post(
        &self,
        path: &str,
        uid: &str,
        fields: Vec<(&str, String)>,
    ) -> Result<String, TransportError> {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.transport
            .call(&self.endpoint(path, uid), &fields)
            .await
    }

    pub async fn gen_shard(
        &self,
        uid: &str,
        ids: &[u64],
        num_keys: usize,
        multipliers: &[Option<EdwardsPoint>],
    ) -> Result<GenShardResponse, TransportError> {
        let body = self
            .post(
                "/Create/GenShard",
                uid,
                vec![
                    ("mIdORKij", ids_field(ids)),
                    ("numKeys", num_keys.to_string()),
                    ("gMultipliers", multipliers_field(multipliers)),
                ],
            )
            .await?;
        decode(GenShardResponse::from_json(&body))
    }

    pub async fn update_shard(
        &self,
        uid: &str,
        ids: &[u64],
        decrypted_challenge: &str,
        multipliers: &[Option<EdwardsPoint>],
    ) -> Result<GenShardResponse, TransportError> {
        let body = self
            .post(
                "/Create/UpdateShard",
                uid,
                vec![
                    ("mIdORKij", ids_field(ids)),
                    ("gMultipliers", multipliers_field(multipliers)),
                    ("decryptedChallengei", decrypted_challenge.to_string()),
                ],
            )
            .await?;
        decode(GenShardResponse::from_json(&body))
    }

    pub async fn send_shard(
        &self,
        uid: &str,
        shares: &[String],
        commitment: &EdwardsPoint,
        auth: &EdwardsPoint,
        key_type: KeyType,
    ) -> Result<SendShardResponse, TransportError> {
        let body = self
            .post(
                "/Create/SendShard",
                uid,
                vec![
                    ("yijCipher", crate::messages::encode_json(&shares)),
                    ("R2", point_to_base64(commitment)),
                    ("auth", point_to_base64(auth)),
                    ("keyType", key_type.as_str().to_string()),
                ],
            )
            .await?;
        decode(SendShardResponse::from_json(&body))
    }

    /// The commit response must literally be the success sentinel; anything
    /// else is reported verbatim for reconciliation.
    pub async fn commit(
        &self,
        uid: &str,
        signature: &Scalar,
        key_type: KeyType,
        prism_auth: Option<&EdwardsPoint>,
    ) -> Result<String, TransportError> {
        let mut fields = vec![
            ("S", scalar_to_base64(signature)),
            ("keyType", key_type.as_str().to_string()),
        ];
        if let Some(auth) = prism_auth {
            fields.push(("gPRISMAuth", point_to_base64(auth)));
        }
        self.post("/Create/Commit", uid, fields).await
    }

    pub async fn convert(
        &self,
        uid: &str,
        blur_user: &EdwardsPoint,
        blur_pass: &EdwardsPoint,
        committed: bool,
    ) -> Result<ConvertResponse, TransportError> {
        let body = self
            .post(
                "/CMK/Convert",
                uid,
                vec![
                    ("gBlurUser", point_to_base64(blur_user)),
                    ("gBlurPass", point_to_base64(blur_pass)),
                    ("cmkCommitted", committed.to_string()),
                    ("prismCommitted", committed.to_string()),
                ],
            )
            .await?;
        decode(ConvertResponse::from_json(&body))
    }

    pub async fn prism_convert(
        &self,
        uid: &str,
        blur_pass: &EdwardsPoint,
        committed: bool,
    ) -> Result<PrismConvertResponse, TransportError> {
        let body = self
            .post(
                "/Prism/Convert",
                uid,
                vec![
                    ("gBlurPass", point_to_base64(blur_pass)),
                    ("prismCommitted", committed.to_string()),
                ],
            )
            .await?;
        decode(PrismConvertResponse::from_json(&body))
    }

    /// Returns the node's AEAD-encrypted blind-signature share.
    pub async fn authenticate(
        &self,
        uid: &str,
        decrypted_challenge: &str,
        enc_auth_request: &str,
        committed: bool,
    ) -> Result<String, TransportError> {
        self.post(
            "/CMK/Authenticate",
            uid,
            vec![
                ("decryptedChallenge", decrypted_challenge.to_string()),
                ("encAuthRequest", enc_auth_request.to_string()),
                ("cmkCommitted", committed.to_string()),
                ("prismCommitted", committed.to_string()),
            ],
        )
        .await
    }

    /// Returns the node's AEAD-encrypted session nonce commitments.
    pub async fn pre_sign_in_cvk(
        &self,
        vuid: &str,
        session_public: &EdwardsPoint,
        model_requested: bool,
        committed: bool,
    ) -> Result<String, TransportError> {
        self.post(
            "/CVK/PreSignIn",
            vuid,
            vec![
                ("gSessKeyPub", point_to_base64(session_public)),
                ("modelToSignRequested", model_requested.to_string()),
                ("cvkCommitted", committed.to_string()),
            ],
        )
        .await
    }

    /// Returns the node's AEAD-encrypted final signature shares.
    pub async fn sign_in_cvk(
        &self,
        vuid: &str,
        args: &SignInCvkArgs<'_>,
    ) -> Result<String, TransportError> {
        let mut fields = vec![
            ("jwt", args.credential.to_string()),
            ("timestamp2", args.timestamp.to_string()),
            ("gRMul", point_to_base64(args.auth_commitment)),
            ("s", scalar_to_base64(args.blind_signature)),
            ("gCVKR", point_to_base64(args.session_commitment)),
            ("li", scalar_to_base64(args.coefficient)),
            ("gBlindH", point_to_base64(args.blind_h)),
            ("mode", args.mode.to_string()),
            ("cvkCommitted", args.committed.to_string()),
        ];
        if let Some(model) = args.model_to_sign {
            fields.push(("modelToSign", model.to_string()));
        }
        if let Some(commitment) = args.model_commitment {
            fields.push(("gR2", point_to_base64(commitment)));
        }
        self.post("/CVK/SignIn", vuid, fields).await
    }
}
