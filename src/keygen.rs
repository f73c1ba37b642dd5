//! The distributed key-generation ceremony.
//!
//! Three phases, uniformly for every key family: GenShard asks each node to
//! generate its contribution, SendShard redistributes the transposed share
//! matrix and collects partial signatures over the assembled key, and
//! Commit persists the shares — only ever after the aggregate signature
//! verified. Generation runs against the full node set: a missing
//! participant makes the share set useless, so there is no quorum slack
//! here.
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{EdwardsPoint, Scalar};
use futures::future::join_all;

use crate::curve::{base_mul, cofactor_eq, point_to_bytes, scalar_from_hash512, sha256};
use crate::error::ProtocolError;
use crate::math::{median, sum_points, transpose};
use crate::messages::GenShardResponse;
use crate::orks::OrkList;
use crate::quorum::{gather_all, QuorumResult};
use crate::transport::{NodeClient, Transport};

/// The sentinel every node must answer to a commit.
const COMMIT_SENTINEL: &str = "Account Created";

/// Which server-side key family a ceremony is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// The master key derived for a user at sign-up.
    Cmk,
    /// The password-derived key protecting master-key shares at rest.
    Prism,
    /// The per-relying-party session key.
    Cvk,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Cmk => "CMK",
            KeyType::Prism => "Prism",
            KeyType::Cvk => "CVK",
        }
    }
}

/// Everything the GenShard round produces, ready for redistribution.
#[derive(Debug, Clone)]
pub struct GenShardAggregate {
    /// Row `j` holds the ciphertexts addressed to node `j`, one from each
    /// originator, in participant order.
    pub shares_by_recipient: Vec<Vec<String>>,
    /// Median of the per-node timestamps.
    pub timestamp: i64,
    /// `R2`: the sum of every node's random commitment.
    pub commitment: EdwardsPoint,
    /// Each supplied blinded input, multiplied by the assembled first
    /// secret (present only when every node contributed).
    pub multiplied: Vec<Option<EdwardsPoint>>,
    /// The aggregate public key: the sum of every node's partial.
    pub public: EdwardsPoint,
}

/// Fold the GenShard responses into one aggregate.
///
/// Responses must be in participant order — the share matrix transpose
/// relies on it to route each ciphertext to its intended recipient.
pub fn aggregate_gen_shard(
    responses: &[GenShardResponse],
) -> Result<GenShardAggregate, ProtocolError> {
    let Some(first) = responses.first() else {
        return Err(ProtocolError::AssertionFailed(
            "no share-generation responses to aggregate".to_string(),
        ));
    };
    if responses.iter().any(|r| r.yij_ciphers.len() != responses.len()) {
        return Err(ProtocolError::InvalidEncoding(
            "share matrix is not square".to_string(),
        ));
    }
    let width = first.multiplied.len();
    if responses.iter().any(|r| r.multiplied.len() != width) {
        return Err(ProtocolError::InvalidEncoding(
            "nodes disagree on the number of multiplied points".to_string(),
        ));
    }

    let shares_by_recipient = transpose(
        responses
            .iter()
            .map(|r| r.yij_ciphers.clone())
            .collect::<Vec<_>>(),
    )?;
    let timestamp = median(&responses.iter().map(|r| r.timestamp).collect::<Vec<_>>())?;

    let multiplied = (0..width)
        .map(|t| {
            responses
                .iter()
                .map(|r| r.multiplied[t])
                .try_fold(EdwardsPoint::identity(), |acc, p| p.map(|p| acc + p))
        })
        .collect();

    Ok(GenShardAggregate {
        shares_by_recipient,
        timestamp,
        commitment: sum_points(responses.iter().map(|r| &r.commitment)),
        multiplied,
        public: sum_points(responses.iter().map(|r| &r.partial_public)),
    })
}

/// Aggregate the SendShard partial signatures and verify the result.
///
/// `S = Σ Sᵢ` must satisfy, after cofactor clearing,
/// `g·S == R + public·H` where `R` sums every node's long-term public with
/// the ceremony commitment, and `H` binds the key, the median timestamp and
/// the key id. A mismatch means at least one node signed a different key
/// than the one assembled here — the ceremony must be abandoned, never
/// committed.
pub fn aggregate_send_shard(
    key_id: &str,
    partials: &[Scalar],
    ork_publics: &[EdwardsPoint],
    timestamp: i64,
    commitment: &EdwardsPoint,
    public: &EdwardsPoint,
) -> Result<Scalar, ProtocolError> {
    let s: Scalar = partials.iter().sum();

    let m = sha256(&[
        &point_to_bytes(public),
        timestamp.to_string().as_bytes(),
        key_id.as_bytes(),
    ]);
    let r = sum_points(ork_publics.iter()) + commitment;
    let h = scalar_from_hash512(&[&point_to_bytes(&r), &point_to_bytes(public), &m]);

    if !cofactor_eq(&base_mul(&s), &(r + public * h)) {
        return Err(ProtocolError::SignatureAggregationFailed(
            "key-generation signature does not match the assembled key".to_string(),
        ));
    }
    Ok(s)
}

/// Drives one key's generation ceremony against a fixed node set.
pub struct KeyGenerationFlow<'a, T> {
    orks: OrkList,
    transport: &'a T,
}

impl<'a, T: Transport> KeyGenerationFlow<'a, T> {
    pub fn new(orks: OrkList, transport: &'a T) -> Self {
        Self { orks, transport }
    }

    pub fn orks(&self) -> &OrkList {
        &self.orks
    }

    /// Ask every node to generate its contribution to `num_keys` fresh
    /// secrets, optionally multiplying the supplied blinded points by the
    /// first one.
    pub async fn gen_shard(
        &self,
        uid: &str,
        num_keys: usize,
        multipliers: &[Option<EdwardsPoint>],
    ) -> Result<GenShardAggregate, ProtocolError> {
        let ids = self.orks.ids();
        let calls: Vec<_> = self
            .orks
            .iter()
            .map(|ork| {
                let client = NodeClient::new(self.transport, &ork.url);
                let ids = ids.clone();
                async move { client.gen_shard(uid, &ids, num_keys, multipliers).await }
            })
            .collect();
        let responses = QuorumResult::values(gather_all(calls).await?);
        aggregate_gen_shard(&responses)
    }

    /// The re-share variant used while changing a password: each node
    /// additionally checks the one-time challenge it issued during the
    /// preceding conversion round.
    pub async fn update_shard(
        &self,
        uid: &str,
        decrypted_challenges: &[String],
        multiplier: &EdwardsPoint,
    ) -> Result<GenShardAggregate, ProtocolError> {
        if decrypted_challenges.len() != self.orks.len() {
            return Err(ProtocolError::AssertionFailed(format!(
                "{} challenges for {} nodes",
                decrypted_challenges.len(),
                self.orks.len()
            )));
        }
        let ids = self.orks.ids();
        let multipliers = [Some(*multiplier)];
        let calls: Vec<_> = self
            .orks
            .iter()
            .zip(decrypted_challenges)
            .map(|(ork, challenge)| {
                let client = NodeClient::new(self.transport, &ork.url);
                let ids = ids.clone();
                let multipliers = &multipliers;
                async move {
                    client
                        .update_shard(uid, &ids, challenge, multipliers)
                        .await
                }
            })
            .collect();
        let responses = QuorumResult::values(gather_all(calls).await?);
        aggregate_gen_shard(&responses)
    }

    /// Redistribute each node's column of the share matrix together with
    /// the ceremony commitment and the authorization point, then verify the
    /// aggregate signature the nodes return.
    pub async fn send_shard(
        &self,
        uid: &str,
        aggregate: &GenShardAggregate,
        auth: &EdwardsPoint,
        key_type: KeyType,
    ) -> Result<Scalar, ProtocolError> {
        if aggregate.shares_by_recipient.len() != self.orks.len() {
            return Err(ProtocolError::AssertionFailed(format!(
                "{} share columns for {} nodes",
                aggregate.shares_by_recipient.len(),
                self.orks.len()
            )));
        }
        let calls: Vec<_> = self
            .orks
            .iter()
            .zip(&aggregate.shares_by_recipient)
            .map(|(ork, shares)| {
                let client = NodeClient::new(self.transport, &ork.url);
                let commitment = aggregate.commitment;
                async move {
                    client
                        .send_shard(uid, shares, &commitment, auth, key_type)
                        .await
                }
            })
            .collect();
        let responses = QuorumResult::values(gather_all(calls).await?);
        let partials: Vec<Scalar> = responses.iter().map(|r| r.partial_signature).collect();
        aggregate_send_shard(
            uid,
            &partials,
            &self.orks.publics(),
            aggregate.timestamp,
            &aggregate.commitment,
            &aggregate.public,
        )
    }

    /// Tell every node to persist its share as final.
    ///
    /// Every node must answer the success sentinel. A deviation is
    /// `CommitFailed` and is not retried here: some nodes may already have
    /// committed, and the client cannot roll that back.
    pub async fn commit(
        &self,
        uid: &str,
        signature: &Scalar,
        key_type: KeyType,
        prism_auth: Option<&EdwardsPoint>,
    ) -> Result<(), ProtocolError> {
        let calls: Vec<_> = self
            .orks
            .iter()
            .map(|ork| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move { client.commit(uid, signature, key_type, prism_auth).await }
            })
            .collect();
        for (ork, outcome) in self.orks.iter().zip(join_all(calls).await) {
            match outcome {
                Ok(body) if body == COMMIT_SENTINEL => {}
                Ok(body) => {
                    return Err(ProtocolError::CommitFailed(format!(
                        "node {} answered {:?}",
                        ork.id, body
                    )))
                }
                Err(e) => {
                    return Err(ProtocolError::CommitFailed(format!(
                        "node {}: {}",
                        ork.id, e
                    )))
                }
            }
        }
        Ok(())
    }
}
