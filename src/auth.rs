//! The multi-round password-authenticated key protocol.
//!
//! Round one converts blinded user and password points into per-node
//! symmetric keys and session material; round two proves the password to
//! the master-key nodes with a blind signature while the session nodes
//! prepare nonce commitments; round three collects the threshold signature
//! over the session credential. Blinding randoms are drawn fresh per run —
//! reusing one across two conversions breaks the blinding outright.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand_core::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroize;

use crate::aead::{self, AeadError, AeadKey};
use crate::curve::{
    base_mul, cofactor_eq, invert, point_to_base64, point_to_bytes, scalar_from_hash256,
    scalar_from_hash512, sha256, sha512,
};
use crate::error::ProtocolError;
use crate::jwt;
use crate::math::{interpolate_points, interpolate_scalars, median, sum_points};
use crate::messages::{
    encode_json, AuthRequest, AuthenticateResponse, EncryptedConvertResponse, PreSignInResponse,
    SignInResponse,
};
use crate::orks::OrkList;
use crate::quorum::{gather_all, gather_threshold, QuorumResult};
use crate::transport::{NodeClient, SignInCvkArgs, Transport};

/// Domain separator for the blind-signature check.
const AUTH_DOMAIN: &[u8] = b"CMK authentication";
/// Session credentials expire after half an hour.
const CREDENTIAL_MINUTES: i64 = 30;

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A failed AEAD open on the authentication path means the derived keys
/// are wrong, which means the password was.
fn wrong_password(e: AeadError) -> ProtocolError {
    match e {
        AeadError::Failed => ProtocolError::WrongPassword,
        AeadError::Malformed => {
            ProtocolError::InvalidEncoding("damaged encrypted payload".to_string())
        }
    }
}

fn decrypt_json<M, F>(blob: &str, key: &AeadKey, parse: F, on_fail: fn(AeadError) -> ProtocolError) -> Result<M, ProtocolError>
where
    F: Fn(&str) -> Result<M, ProtocolError>,
{
    let plain = aead::decrypt(blob, key).map_err(on_fail)?;
    let text = String::from_utf8(plain)
        .map_err(|_| ProtocolError::InvalidEncoding("payload is not UTF-8".to_string()))?;
    parse(&text)
}

/// Session material carried from the conversion round into the later ones.
pub struct PreSignData {
    /// Per-node symmetric keys derived from the password point, aligned
    /// with the surviving master-key node list.
    pub prism_auths: Vec<AeadKey>,
    /// The blind applied to the authentication exchange.
    pub r4: Scalar,
    /// `gRMul`: the unblinded aggregate of the nodes' nonce commitments.
    pub auth_commitment: EdwardsPoint,
    /// The challenge binding the fresh timestamp and session public key.
    pub challenge: Scalar,
    /// `gCMKAuth`: the master key raised to the identity-derived multiplier.
    pub cmk_auth: EdwardsPoint,
    /// The fresh session private scalar.
    pub session_key: Scalar,
}

impl Drop for PreSignData {
    fn drop(&mut self) {
        self.r4.zeroize();
        self.session_key.zeroize();
    }
}

/// Everything the conversion round yields for the rest of the sign-in.
pub struct ConvertOutput {
    /// The verifier-scoped user id, derived irreversibly from the
    /// unblinded identity point.
    pub vuid: String,
    /// Per-node one-time challenges, to echo back at authentication.
    pub challenges: Vec<String>,
    /// Per-node encrypted authentication requests.
    pub enc_auth_requests: Vec<String>,
    /// The node-clock-aligned timestamp bound into the challenge.
    pub timestamp: i64,
    /// The unsigned session credential.
    pub credential: String,
    pub session_public: EdwardsPoint,
    pub pre_sign: PreSignData,
}

/// What the pre-sign round yields for the final signing call.
pub struct PreSignOutput {
    /// The verified aggregate blind signature.
    pub blind_signature: Scalar,
    pub blind_h: EdwardsPoint,
    /// `gCVKR`: the summed session nonce commitments.
    pub session_commitment: EdwardsPoint,
    /// Summed model nonce commitments, when every node supplied one.
    pub model_commitment: Option<EdwardsPoint>,
    /// Per-session-node ECDH keys, aligned with the surviving set.
    pub ecdh_keys: Vec<AeadKey>,
}

/// Combine the blinded password contributions and derive one symmetric key
/// per surviving node.
///
/// The password point never leaves the client: each node only ever saw it
/// blinded, and the derived keys go through a one-way digest of a
/// Diffie-Hellman with each node's long-term public.
pub fn prism_convert_reply(
    blur_prisms: &[EdwardsPoint],
    timestamps: &[i64],
    coefficients: &[Scalar],
    ork_publics: &[EdwardsPoint],
    pass_blind: &Scalar,
    start_time: i64,
) -> Result<(Vec<AeadKey>, i64), ProtocolError> {
    let pass_prism = interpolate_points(blur_prisms, coefficients)? * invert(pass_blind)?;
    let hashed = scalar_from_hash256(&[&point_to_bytes(&pass_prism)]);
    let keys = ork_publics
        .iter()
        .map(|public| AeadKey::from_bytes(sha256(&[&point_to_bytes(&(public * hashed))])))
        .collect();
    let delta_time = median(timestamps)? - start_time;
    Ok((keys, delta_time))
}

/// Open the per-node challenge blobs from a password-only conversion.
pub fn decrypt_challenges(
    blobs: &[String],
    keys: &[AeadKey],
) -> Result<Vec<String>, ProtocolError> {
    blobs
        .iter()
        .zip(keys)
        .map(|(blob, key)| {
            let plain = aead::decrypt(blob, key).map_err(wrong_password)?;
            String::from_utf8(plain)
                .map_err(|_| ProtocolError::InvalidEncoding("challenge is not UTF-8".to_string()))
        })
        .collect()
}

/// Open the conversion payloads and derive the session material.
#[allow(clippy::too_many_arguments)]
pub fn cmk_convert_reply(
    uid: &str,
    enc_data: &[String],
    coefficients: &[Scalar],
    prism_auths: Vec<AeadKey>,
    cmk_public: &EdwardsPoint,
    user_blind: &Scalar,
    delta_time: i64,
    vendor_public: &str,
    now: i64,
) -> Result<ConvertOutput, ProtocolError> {
    if enc_data.len() != prism_auths.len() || enc_data.len() != coefficients.len() {
        return Err(ProtocolError::AssertionFailed(
            "conversion payloads out of step with the node list".to_string(),
        ));
    }

    let mut challenges = Vec::with_capacity(enc_data.len());
    let mut blur_users = Vec::with_capacity(enc_data.len());
    let mut commitments = Vec::with_capacity(enc_data.len());
    for (blob, key) in enc_data.iter().zip(&prism_auths) {
        let dec = decrypt_json(blob, key, EncryptedConvertResponse::from_json, wrong_password)?;
        challenges.push(dec.challenge);
        blur_users.push(dec.blur_user_cmk);
        commitments.push(dec.cmk_commitment);
    }

    // The unblinded identity point splits into a key multiplier and the
    // verifier-scoped user id; both are deterministic and irreversible.
    let user_cmk = interpolate_points(&blur_users, coefficients)? * invert(user_blind)?;
    let digest = sha512(&[&point_to_bytes(&user_cmk)]);
    let mut first = [0u8; 32];
    first.copy_from_slice(&digest[..32]);
    let cmk_mul = Scalar::from_bytes_mod_order(first);
    let vuid = hex::encode(&digest[32..]);

    let cmk_auth = cmk_public * cmk_mul;
    let session_key = Scalar::random(&mut OsRng);
    let session_public = base_mul(&session_key);
    let r4 = Scalar::random(&mut OsRng);
    let auth_commitment = sum_points(commitments.iter()) * invert(&r4)?;

    let timestamp = now + delta_time;
    let m = sha256(&[format!("{}{}", timestamp, point_to_base64(&session_public)).as_bytes()]);
    let challenge = scalar_from_hash512(&[
        &point_to_bytes(&auth_commitment),
        &point_to_bytes(&cmk_auth),
        &m,
    ]);

    let enc_auth_requests = coefficients
        .iter()
        .zip(&prism_auths)
        .map(|(li, key)| {
            let request = AuthRequest {
                user_id: uid.to_string(),
                blur_h_cmk_mul: challenge * cmk_mul * r4 * li,
            };
            aead::encrypt(encode_json(&request).as_bytes(), key)
        })
        .collect();

    let credential = jwt::issue(&vuid, CREDENTIAL_MINUTES, &session_public, vendor_public, now);

    Ok(ConvertOutput {
        vuid,
        challenges,
        enc_auth_requests,
        timestamp,
        credential,
        session_public,
        pre_sign: PreSignData {
            prism_auths,
            r4,
            auth_commitment,
            challenge,
            cmk_auth,
            session_key,
        },
    })
}

/// Unblind and verify the aggregate blind signature, then open the session
/// nodes' nonce commitments.
///
/// The check is the step that proves the password without revealing it:
/// after cofactor clearing,
/// `g·S == gRMul + gCMKAuth·H + gBlindH·hash("CMK authentication")`.
/// A mismatch is `WrongPassword`, never a value to continue with.
pub fn pre_sign_in_reply(
    enc_sigs: &[String],
    enc_commitments: &[String],
    pre: &PreSignData,
    cvk_publics: &[EdwardsPoint],
) -> Result<PreSignOutput, ProtocolError> {
    if enc_sigs.len() != pre.prism_auths.len() || enc_commitments.len() != cvk_publics.len() {
        return Err(ProtocolError::AssertionFailed(
            "authentication payloads out of step with the node lists".to_string(),
        ));
    }

    let mut partials = Vec::with_capacity(enc_sigs.len());
    let mut blind_hs = Vec::with_capacity(enc_sigs.len());
    for (blob, key) in enc_sigs.iter().zip(&pre.prism_auths) {
        let resp = decrypt_json(blob, key, AuthenticateResponse::from_json, wrong_password)?;
        partials.push(resp.partial_signature);
        blind_hs.push(resp.blind_h);
    }

    let r4_inv = invert(&pre.r4)?;
    let blind_signature: Scalar = partials.iter().sum::<Scalar>() * r4_inv;
    let blind_h = sum_points(blind_hs.iter()) * r4_inv;

    let domain = scalar_from_hash256(&[AUTH_DOMAIN]);
    let expected = pre.auth_commitment + pre.cmk_auth * pre.challenge + blind_h * domain;
    if !cofactor_eq(&base_mul(&blind_signature), &expected) {
        return Err(ProtocolError::WrongPassword);
    }

    let ecdh_keys: Vec<AeadKey> = cvk_publics
        .iter()
        .map(|public| AeadKey::from_bytes(sha256(&[&point_to_bytes(&(public * pre.session_key))])))
        .collect();

    let mut commitments = Vec::with_capacity(enc_commitments.len());
    let mut model_commitments = Vec::with_capacity(enc_commitments.len());
    for (blob, key) in enc_commitments.iter().zip(&ecdh_keys) {
        let resp = decrypt_json(blob, key, PreSignInResponse::from_json, |_| {
            ProtocolError::InvalidEncoding("session nonce payload would not open".to_string())
        })?;
        commitments.push(resp.commitment);
        model_commitments.push(resp.model_commitment);
    }

    let session_commitment = sum_points(commitments.iter());
    // The model commitment only exists when every node supplied one.
    let model_commitment = if model_commitments.iter().all(Option::is_some) {
        Some(sum_points(model_commitments.iter().filter_map(|p| p.as_ref())))
    } else {
        None
    };

    Ok(PreSignOutput {
        blind_signature,
        blind_h,
        session_commitment,
        model_commitment,
        ecdh_keys,
    })
}

/// Open the final shares and attach the threshold signature to the
/// credential (and, when requested, to the model).
pub fn sign_in_reply(
    enc_sigs: &[String],
    session_commitment: &EdwardsPoint,
    model_commitment: Option<&EdwardsPoint>,
    credential: &str,
    ecdh_keys: &[AeadKey],
    coefficients: &[Scalar],
) -> Result<(String, Option<String>), ProtocolError> {
    let mut credential_shares = Vec::with_capacity(enc_sigs.len());
    let mut model_shares = Vec::with_capacity(enc_sigs.len());
    for (blob, key) in enc_sigs.iter().zip(ecdh_keys) {
        let resp = decrypt_json(blob, key, SignInResponse::from_json, |_| {
            ProtocolError::InvalidEncoding("signature payload would not open".to_string())
        })?;
        credential_shares.push(resp.credential_share);
        model_shares.push(resp.model_share);
    }

    let aggregate = interpolate_scalars(&credential_shares, coefficients)?;
    let signed = jwt::append_signature(credential, session_commitment, &aggregate);

    let model_signature = match (model_commitment, model_shares.iter().all(Option::is_some)) {
        (Some(commitment), true) => {
            let shares: Vec<Scalar> = model_shares.into_iter().flatten().collect();
            let model_s = interpolate_scalars(&shares, coefficients)?;
            let mut sig = point_to_bytes(commitment).to_vec();
            sig.extend_from_slice(&model_s.to_bytes());
            Some(STANDARD.encode(sig))
        }
        _ => None,
    };

    Ok((signed, model_signature))
}

/// Drives the three authentication rounds against the master-key and
/// session node sets, shrinking each to its surviving quorum as it goes.
pub struct KeyAuthenticationFlow<'a, T> {
    cmk_orks: OrkList,
    cvk_orks: Option<OrkList>,
    threshold: usize,
    committed: bool,
    transport: &'a T,
}

impl<'a, T: Transport> KeyAuthenticationFlow<'a, T> {
    /// `committed` says whether the keys being exercised have been
    /// persisted; a sign-up's trial run passes false.
    pub fn new(cmk_orks: OrkList, threshold: usize, committed: bool, transport: &'a T) -> Self {
        Self {
            cmk_orks,
            cvk_orks: None,
            threshold,
            committed,
            transport,
        }
    }

    /// The master-key nodes still participating.
    pub fn cmk_orks(&self) -> &OrkList {
        &self.cmk_orks
    }

    /// Provide the session node set, once known.
    pub fn set_cvk_orks(&mut self, orks: OrkList) {
        self.cvk_orks = Some(orks);
    }

    /// Round one: blinded conversion against the master-key nodes.
    #[allow(clippy::too_many_arguments)]
    pub async fn convert(
        &mut self,
        uid: &str,
        blur_user: &EdwardsPoint,
        blur_pass: &EdwardsPoint,
        user_blind: &Scalar,
        pass_blind: &Scalar,
        start_time: i64,
        cmk_public: &EdwardsPoint,
        vendor_public: &str,
    ) -> Result<ConvertOutput, ProtocolError> {
        let committed = self.committed;
        let calls: Vec<_> = self
            .cmk_orks
            .iter()
            .map(|ork| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move { client.convert(uid, blur_user, blur_pass, committed).await }
            })
            .collect();
        let results = gather_threshold(calls, self.threshold).await?;

        // Only the nodes that answered exist from here on; coefficients and
        // key derivations are for exactly this set.
        self.cmk_orks = self.cmk_orks.subset(&QuorumResult::indices(&results));
        let responses = QuorumResult::values(results);
        let coefficients = self.cmk_orks.lagrange_coefficients()?;

        let blur_prisms: Vec<EdwardsPoint> =
            responses.iter().map(|r| r.blur_pass_prism).collect();
        let timestamps: Vec<i64> = responses.iter().map(|r| r.timestamp).collect();
        let (prism_auths, delta_time) = prism_convert_reply(
            &blur_prisms,
            &timestamps,
            &coefficients,
            &self.cmk_orks.publics(),
            pass_blind,
            start_time,
        )?;

        let enc_data: Vec<String> = responses.into_iter().map(|r| r.encrypted_data).collect();
        cmk_convert_reply(
            uid,
            &enc_data,
            &coefficients,
            prism_auths,
            cmk_public,
            user_blind,
            delta_time,
            vendor_public,
            unix_now(),
        )
    }

    /// The password-only conversion used while changing a password: proves
    /// the old password and recovers each node's one-time challenge.
    pub async fn prism_convert(
        &mut self,
        uid: &str,
        blur_pass: &EdwardsPoint,
        pass_blind: &Scalar,
    ) -> Result<Vec<String>, ProtocolError> {
        let committed = self.committed;
        let calls: Vec<_> = self
            .cmk_orks
            .iter()
            .map(|ork| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move { client.prism_convert(uid, blur_pass, committed).await }
            })
            .collect();
        let results = gather_threshold(calls, self.threshold).await?;
        self.cmk_orks = self.cmk_orks.subset(&QuorumResult::indices(&results));
        let responses = QuorumResult::values(results);
        let coefficients = self.cmk_orks.lagrange_coefficients()?;

        let blur_prisms: Vec<EdwardsPoint> =
            responses.iter().map(|r| r.blur_pass_prism).collect();
        let timestamps: Vec<i64> = responses.iter().map(|r| r.timestamp).collect();
        let (keys, _) = prism_convert_reply(
            &blur_prisms,
            &timestamps,
            &coefficients,
            &self.cmk_orks.publics(),
            pass_blind,
            0,
        )?;

        let blobs: Vec<String> = responses
            .into_iter()
            .map(|r| r.encrypted_challenge)
            .collect();
        decrypt_challenges(&blobs, &keys)
    }

    /// Round two: blind-signature authentication to the master-key nodes,
    /// in parallel with the session nodes' pre-sign exchange.
    pub async fn authenticate_and_pre_sign(
        &mut self,
        uid: &str,
        vuid: &str,
        convert: &ConvertOutput,
        model_requested: bool,
    ) -> Result<(PreSignOutput, Vec<Scalar>), ProtocolError> {
        let cvk_orks = self.cvk_orks.clone().ok_or_else(|| {
            ProtocolError::AssertionFailed("session node set was never provided".to_string())
        })?;
        let committed = self.committed;

        let auth_calls: Vec<_> = self
            .cmk_orks
            .iter()
            .zip(convert.challenges.iter().zip(&convert.enc_auth_requests))
            .map(|(ork, (challenge, request))| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move {
                    client
                        .authenticate(uid, challenge, request, committed)
                        .await
                }
            })
            .collect();
        let session_public = convert.session_public;
        let pre_calls: Vec<_> = cvk_orks
            .iter()
            .map(|ork| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move {
                    client
                        .pre_sign_in_cvk(vuid, &session_public, model_requested, committed)
                        .await
                }
            })
            .collect();

        let (auth_results, pre_results) = futures::join!(
            gather_all(auth_calls),
            gather_threshold(pre_calls, self.threshold)
        );
        let enc_sigs = QuorumResult::values(auth_results?);
        let pre_results = pre_results?;

        let surviving = cvk_orks.subset(&QuorumResult::indices(&pre_results));
        let coefficients = surviving.lagrange_coefficients()?;
        let enc_commitments = QuorumResult::values(pre_results);

        let output = pre_sign_in_reply(
            &enc_sigs,
            &enc_commitments,
            &convert.pre_sign,
            &surviving.publics(),
        )?;
        self.cvk_orks = Some(surviving);
        Ok((output, coefficients))
    }

    /// Round three: collect the final signature shares from the surviving
    /// session nodes.
    pub async fn sign_in(
        &self,
        vuid: &str,
        convert: &ConvertOutput,
        pre: &PreSignOutput,
        coefficients: &[Scalar],
        mode: &str,
        model_to_sign: Option<&str>,
    ) -> Result<(String, Option<String>), ProtocolError> {
        let cvk_orks = self.cvk_orks.as_ref().ok_or_else(|| {
            ProtocolError::AssertionFailed("session node set was never provided".to_string())
        })?;
        if mode != "default" && (model_to_sign.is_none() || pre.model_commitment.is_none()) {
            return Err(ProtocolError::AssertionFailed(
                "this mode requires a model to sign".to_string(),
            ));
        }

        let calls: Vec<_> = cvk_orks
            .iter()
            .zip(coefficients)
            .map(|(ork, coefficient)| {
                let client = NodeClient::new(self.transport, &ork.url);
                async move {
                    let args = SignInCvkArgs {
                        credential: &convert.credential,
                        timestamp: convert.timestamp,
                        auth_commitment: &convert.pre_sign.auth_commitment,
                        blind_signature: &pre.blind_signature,
                        session_commitment: &pre.session_commitment,
                        coefficient,
                        blind_h: &pre.blind_h,
                        mode,
                        model_to_sign,
                        model_commitment: pre.model_commitment.as_ref(),
                        committed: self.committed,
                    };
                    client.sign_in_cvk(vuid, &args).await
                }
            })
            .collect();
        let enc_sigs = QuorumResult::values(gather_all(calls).await?);

        sign_in_reply(
            &enc_sigs,
            &pre.session_commitment,
            pre.model_commitment.as_ref(),
            &convert.credential,
            &pre.ecdh_keys,
            coefficients,
        )
    }
}
