//! End-to-end ceremonies against an in-process simulated node fleet.
//!
//! The fleet implements the node side of every protocol round with real
//! share arithmetic, so the client's aggregation, verification and quorum
//! logic is exercised against honestly-computed partials — and against
//! nodes that are down, rate limited, or refusing to commit.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand_core::{OsRng, RngCore};

use crate::aead::{self, AeadKey};
use crate::curve::{
    base_mul, cofactor_eq, point_from_base64, point_from_bytes, point_to_base64, point_to_bytes,
    scalar_from_base64, scalar_from_hash256, scalar_from_hash512, sha256,
};
use crate::error::{ProtocolError, QuorumFailure};
use crate::jwt;
use crate::math::{lagrange_coefficient, median, sum_points};
use crate::messages::{
    encode_json, AuthRequest, AuthenticateResponse, ConvertResponse, EncryptedConvertResponse,
    GenShardResponse, PreSignInResponse, PrismConvertResponse, SendShardResponse, SignInResponse,
};
use crate::orks::OrkInfo;
use crate::change_password::{ChangePassword, ChangePasswordConfig};
use crate::signin::{SignIn, SignInConfig};
use crate::signup::{run_decryption_test, SignUp, SignUpConfig};
use crate::transport::{Directory, Transport, TransportError, Vendor};

/// Quorum threshold used throughout; the fleet shares secrets at the same
/// degree, so any three of five nodes reconstruct.
const THRESHOLD: usize = 3;
const BASE_TIME: i64 = 1_700_000_000;
const VENDOR_PUBLIC: &str = "dGhlIHZlbmRvciBwdWJsaWM";

fn eval(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, c| acc * x + c)
}

struct SimOrk {
    id: u64,
    url: String,
    secret: Scalar,
    down: bool,
    rate_limited: bool,
}

impl SimOrk {
    fn public(&self) -> EdwardsPoint {
        base_mul(&self.secret)
    }
}

/// One node's contribution to a running ceremony.
struct Contribution {
    /// One polynomial per generated secret, constant term first.
    polys: Vec<Vec<Scalar>>,
    nonce: Scalar,
    timestamp: i64,
}

struct Ceremony {
    ids: Vec<u64>,
    contributions: HashMap<u64, Contribution>,
    final_shares: HashMap<u64, Vec<Scalar>>,
    partials: HashMap<u64, Scalar>,
    auth_point: Option<EdwardsPoint>,
    key_type: String,
    committed: usize,
}

/// A committed (or provisionally assembled) key record.
#[derive(Clone)]
struct Account {
    /// Per node: one share per secret in the family.
    shares: HashMap<u64, Vec<Scalar>>,
    public: EdwardsPoint,
    partial_publics: Vec<EdwardsPoint>,
    auth_point: EdwardsPoint,
}

struct ConvertSession {
    rho: Scalar,
    challenge: String,
}

struct PresignSession {
    session_public: EdwardsPoint,
    nonce: Scalar,
    model_nonce: Option<Scalar>,
}

struct FleetInner {
    orks: Vec<SimOrk>,
    ceremonies: HashMap<String, Ceremony>,
    accounts: HashMap<String, Account>,
    converts: HashMap<(String, u64), ConvertSession>,
    presigns: HashMap<(String, u64), PresignSession>,
    reject_commits: bool,
}

pub struct Fleet(Mutex<FleetInner>);

fn field<'a>(fields: &'a [(String, String)], name: &str) -> Result<&'a str, TransportError> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| TransportError::Node(format!("missing field {}", name)))
}

fn node_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Node(e.to_string())
}

impl FleetInner {
    fn ork_index(&self, endpoint: &str) -> Result<usize, TransportError> {
        self.orks
            .iter()
            .position(|o| endpoint.starts_with(&o.url))
            .ok_or_else(|| TransportError::Unreachable(format!("no node at {}", endpoint)))
    }

    fn public_of(&self, id: u64) -> Result<EdwardsPoint, TransportError> {
        self.orks
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.public())
            .ok_or_else(|| TransportError::Node(format!("unknown participant {}", id)))
    }

    /// The AEAD key node `a` shares with node `b` for share transport.
    fn pair_key(&self, secret: &Scalar, other: u64) -> Result<AeadKey, TransportError> {
        let public = self.public_of(other)?;
        Ok(AeadKey::from_bytes(sha256(&[&point_to_bytes(
            &(public * secret),
        )])))
    }

    /// A key record as the given node sees it: committed, or assembled
    /// provisionally from a ceremony in progress.
    fn account_view(&self, uid: &str, committed: bool) -> Result<Account, TransportError> {
        if committed {
            return self
                .accounts
                .get(uid)
                .cloned()
                .ok_or_else(|| TransportError::Node(format!("no committed key for {}", uid)));
        }
        let ceremony = self
            .ceremonies
            .get(uid)
            .ok_or_else(|| TransportError::Node(format!("no ceremony for {}", uid)))?;
        Ok(assemble(ceremony))
    }

    fn dispatch(
        &mut self,
        endpoint: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let index = self.ork_index(endpoint)?;
        if self.orks[index].down {
            return Err(TransportError::Unreachable("node is down".to_string()));
        }
        if self.orks[index].rate_limited {
            return Err(TransportError::RateLimited);
        }

        let rest = &endpoint[self.orks[index].url.len()..];
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let uid = query.strip_prefix("uid=").unwrap_or("").to_string();

        match path {
            "/Create/GenShard" => self.gen_shard(index, &uid, fields, None),
            "/Create/UpdateShard" => {
                let challenge = field(fields, "decryptedChallengei")?.to_string();
                self.gen_shard(index, &uid, fields, Some(challenge))
            }
            "/Create/SendShard" => self.send_shard(index, &uid, fields),
            "/Create/Commit" => self.commit(index, &uid, fields),
            "/CMK/Convert" => self.convert(index, &uid, fields),
            "/Prism/Convert" => self.prism_convert(index, &uid, fields),
            "/CMK/Authenticate" => self.authenticate(index, &uid, fields),
            "/CVK/PreSignIn" => self.pre_sign_in(index, &uid, fields),
            "/CVK/SignIn" => self.sign_in(index, &uid, fields),
            _ => Err(TransportError::Node(format!("unknown path {}", path))),
        }
    }

    fn gen_shard(
        &mut self,
        index: usize,
        uid: &str,
        fields: &[(String, String)],
        update_challenge: Option<String>,
    ) -> Result<String, TransportError> {
        let ids: Vec<u64> = serde_json::from_str::<Vec<String>>(field(fields, "mIdORKij")?)
            .map_err(node_err)?
            .iter()
            .map(|s| s.parse().map_err(node_err))
            .collect::<Result<_, _>>()?;
        let multipliers: Vec<Option<EdwardsPoint>> =
            serde_json::from_str::<Vec<Option<String>>>(field(fields, "gMultipliers")?)
                .map_err(node_err)?
                .into_iter()
                .map(|p| p.map(|p| point_from_base64(&p).map_err(node_err)).transpose())
                .collect::<Result<_, _>>()?;
        let num_keys: usize = match update_challenge {
            Some(ref challenge) => {
                let ork_id = self.orks[index].id;
                let session = self
                    .converts
                    .get(&(uid.to_string(), ork_id))
                    .ok_or_else(|| TransportError::Node("no conversion session".to_string()))?;
                if &session.challenge != challenge {
                    return Err(TransportError::Node("challenge mismatch".to_string()));
                }
                1
            }
            None => field(fields, "numKeys")?.parse().map_err(node_err)?,
        };

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        let timestamp = BASE_TIME + ork_id as i64;

        let polys: Vec<Vec<Scalar>> = (0..num_keys)
            .map(|_| (0..THRESHOLD).map(|_| Scalar::random(&mut OsRng)).collect())
            .collect();
        let nonce = Scalar::random(&mut OsRng);

        let mut yij_ciphers = Vec::with_capacity(ids.len());
        for dest in &ids {
            let values: Vec<String> = polys
                .iter()
                .map(|p| crate::curve::scalar_to_base64(&eval(p, &Scalar::from(*dest))))
                .collect();
            let key = self.pair_key(&secret, *dest)?;
            yij_ciphers.push(aead::encrypt(encode_json(&values).as_bytes(), &key));
        }

        let response = GenShardResponse {
            yij_ciphers,
            commitment: base_mul(&nonce),
            timestamp,
            multiplied: multipliers
                .iter()
                .enumerate()
                .map(|(t, m)| m.map(|p| p * polys[t][0]))
                .collect(),
            partial_public: base_mul(&polys[0][0]),
        };

        let ceremony = self
            .ceremonies
            .entry(uid.to_string())
            .or_insert_with(|| Ceremony {
                ids: ids.clone(),
                contributions: HashMap::new(),
                final_shares: HashMap::new(),
                partials: HashMap::new(),
                auth_point: None,
                key_type: String::new(),
                committed: 0,
            });
        if ceremony.ids != ids {
            return Err(TransportError::Node(
                "participants disagree on the ceremony".to_string(),
            ));
        }
        ceremony.contributions.insert(
            ork_id,
            Contribution {
                polys,
                nonce,
                timestamp,
            },
        );

        Ok(encode_json(&response))
    }

    fn send_shard(
        &mut self,
        index: usize,
        uid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let shares: Vec<String> =
            serde_json::from_str(field(fields, "yijCipher")?).map_err(node_err)?;
        let r2 = point_from_base64(field(fields, "R2")?).map_err(node_err)?;
        let auth = point_from_base64(field(fields, "auth")?).map_err(node_err)?;
        let key_type = field(fields, "keyType")?.to_string();

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;

        let ceremony = self
            .ceremonies
            .get(uid)
            .ok_or_else(|| TransportError::Node("no ceremony".to_string()))?;
        if ceremony.contributions.len() != ceremony.ids.len() {
            return Err(TransportError::Node("ceremony is incomplete".to_string()));
        }

        // Open this node's column of the share matrix and sum per secret.
        let mut my_shares: Vec<Scalar> = Vec::new();
        for (sender, cipher) in ceremony.ids.iter().zip(&shares) {
            let key = self.pair_key(&secret, *sender)?;
            let plain = aead::decrypt(cipher, &key)
                .map_err(|_| TransportError::Node("share would not open".to_string()))?;
            let values: Vec<String> =
                serde_json::from_str(&String::from_utf8(plain).map_err(node_err)?)
                    .map_err(node_err)?;
            let values: Vec<Scalar> = values
                .iter()
                .map(|v| scalar_from_base64(v).map_err(node_err))
                .collect::<Result<_, _>>()?;
            if my_shares.is_empty() {
                my_shares = values;
            } else {
                for (acc, v) in my_shares.iter_mut().zip(values) {
                    *acc += v;
                }
            }
        }

        let ceremony = self.ceremonies.get(uid).expect("ceremony checked above");
        let publics: Vec<EdwardsPoint> = ceremony
            .ids
            .iter()
            .map(|id| self.public_of(*id))
            .collect::<Result<_, _>>()?;
        let key_public = sum_points(
            ceremony
                .ids
                .iter()
                .map(|id| base_mul(&ceremony.contributions[id].polys[0][0]))
                .collect::<Vec<_>>()
                .iter(),
        );
        let timestamp = median(
            &ceremony
                .ids
                .iter()
                .map(|id| ceremony.contributions[id].timestamp)
                .collect::<Vec<_>>(),
        )
        .map_err(node_err)?;

        let m = sha256(&[
            &point_to_bytes(&key_public),
            timestamp.to_string().as_bytes(),
            uid.as_bytes(),
        ]);
        let big_r = sum_points(publics.iter()) + r2;
        let h = scalar_from_hash512(&[&point_to_bytes(&big_r), &point_to_bytes(&key_public), &m]);

        let xs: Vec<Scalar> = ceremony.ids.iter().map(|id| Scalar::from(*id)).collect();
        let li = lagrange_coefficient(&Scalar::from(ork_id), &xs).map_err(node_err)?;
        let nonce = ceremony.contributions[&ork_id].nonce;
        let partial = secret + nonce + h * li * my_shares[0];

        let ceremony = self.ceremonies.get_mut(uid).expect("ceremony checked above");
        ceremony.final_shares.insert(ork_id, my_shares);
        ceremony.partials.insert(ork_id, partial);
        ceremony.auth_point = Some(auth);
        ceremony.key_type = key_type;

        Ok(encode_json(&SendShardResponse {
            partial_signature: partial,
        }))
    }

    fn commit(
        &mut self,
        _index: usize,
        uid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        if self.reject_commits {
            return Ok("Commit refused".to_string());
        }
        let s = scalar_from_base64(field(fields, "S")?).map_err(node_err)?;
        let prism_auth = fields
            .iter()
            .find(|(k, _)| k == "gPRISMAuth")
            .map(|(_, v)| point_from_base64(v))
            .transpose()
            .map_err(node_err)?;

        let (first_commit, key_type, mut account) = {
            let ceremony = self
                .ceremonies
                .get(uid)
                .ok_or_else(|| TransportError::Node("no ceremony".to_string()))?;
            let expected: Scalar = ceremony.partials.values().sum();
            if ceremony.partials.len() != ceremony.ids.len() || s != expected {
                return Err(TransportError::Node(
                    "aggregate signature mismatch".to_string(),
                ));
            }
            (
                ceremony.committed == 0,
                ceremony.key_type.clone(),
                assemble(ceremony),
            )
        };

        if first_commit {
            if let Some(auth) = prism_auth {
                account.auth_point = auth;
            }
            match key_type.as_str() {
                // A password change replaces the second secret of the
                // existing master record and its at-rest protection.
                "Prism" => {
                    let existing = self
                        .accounts
                        .get_mut(uid)
                        .ok_or_else(|| TransportError::Node("no master key".to_string()))?;
                    for (id, shares) in &account.shares {
                        if let Some(slot) = existing.shares.get_mut(id) {
                            slot[1] = shares[0];
                        }
                    }
                    existing.auth_point = account.auth_point;
                }
                _ => {
                    self.accounts.insert(uid.to_string(), account);
                }
            }
        }

        let done = {
            let ceremony = self.ceremonies.get_mut(uid).expect("ceremony exists");
            ceremony.committed += 1;
            ceremony.committed == ceremony.ids.len()
        };
        if done {
            self.ceremonies.remove(uid);
        }
        Ok("Account Created".to_string())
    }

    fn convert(
        &mut self,
        index: usize,
        uid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let blur_user = point_from_base64(field(fields, "gBlurUser")?).map_err(node_err)?;
        let blur_pass = point_from_base64(field(fields, "gBlurPass")?).map_err(node_err)?;
        let committed = field(fields, "cmkCommitted")? == "true";

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        let account = self.account_view(uid, committed)?;
        let shares = account
            .shares
            .get(&ork_id)
            .ok_or_else(|| TransportError::Node("no share at this node".to_string()))?;
        let (cmk_share, prism_share) = (shares[0], shares[1]);

        let prism_key = AeadKey::from_bytes(sha256(&[&point_to_bytes(
            &(account.auth_point * secret),
        )]));
        let rho = Scalar::random(&mut OsRng);
        let mut challenge_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut challenge_bytes);
        let challenge = hex::encode(challenge_bytes);
        self.converts.insert(
            (uid.to_string(), ork_id),
            ConvertSession {
                rho,
                challenge: challenge.clone(),
            },
        );

        let payload = EncryptedConvertResponse {
            challenge,
            blur_user_cmk: blur_user * cmk_share,
            cmk_commitment: base_mul(&rho),
        };
        let response = ConvertResponse {
            encrypted_data: aead::encrypt(encode_json(&payload).as_bytes(), &prism_key),
            blur_pass_prism: blur_pass * prism_share,
            timestamp: BASE_TIME + ork_id as i64,
        };
        Ok(encode_json(&response))
    }

    fn prism_convert(
        &mut self,
        index: usize,
        uid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let blur_pass = point_from_base64(field(fields, "gBlurPass")?).map_err(node_err)?;
        let committed = field(fields, "prismCommitted")? == "true";

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        let account = self.account_view(uid, committed)?;
        let prism_share = account
            .shares
            .get(&ork_id)
            .ok_or_else(|| TransportError::Node("no share at this node".to_string()))?[1];

        let prism_key = AeadKey::from_bytes(sha256(&[&point_to_bytes(
            &(account.auth_point * secret),
        )]));
        let mut challenge_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut challenge_bytes);
        let challenge = hex::encode(challenge_bytes);
        self.converts.insert(
            (uid.to_string(), ork_id),
            ConvertSession {
                rho: Scalar::ZERO,
                challenge: challenge.clone(),
            },
        );

        let response = PrismConvertResponse {
            encrypted_challenge: aead::encrypt(challenge.as_bytes(), &prism_key),
            blur_pass_prism: blur_pass * prism_share,
            timestamp: BASE_TIME + ork_id as i64,
        };
        Ok(encode_json(&response))
    }

    fn authenticate(
        &mut self,
        index: usize,
        uid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let challenge = field(fields, "decryptedChallenge")?;
        let enc_request = field(fields, "encAuthRequest")?;
        let committed = field(fields, "cmkCommitted")? == "true";

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        let session = self
            .converts
            .get(&(uid.to_string(), ork_id))
            .ok_or_else(|| TransportError::Node("no conversion session".to_string()))?;
        if session.challenge != challenge {
            return Err(TransportError::Node("challenge mismatch".to_string()));
        }
        let rho = session.rho;

        let account = self.account_view(uid, committed)?;
        let cmk_share = account
            .shares
            .get(&ork_id)
            .ok_or_else(|| TransportError::Node("no share at this node".to_string()))?[0];
        let prism_key = AeadKey::from_bytes(sha256(&[&point_to_bytes(
            &(account.auth_point * secret),
        )]));

        let plain = aead::decrypt(enc_request, &prism_key)
            .map_err(|_| TransportError::Node("auth request would not open".to_string()))?;
        let request =
            AuthRequest::from_json(&String::from_utf8(plain).map_err(node_err)?).map_err(node_err)?;
        if request.user_id != uid {
            return Err(TransportError::Node("auth request for someone else".to_string()));
        }

        let domain = scalar_from_hash256(&[b"CMK authentication"]);
        let blind = Scalar::random(&mut OsRng);
        let response = AuthenticateResponse {
            partial_signature: rho + request.blur_h_cmk_mul * cmk_share + domain * blind,
            blind_h: base_mul(&blind),
        };
        Ok(aead::encrypt(encode_json(&response).as_bytes(), &prism_key))
    }

    fn pre_sign_in(
        &mut self,
        index: usize,
        vuid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let session_public =
            point_from_base64(field(fields, "gSessKeyPub")?).map_err(node_err)?;
        let model_requested = field(fields, "modelToSignRequested")? == "true";
        let committed = field(fields, "cvkCommitted")? == "true";

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        // The record must exist; its share is only used at the final round.
        self.account_view(vuid, committed)?;

        let ecdh = AeadKey::from_bytes(sha256(&[&point_to_bytes(&(session_public * secret))]));
        let nonce = Scalar::random(&mut OsRng);
        let model_nonce = model_requested.then(|| Scalar::random(&mut OsRng));
        let response = PreSignInResponse {
            commitment: base_mul(&nonce),
            model_commitment: model_nonce.as_ref().map(base_mul),
        };
        self.presigns.insert(
            (vuid.to_string(), ork_id),
            PresignSession {
                session_public,
                nonce,
                model_nonce,
            },
        );
        Ok(aead::encrypt(encode_json(&response).as_bytes(), &ecdh))
    }

    fn sign_in(
        &mut self,
        index: usize,
        vuid: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        let credential = field(fields, "jwt")?;
        let timestamp: i64 = field(fields, "timestamp2")?.parse().map_err(node_err)?;
        let auth_commitment = point_from_base64(field(fields, "gRMul")?).map_err(node_err)?;
        let blind_signature = scalar_from_base64(field(fields, "s")?).map_err(node_err)?;
        let session_commitment = point_from_base64(field(fields, "gCVKR")?).map_err(node_err)?;
        let li = scalar_from_base64(field(fields, "li")?).map_err(node_err)?;
        let blind_h = point_from_base64(field(fields, "gBlindH")?).map_err(node_err)?;
        let committed = field(fields, "cvkCommitted")? == "true";
        let model = fields.iter().find(|(k, _)| k == "modelToSign").map(|(_, v)| v.clone());
        let model_commitment = fields
            .iter()
            .find(|(k, _)| k == "gR2")
            .map(|(_, v)| point_from_base64(v))
            .transpose()
            .map_err(node_err)?;

        let ork_id = self.orks[index].id;
        let secret = self.orks[index].secret;
        let account = self.account_view(vuid, committed)?;
        let cvk_share = account
            .shares
            .get(&ork_id)
            .ok_or_else(|| TransportError::Node("no share at this node".to_string()))?[0];
        let session = self
            .presigns
            .get(&(vuid.to_string(), ork_id))
            .ok_or_else(|| TransportError::Node("no pre-sign session".to_string()))?;

        // The node independently checks the password proof before signing.
        let m = sha256(&[format!(
            "{}{}",
            timestamp,
            point_to_base64(&session.session_public)
        )
        .as_bytes()]);
        let h = scalar_from_hash512(&[
            &point_to_bytes(&auth_commitment),
            &point_to_bytes(&account.auth_point),
            &m,
        ]);
        let domain = scalar_from_hash256(&[b"CMK authentication"]);
        let expected = auth_commitment + account.auth_point * h + blind_h * domain;
        if !cofactor_eq(&base_mul(&blind_signature), &expected) {
            return Err(TransportError::Node("authentication proof rejected".to_string()));
        }

        let li_inv = li.invert();
        let k = scalar_from_hash512(&[
            &point_to_bytes(&session_commitment),
            &point_to_bytes(&account.public),
            credential.as_bytes(),
        ]);
        let credential_share = session.nonce * li_inv + k * cvk_share;

        let model_share = match (&model, &model_commitment, &session.model_nonce) {
            (Some(model), Some(commitment), Some(nonce)) => {
                let k2 = scalar_from_hash512(&[
                    &point_to_bytes(commitment),
                    &point_to_bytes(&account.public),
                    model.as_bytes(),
                ]);
                Some(nonce * li_inv + k2 * cvk_share)
            }
            _ => None,
        };

        let ecdh = AeadKey::from_bytes(sha256(&[&point_to_bytes(
            &(session.session_public * secret),
        )]));
        let response = SignInResponse {
            credential_share,
            model_share,
        };
        Ok(aead::encrypt(encode_json(&response).as_bytes(), &ecdh))
    }
}

/// Assemble the provisional key record a completed SendShard round implies.
fn assemble(ceremony: &Ceremony) -> Account {
    let partial_publics: Vec<EdwardsPoint> = ceremony
        .ids
        .iter()
        .map(|id| base_mul(&ceremony.contributions[id].polys[0][0]))
        .collect();
    Account {
        shares: ceremony.final_shares.clone(),
        public: sum_points(partial_publics.iter()),
        partial_publics,
        auth_point: ceremony.auth_point.unwrap_or_else(EdwardsPoint::identity),
    }
}

impl Fleet {
    fn new(size: usize) -> Self {
        let orks = (0..size)
            .map(|i| SimOrk {
                id: i as u64 + 1,
                url: format!("http://ork{}.test", i),
                secret: Scalar::random(&mut OsRng),
                down: false,
                rate_limited: false,
            })
            .collect();
        Fleet(Mutex::new(FleetInner {
            orks,
            ceremonies: HashMap::new(),
            accounts: HashMap::new(),
            converts: HashMap::new(),
            presigns: HashMap::new(),
            reject_commits: false,
        }))
    }

    fn ork_infos(&self) -> Vec<OrkInfo> {
        let inner = self.0.lock().unwrap();
        inner
            .orks
            .iter()
            .map(|o| OrkInfo::new(o.id, o.url.clone(), o.public()))
            .collect()
    }

    fn set_down(&self, index: usize, down: bool) {
        self.0.lock().unwrap().orks[index].down = down;
    }

    fn set_rate_limited(&self, index: usize, limited: bool) {
        self.0.lock().unwrap().orks[index].rate_limited = limited;
    }

    fn set_reject_commits(&self, reject: bool) {
        self.0.lock().unwrap().reject_commits = reject;
    }

    fn account_public(&self, uid: &str) -> Option<EdwardsPoint> {
        self.0.lock().unwrap().accounts.get(uid).map(|a| a.public)
    }

    fn account_partials(&self, uid: &str) -> Option<Vec<EdwardsPoint>> {
        self.0
            .lock()
            .unwrap()
            .accounts
            .get(uid)
            .map(|a| a.partial_publics.clone())
    }
}

#[async_trait]
impl Transport for Fleet {
    async fn call(
        &self,
        endpoint: &str,
        fields: &[(String, String)],
    ) -> Result<String, TransportError> {
        self.0.lock().unwrap().dispatch(endpoint, fields)
    }
}

#[async_trait]
impl Directory for Fleet {
    async fn list_all_orks(&self) -> Result<Vec<OrkInfo>, TransportError> {
        Ok(self.ork_infos())
    }

    async fn list_active_orks(&self) -> Result<Vec<OrkInfo>, TransportError> {
        let inner = self.0.lock().unwrap();
        Ok(inner
            .orks
            .iter()
            .filter(|o| !o.down)
            .map(|o| OrkInfo::new(o.id, o.url.clone(), o.public()))
            .collect())
    }

    async fn get_user_orks(&self, _uid: &str) -> Result<Vec<OrkInfo>, TransportError> {
        Ok(self.ork_infos())
    }

    async fn get_key_public(&self, uid: &str) -> Result<EdwardsPoint, TransportError> {
        self.account_public(uid)
            .ok_or_else(|| TransportError::Node(format!("no key for {}", uid)))
    }
}

fn sign_up(fleet: &Fleet) -> Result<String, ProtocolError> {
    let flow = SignUp::new(SignUpConfig {
        cmk_orks: fleet.ork_infos(),
        cvk_orks: fleet.ork_infos(),
        threshold: THRESHOLD,
    })
    .unwrap();
    smol::block_on(flow.run(fleet, "Alice", "correct horse", VENDOR_PUBLIC))
}

fn sign_in_config() -> SignInConfig {
    SignInConfig {
        threshold: THRESHOLD,
        ..SignInConfig::default()
    }
}

#[test]
fn test_sign_up_provisions_verifiable_keys() {
    let fleet = Fleet::new(5);
    let credential = sign_up(&fleet).unwrap();

    let vuid = jwt::claims(&credential).unwrap().uid;
    let cvk_public = fleet.account_public(&vuid).unwrap();
    assert!(jwt::verify(&credential, &cvk_public));
    assert!(jwt::verify(&credential, &cvk_public));

    // The aggregate public key is exactly the sum of the five partials.
    let partials = fleet.account_partials(&vuid).unwrap();
    assert_eq!(partials.len(), 5);
    assert_eq!(sum_points(partials.iter()), cvk_public);

    // The master record exists under the username-derived id.
    let uid = hex::encode(sha256(&[b"alice"]));
    assert!(fleet.account_public(&uid).is_some());
}

#[test]
fn test_sign_in_suspends_then_signs_a_model() {
    let fleet = Fleet::new(5);
    sign_up(&fleet).unwrap();

    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    let started =
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)).unwrap();
    assert_eq!(
        Some(started.key_public),
        fleet.account_public(&started.vuid)
    );

    // The caller resumes with the data it wants co-signed.
    let done = smol::block_on(flow.continue_with(Some("model to sign"))).unwrap();
    assert!(jwt::verify(&done.credential, &started.key_public));
    assert_eq!(jwt::claims(&done.credential).unwrap().uid, started.vuid);

    let model_sig = done.model_signature.expect("a model signature");
    assert!(jwt::verify_detached_base64(
        &model_sig,
        &started.key_public,
        b"model to sign"
    ));
    assert!(!jwt::verify_detached_base64(
        &model_sig,
        &started.key_public,
        b"some other model"
    ));

    // Each start backs exactly one continuation.
    assert!(matches!(
        smol::block_on(flow.continue_with(None)),
        Err(ProtocolError::NoSavedState)
    ));
}

#[test]
fn test_sign_in_without_model_yields_no_model_signature() {
    let fleet = Fleet::new(5);
    sign_up(&fleet).unwrap();

    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    let started =
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)).unwrap();
    let done = smol::block_on(flow.continue_with(None)).unwrap();
    assert!(jwt::verify(&done.credential, &started.key_public));
    assert!(done.model_signature.is_none());
}

#[test]
fn test_quorum_degradation() {
    let fleet = Fleet::new(5);
    sign_up(&fleet).unwrap();

    // Two nodes down: three survivors meet the threshold, and every later
    // round runs against exactly those survivors' indices.
    fleet.set_down(1, true);
    fleet.set_down(3, true);
    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    let started =
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)).unwrap();
    let done = smol::block_on(flow.continue_with(None)).unwrap();
    assert!(jwt::verify(&done.credential, &started.key_public));

    // A third failure drops below the threshold.
    fleet.set_down(0, true);
    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    assert!(matches!(
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)),
        Err(ProtocolError::QuorumNotMet(QuorumFailure::NodesUnreachable))
    ));

    // A rate-limited node among the failures changes the reported reason.
    fleet.set_down(0, false);
    fleet.set_rate_limited(0, true);
    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    assert!(matches!(
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)),
        Err(ProtocolError::QuorumNotMet(QuorumFailure::RateLimited))
    ));
}

#[test]
fn test_wrong_password_is_distinguished() {
    let fleet = Fleet::new(5);
    sign_up(&fleet).unwrap();

    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    assert!(matches!(
        smol::block_on(flow.start("Alice", "incorrect donkey", VENDOR_PUBLIC)),
        Err(ProtocolError::WrongPassword)
    ));
    // No saved state was left behind by the failed start.
    assert!(matches!(
        smol::block_on(flow.continue_with(None)),
        Err(ProtocolError::NoSavedState)
    ));
}

#[test]
fn test_change_password() {
    let fleet = Fleet::new(5);
    sign_up(&fleet).unwrap();

    let mut change =
        ChangePassword::new(ChangePasswordConfig { threshold: THRESHOLD }, &fleet, &fleet)
            .unwrap();
    assert!(matches!(
        smol::block_on(change.finish()),
        Err(ProtocolError::NoSavedState)
    ));
    smol::block_on(change.start("Alice", "correct horse", "battery staple")).unwrap();
    smol::block_on(change.finish()).unwrap();

    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    let started =
        smol::block_on(flow.start("Alice", "battery staple", VENDOR_PUBLIC)).unwrap();
    let done = smol::block_on(flow.continue_with(None)).unwrap();
    assert!(jwt::verify(&done.credential, &started.key_public));

    let mut flow = SignIn::new(sign_in_config(), &fleet, &fleet).unwrap();
    assert!(matches!(
        smol::block_on(flow.start("Alice", "correct horse", VENDOR_PUBLIC)),
        Err(ProtocolError::WrongPassword)
    ));
}

/// A relying party that actually decrypts both ciphertexts and compares.
struct TestVendor {
    user_secret: Scalar,
    vendor_secret: Scalar,
}

fn open_elgamal(frame: &str, secret: &Scalar) -> Result<Vec<u8>, TransportError> {
    let frame = STANDARD.decode(frame).map_err(node_err)?;
    if frame.len() != 66 || frame[32] != 0 {
        return Err(TransportError::Node("unexpected frame".to_string()));
    }
    let c1 = point_from_bytes(&frame[..32]).map_err(node_err)?;
    let pad = sha256(&[&point_to_bytes(&(c1 * secret))]);
    let length = frame[33] as usize;
    Ok(frame[34..]
        .iter()
        .zip(pad.iter())
        .map(|(b, p)| b ^ p)
        .take(length)
        .collect())
}

#[async_trait]
impl Vendor for TestVendor {
    async fn decryption_test(
        &self,
        encrypted_by_user_key: &str,
        encrypted_by_vendor_key: &str,
        _credential: &str,
        _ork_url: &str,
    ) -> Result<String, TransportError> {
        let a = open_elgamal(encrypted_by_user_key, &self.user_secret)?;
        let b = open_elgamal(encrypted_by_vendor_key, &self.vendor_secret)?;
        Ok(if a == b { "Test Passed" } else { "Test Failed" }.to_string())
    }
}

#[test]
fn test_vendor_decryption_proof() {
    let user_secret = Scalar::random(&mut OsRng);
    let vendor_secret = Scalar::random(&mut OsRng);
    let vendor = TestVendor {
        user_secret,
        vendor_secret,
    };

    smol::block_on(run_decryption_test(
        &vendor,
        &base_mul(&user_secret),
        &base_mul(&vendor_secret),
        "credential",
        "http://ork0.test",
    ))
    .unwrap();

    // Encrypting to a key the vendor does not hold must fail the proof.
    let result = smol::block_on(run_decryption_test(
        &vendor,
        &base_mul(&user_secret),
        &base_mul(&Scalar::random(&mut OsRng)),
        "credential",
        "http://ork0.test",
    ));
    assert!(matches!(result, Err(ProtocolError::AssertionFailed(_))));
}

#[test]
fn test_refused_commit_is_surfaced_for_reconciliation() {
    let fleet = Fleet::new(5);
    fleet.set_reject_commits(true);
    assert!(matches!(
        sign_up(&fleet),
        Err(ProtocolError::CommitFailed(_))
    ));
}
