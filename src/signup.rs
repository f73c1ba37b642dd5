//! The sign-up flow: provision a user's master and session keys across two
//! node sets, prove the whole construction works, then commit.
//!
//! The ceremony runs twice — once for the master key (two secrets: the key
//! itself and the password-derived one protecting it at rest), once for the
//! session key, whose authorization point comes out of the first run. A
//! full trial sign-in exercises the uncommitted keys end to end before
//! either commit is sent, so a broken provisioning never persists.
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand_core::{OsRng, RngCore};

use crate::aead::elgamal_encrypt;
use crate::auth::{unix_now, KeyAuthenticationFlow};
use crate::curve::{base_mul, hash_to_point, invert, point_to_bytes, scalar_from_hash256, sha256, sha512};
use crate::error::{InitializationError, ProtocolError};
use crate::jwt;
use crate::keygen::{GenShardAggregate, KeyGenerationFlow, KeyType};
use crate::orks::{OrkInfo, OrkList};
use crate::transport::{Transport, Vendor};

/// The sentinel the vendor's decryption-proof endpoint must answer.
const TEST_SENTINEL: &str = "Test Passed";

/// Parameters for a sign-up run. All fields are required.
pub struct SignUpConfig {
    /// The nodes that will hold the master-key shares.
    pub cmk_orks: Vec<OrkInfo>,
    /// The nodes that will hold the session-key shares.
    pub cvk_orks: Vec<OrkInfo>,
    /// Quorum threshold later sign-ins will run with; the trial sign-in
    /// uses it too.
    pub threshold: usize,
}

/// Identity points derived from the master ceremony's multiplied outputs.
struct DerivedKeyPoints {
    vuid: String,
    cmk_auth: EdwardsPoint,
    prism_auth: EdwardsPoint,
}

fn derive_key_points(
    aggregate: &GenShardAggregate,
    user_blind: &Scalar,
    pass_blind: &Scalar,
) -> Result<DerivedKeyPoints, ProtocolError> {
    let [Some(mult_user), Some(mult_pass)] = aggregate.multiplied[..] else {
        return Err(ProtocolError::AssertionFailed(
            "nodes did not multiply both blinded identity points".to_string(),
        ));
    };
    let user_cmk = mult_user * invert(user_blind)?;
    let pass_prism = mult_pass * invert(pass_blind)?;

    let prism_auth = base_mul(&scalar_from_hash256(&[&point_to_bytes(&pass_prism)]));
    let digest = sha512(&[&point_to_bytes(&user_cmk)]);
    let mut first = [0u8; 32];
    first.copy_from_slice(&digest[..32]);
    let cmk_mul = Scalar::from_bytes_mod_order(first);

    Ok(DerivedKeyPoints {
        vuid: hex::encode(&digest[32..]),
        cmk_auth: aggregate.public * cmk_mul,
        prism_auth,
    })
}

/// The sign-up flow.
pub struct SignUp {
    cmk_orks: OrkList,
    cvk_orks: OrkList,
    threshold: usize,
}

impl SignUp {
    pub fn new(config: SignUpConfig) -> Result<Self, InitializationError> {
        let cmk_orks = OrkList::new(config.cmk_orks)?;
        let cvk_orks = OrkList::new(config.cvk_orks)?;
        if config.threshold < 2 {
            return Err(InitializationError::BadParameters(
                "threshold cannot be < 2".to_string(),
            ));
        }
        if config.threshold > cmk_orks.len() || config.threshold > cvk_orks.len() {
            return Err(InitializationError::BadParameters(
                "threshold must be <= the node count of both sets".to_string(),
            ));
        }
        Ok(Self {
            cmk_orks,
            cvk_orks,
            threshold: config.threshold,
        })
    }

    /// Provision both keys and return the trial sign-in's credential.
    pub async fn run<T: Transport>(
        &self,
        transport: &T,
        username: &str,
        password: &str,
        vendor_public: &str,
    ) -> Result<String, ProtocolError> {
        let uid = hex::encode(sha256(&[username.to_lowercase().as_bytes()]));
        let user_blind = Scalar::random(&mut OsRng);
        let pass_blind = Scalar::random(&mut OsRng);

        let user_point =
            hash_to_point(format!("{}{}", username.to_lowercase(), vendor_public).as_bytes());
        let pass_point = hash_to_point(password.as_bytes());
        let blur_user = user_point * user_blind;
        let blur_pass = pass_point * pass_blind;

        // Master ceremony: the key itself plus the password-derived one,
        // with both blinded identity points sent along for multiplication.
        let cmk_flow = KeyGenerationFlow::new(self.cmk_orks.clone(), transport);
        let cmk_gen = cmk_flow
            .gen_shard(&uid, 2, &[Some(blur_user), Some(blur_pass)])
            .await?;
        let derived = derive_key_points(&cmk_gen, &user_blind, &pass_blind)?;
        let cmk_sig = cmk_flow
            .send_shard(&uid, &cmk_gen, &derived.prism_auth, KeyType::Cmk)
            .await?;

        // Session ceremony, keyed by the derived user id and authorized by
        // the master ceremony's output. This data dependency is the only
        // coupling between the two runs.
        let cvk_flow = KeyGenerationFlow::new(self.cvk_orks.clone(), transport);
        let cvk_gen = cvk_flow.gen_shard(&derived.vuid, 1, &[]).await?;
        let cvk_sig = cvk_flow
            .send_shard(&derived.vuid, &cvk_gen, &derived.cmk_auth, KeyType::Cvk)
            .await?;

        let credential = self
            .trial_sign_in(
                transport,
                username,
                password,
                vendor_public,
                &cmk_gen.public,
                &cvk_gen.public,
            )
            .await?;

        // Only now is anything persisted.
        let (cmk_commit, cvk_commit) = futures::join!(
            cmk_flow.commit(&uid, &cmk_sig, KeyType::Cmk, Some(&derived.prism_auth)),
            cvk_flow.commit(&derived.vuid, &cvk_sig, KeyType::Cvk, None),
        );
        cmk_commit?;
        cvk_commit?;

        Ok(credential)
    }

    /// A complete sign-in against the not-yet-committed keys.
    async fn trial_sign_in<T: Transport>(
        &self,
        transport: &T,
        username: &str,
        password: &str,
        vendor_public: &str,
        cmk_public: &EdwardsPoint,
        cvk_public: &EdwardsPoint,
    ) -> Result<String, ProtocolError> {
        let uid = hex::encode(sha256(&[username.to_lowercase().as_bytes()]));
        let start_time = unix_now();
        let user_blind = Scalar::random(&mut OsRng);
        let pass_blind = Scalar::random(&mut OsRng);
        let blur_user =
            hash_to_point(format!("{}{}", username.to_lowercase(), vendor_public).as_bytes())
                * user_blind;
        let blur_pass = hash_to_point(password.as_bytes()) * pass_blind;

        let mut flow =
            KeyAuthenticationFlow::new(self.cmk_orks.clone(), self.threshold, false, transport);
        let convert = flow
            .convert(
                &uid,
                &blur_user,
                &blur_pass,
                &user_blind,
                &pass_blind,
                start_time,
                cmk_public,
                vendor_public,
            )
            .await?;
        flow.set_cvk_orks(self.cvk_orks.clone());
        let (pre, coefficients) = flow
            .authenticate_and_pre_sign(&uid, &convert.vuid, &convert, false)
            .await?;
        let (credential, _) = flow
            .sign_in(&convert.vuid, &convert, &pre, &coefficients, "default", None)
            .await?;

        if !jwt::verify(&credential, cvk_public) {
            return Err(ProtocolError::SignatureAggregationFailed(
                "trial sign-in credential failed to verify".to_string(),
            ));
        }
        Ok(credential)
    }
}

/// Prove to the relying party that the session key can decrypt for it:
/// a fresh challenge is encrypted to both publics and submitted for the
/// vendor to compare.
pub async fn run_decryption_test<V: Vendor>(
    vendor: &V,
    user_public: &EdwardsPoint,
    vendor_public: &EdwardsPoint,
    credential: &str,
    ork_url: &str,
) -> Result<(), ProtocolError> {
    let mut challenge = [0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    let by_user_key = elgamal_encrypt(&challenge, user_public);
    let by_vendor_key = elgamal_encrypt(&challenge, vendor_public);

    let answer = vendor
        .decryption_test(&by_user_key, &by_vendor_key, credential, ork_url)
        .await
        .map_err(|e| e.into_protocol())?;
    if answer != TEST_SENTINEL {
        return Err(ProtocolError::AssertionFailed(format!(
            "decryption test answered {:?}",
            answer
        )));
    }
    Ok(())
}
