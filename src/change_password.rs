//! The change-password flow.
//!
//! Proves the old password through a password-only conversion (collecting
//! each node's one-time challenge), re-shares the password-derived key
//! under the new password, and pauses with the new shares provisional.
//! `finish` commits them; until then the old password still works.
use curve25519_dalek::Scalar;
use rand_core::OsRng;

use crate::auth::KeyAuthenticationFlow;
use crate::curve::{base_mul, hash_to_point, invert, point_to_bytes, scalar_from_hash256, sha256};
use crate::error::{InitializationError, ProtocolError};
use crate::keygen::{KeyGenerationFlow, KeyType};
use crate::orks::OrkList;
use crate::transport::{Directory, Transport};

/// Parameters for a change-password run.
pub struct ChangePasswordConfig {
    /// Minimum distinct successful node responses for the conversion round.
    pub threshold: usize,
}

struct PendingCommit<'a, T> {
    flow: KeyGenerationFlow<'a, T>,
    uid: String,
    signature: Scalar,
}

/// The change-password flow.
pub struct ChangePassword<'a, T, D> {
    threshold: usize,
    transport: &'a T,
    directory: &'a D,
    state: Option<PendingCommit<'a, T>>,
}

impl<'a, T: Transport, D: Directory> ChangePassword<'a, T, D> {
    pub fn new(
        config: ChangePasswordConfig,
        transport: &'a T,
        directory: &'a D,
    ) -> Result<Self, InitializationError> {
        if config.threshold < 2 {
            return Err(InitializationError::BadParameters(
                "threshold cannot be < 2".to_string(),
            ));
        }
        Ok(Self {
            threshold: config.threshold,
            transport,
            directory,
            state: None,
        })
    }

    /// Authenticate with the old password and re-share under the new one,
    /// stopping short of the commit.
    pub async fn start(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), ProtocolError> {
        let uid = hex::encode(sha256(&[username.to_lowercase().as_bytes()]));
        let orks = self
            .directory
            .get_user_orks(&uid)
            .await
            .map_err(|e| e.into_protocol())?;
        let orks = OrkList::new(orks).map_err(|e| {
            ProtocolError::AssertionFailed(format!("directory returned a bad node list: {}", e))
        })?;

        let old_blind = Scalar::random(&mut OsRng);
        let blur_old = hash_to_point(old_password.as_bytes()) * old_blind;
        let mut auth = KeyAuthenticationFlow::new(orks, self.threshold, true, self.transport);
        let challenges = auth.prism_convert(&uid, &blur_old, &old_blind).await?;

        // The re-share runs against exactly the nodes that answered; each
        // checks the challenge it issued a moment ago.
        let new_blind = Scalar::random(&mut OsRng);
        let blur_new = hash_to_point(new_password.as_bytes()) * new_blind;
        let flow = KeyGenerationFlow::new(auth.cmk_orks().clone(), self.transport);
        let aggregate = flow.update_shard(&uid, &challenges, &blur_new).await?;

        let [Some(multiplied)] = aggregate.multiplied[..] else {
            return Err(ProtocolError::AssertionFailed(
                "nodes did not multiply the blinded password point".to_string(),
            ));
        };
        let new_pass_prism = multiplied * invert(&new_blind)?;
        let new_prism_auth = base_mul(&scalar_from_hash256(&[&point_to_bytes(&new_pass_prism)]));

        let signature = flow
            .send_shard(&uid, &aggregate, &new_prism_auth, KeyType::Prism)
            .await?;
        self.state = Some(PendingCommit {
            flow,
            uid,
            signature,
        });
        Ok(())
    }

    /// Commit the re-shared key; the new password is live once this
    /// returns. Fails with `NoSavedState` unless `start` just succeeded.
    pub async fn finish(&mut self) -> Result<(), ProtocolError> {
        let pending = self.state.take().ok_or(ProtocolError::NoSavedState)?;
        pending
            .flow
            .commit(&pending.uid, &pending.signature, KeyType::Prism, None)
            .await
    }
}
