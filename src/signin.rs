//! The sign-in flow, split in two on purpose.
//!
//! `start` runs the conversion round and pauses; the caller typically uses
//! the reported session key and user id to fetch relying-party data, some
//! of which may need to be co-signed. `continue_with` takes that optional
//! model, finishes authentication and signing, and yields the credential.
//! The pause is indefinite — it ends when the caller acts, not on a timer.
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand_core::OsRng;

use crate::auth::{unix_now, ConvertOutput, KeyAuthenticationFlow};
use crate::curve::{hash_to_point, sha256};
use crate::error::{InitializationError, ProtocolError};
use crate::orks::{OrkInfo, OrkList};
use crate::transport::{Directory, Transport};

/// Parameters for a sign-in run.
pub struct SignInConfig {
    /// The service flavor being signed into; anything but `"default"`
    /// requires a model to sign.
    pub mode: String,
    /// A model fixed up front; takes precedence over the one passed to
    /// [`SignIn::continue_with`].
    pub model_to_sign: Option<String>,
    /// Minimum distinct successful node responses per round.
    pub threshold: usize,
}

impl Default for SignInConfig {
    fn default() -> Self {
        Self {
            mode: "default".to_string(),
            model_to_sign: None,
            threshold: 2,
        }
    }
}

/// What the caller learns at the suspension point.
pub struct StartedSignIn {
    /// The verifier-scoped user id.
    pub vuid: String,
    /// The aggregate public key the final credential will verify against.
    pub key_public: EdwardsPoint,
}

/// The completed flow's outputs.
pub struct CompletedSignIn {
    /// The signed session credential.
    pub credential: String,
    /// Detached signature over the model, when one was requested.
    pub model_signature: Option<String>,
}

struct SavedState<'a, T> {
    flow: KeyAuthenticationFlow<'a, T>,
    convert: ConvertOutput,
    uid: String,
}

/// The sign-in flow.
pub struct SignIn<'a, T, D> {
    config: SignInConfig,
    transport: &'a T,
    directory: &'a D,
    state: Option<SavedState<'a, T>>,
}

fn node_list(orks: Vec<OrkInfo>) -> Result<OrkList, ProtocolError> {
    OrkList::new(orks)
        .map_err(|e| ProtocolError::AssertionFailed(format!("directory returned a bad node list: {}", e)))
}

impl<'a, T: Transport, D: Directory> SignIn<'a, T, D> {
    pub fn new(
        config: SignInConfig,
        transport: &'a T,
        directory: &'a D,
    ) -> Result<Self, InitializationError> {
        if config.mode.is_empty() {
            return Err(InitializationError::BadParameters(
                "mode cannot be empty".to_string(),
            ));
        }
        if config.threshold < 2 {
            return Err(InitializationError::BadParameters(
                "threshold cannot be < 2".to_string(),
            ));
        }
        Ok(Self {
            config,
            transport,
            directory,
            state: None,
        })
    }

    /// Run the conversion round and pause before any signing.
    pub async fn start(
        &mut self,
        username: &str,
        password: &str,
        vendor_public: &str,
    ) -> Result<StartedSignIn, ProtocolError> {
        let start_time = unix_now();
        let user_blind = Scalar::random(&mut OsRng);
        let pass_blind = Scalar::random(&mut OsRng);
        let uid = hex::encode(sha256(&[username.to_lowercase().as_bytes()]));

        let cmk_orks = self
            .directory
            .get_user_orks(&uid)
            .await
            .map_err(|e| e.into_protocol())?;
        let cmk_public = self
            .directory
            .get_key_public(&uid)
            .await
            .map_err(|e| e.into_protocol())?;

        let blur_user =
            hash_to_point(format!("{}{}", username.to_lowercase(), vendor_public).as_bytes())
                * user_blind;
        let blur_pass = hash_to_point(password.as_bytes()) * pass_blind;

        let mut flow = KeyAuthenticationFlow::new(
            node_list(cmk_orks)?,
            self.config.threshold,
            true,
            self.transport,
        );
        let convert = flow
            .convert(
                &uid,
                &blur_user,
                &blur_pass,
                &user_blind,
                &pass_blind,
                start_time,
                &cmk_public,
                vendor_public,
            )
            .await?;

        let key_public = self
            .directory
            .get_key_public(&convert.vuid)
            .await
            .map_err(|e| e.into_protocol())?;
        let vuid = convert.vuid.clone();
        self.state = Some(SavedState { flow, convert, uid });

        Ok(StartedSignIn { vuid, key_public })
    }

    /// Resume with the model to co-sign (or none) and finish the flow.
    ///
    /// Fails with `NoSavedState` before `start`, or after the state was
    /// already consumed — each `start` backs exactly one continuation.
    pub async fn continue_with(
        &mut self,
        model_to_sign: Option<&str>,
    ) -> Result<CompletedSignIn, ProtocolError> {
        let SavedState {
            mut flow,
            convert,
            uid,
        } = self.state.take().ok_or(ProtocolError::NoSavedState)?;

        let model = self.config.model_to_sign.as_deref().or(model_to_sign);
        let cvk_orks = self
            .directory
            .get_user_orks(&convert.vuid)
            .await
            .map_err(|e| e.into_protocol())?;
        flow.set_cvk_orks(node_list(cvk_orks)?);

        let (pre, coefficients) = flow
            .authenticate_and_pre_sign(&uid, &convert.vuid, &convert, model.is_some())
            .await?;
        let (credential, model_signature) = flow
            .sign_in(
                &convert.vuid,
                &convert,
                &pre,
                &coefficients,
                &self.config.mode,
                model,
            )
            .await?;

        Ok(CompletedSignIn {
            credential,
            model_signature,
        })
    }
}
