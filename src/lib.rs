//! Dauth is the client side of a password-authenticated threshold-key
//! system: a user's keys live as shares across a set of independent "ORK"
//! nodes, and no node — nor any subset below a quorum threshold — can
//! reconstruct a credential or key on its own.
//!
//! # Warning
//!
//! This is experimental cryptographic software. The protocol has no formal
//! proof of security and this implementation has not been audited.
//!
//! # Design
//!
//! The client never sends a secret-derived point in the clear. Identity and
//! password points are blinded by fresh randoms before leaving the machine,
//! and every aggregate the nodes hand back is verified — with the curve
//! cofactor cleared — before anything is trusted or persisted:
//!
//! - **Key generation** ([`KeyGenerationFlow`]) runs the three-phase
//!   ceremony: every node contributes a share of a fresh secret, shares are
//!   redistributed through a transposed ciphertext matrix so each node ends
//!   up with the column addressed to it, and the nodes' partial signatures
//!   over the assembled key must verify before the final commit round may
//!   run.
//! - **Authentication** ([`KeyAuthenticationFlow`]) converts blinded
//!   user/password points into per-node symmetric keys, proves the password
//!   through a blind-signature exchange, and collects a threshold signature
//!   over a session credential ([`jwt`]).
//! - **Flows** ([`SignUp`], [`SignIn`], [`ChangePassword`]) compose the
//!   rounds. Sign-in and change-password are two-phase: they pause at a
//!   deliberate suspension point (waiting for a caller-supplied value or
//!   confirmation) and resume on demand.
//!
//! Node unavailability is survived, not fought: each round fans out to the
//! whole known set, keeps the quorum that answered, and recomputes the
//! interpolation coefficients for exactly the survivors. Falling below the
//! threshold is a typed error ([`ProtocolError::QuorumNotMet`]) that tells
//! a rate-limited account apart from an outage.
//!
//! Transport is abstract: implement [`Transport`] (and [`Directory`], and
//! optionally [`Vendor`]) over whatever HTTP stack hosts the client. The
//! crate only assumes one asynchronous call per node operation that either
//! yields the response body or fails.
mod aead;
mod auth;
mod change_password;
pub mod curve;
mod error;
pub mod jwt;
mod keygen;
mod math;
mod messages;
mod orks;
mod quorum;
mod signin;
mod signup;
#[cfg(test)]
mod test;
mod transport;

pub use aead::AeadKey;
pub use auth::{
    cmk_convert_reply, decrypt_challenges, pre_sign_in_reply, prism_convert_reply, sign_in_reply,
    ConvertOutput, KeyAuthenticationFlow, PreSignData, PreSignOutput,
};
pub use change_password::{ChangePassword, ChangePasswordConfig};
pub use error::{InitializationError, ProtocolError, QuorumFailure};
pub use keygen::{
    aggregate_gen_shard, aggregate_send_shard, GenShardAggregate, KeyGenerationFlow, KeyType,
};
pub use math::{lagrange_coefficient, median, transpose};
pub use messages::{
    AuthRequest, AuthenticateResponse, ConvertResponse, EncryptedConvertResponse,
    GenShardResponse, PreSignInResponse, PrismConvertResponse, SendShardResponse, SignInResponse,
};
pub use orks::{OrkInfo, OrkList};
pub use quorum::{gather_all, gather_threshold, race_threshold, QuorumResult};
pub use signin::{CompletedSignIn, SignIn, SignInConfig, StartedSignIn};
pub use signup::{run_decryption_test, SignUp, SignUpConfig};
pub use transport::{Directory, NodeClient, SignInCvkArgs, Transport, TransportError, Vendor};
