//! This module holds utilities for working with the set of ORK nodes a
//! protocol run talks to.
//!
//! A run starts from a full list and shrinks it as nodes fail to answer;
//! every later round must use the surviving list, in original order, and
//! recompute interpolation coefficients for exactly that set.
use curve25519_dalek::{EdwardsPoint, Scalar};

use crate::error::{InitializationError, ProtocolError};
use crate::math::lagrange_coefficient;

/// Everything a client knows about one ORK node.
#[derive(Debug, Clone)]
pub struct OrkInfo {
    /// The node's identifier, doubling as its share evaluation point.
    pub id: u64,
    /// Opaque endpoint the transport layer dials.
    pub url: String,
    /// The node's long-term public key.
    pub public: EdwardsPoint,
}

impl OrkInfo {
    pub fn new(id: u64, url: impl Into<String>, public: EdwardsPoint) -> Self {
        Self {
            id,
            url: url.into(),
            public,
        }
    }

    /// The scalar evaluation point this node's shares live at.
    pub fn scalar_id(&self) -> Scalar {
        Scalar::from(self.id)
    }
}

/// An ordered, duplicate-free list of ORK nodes.
///
/// The order is load-bearing: per-node request arguments, response values
/// and Lagrange coefficients are all zipped by position.
#[derive(Debug, Clone)]
pub struct OrkList {
    orks: Vec<OrkInfo>,
}

impl OrkList {
    /// Build a list, rejecting empty input and duplicate ids.
    pub fn new(orks: Vec<OrkInfo>) -> Result<Self, InitializationError> {
        if orks.is_empty() {
            return Err(InitializationError::BadParameters(
                "ork list cannot be empty".to_string(),
            ));
        }
        let mut ids: Vec<u64> = orks.iter().map(|o| o.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() < orks.len() {
            return Err(InitializationError::BadParameters(
                "ork list cannot contain duplicate ids".to_string(),
            ));
        }
        if orks.iter().any(|o| o.id == 0) {
            return Err(InitializationError::BadParameters(
                "ork id 0 would place a share at the secret itself".to_string(),
            ));
        }
        Ok(Self { orks })
    }

    pub fn len(&self) -> usize {
        self.orks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrkInfo> {
        self.orks.iter()
    }

    pub fn get(&self, index: usize) -> &OrkInfo {
        &self.orks[index]
    }

    pub fn ids(&self) -> Vec<u64> {
        self.orks.iter().map(|o| o.id).collect()
    }

    pub fn scalar_ids(&self) -> Vec<Scalar> {
        self.orks.iter().map(|o| o.scalar_id()).collect()
    }

    pub fn publics(&self) -> Vec<EdwardsPoint> {
        self.orks.iter().map(|o| o.public).collect()
    }

    /// Lagrange coefficients for exactly the current set, by position.
    pub fn lagrange_coefficients(&self) -> Result<Vec<Scalar>, ProtocolError> {
        let xs = self.scalar_ids();
        xs.iter().map(|xi| lagrange_coefficient(xi, &xs)).collect()
    }

    /// The sub-list of nodes at `indices`, preserving original order.
    ///
    /// `indices` are positions in this list, as reported by the response
    /// aggregator for the calls that succeeded.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            orks: sorted
                .into_iter()
                .filter(|&i| i < self.orks.len())
                .map(|i| self.orks[i].clone())
                .collect(),
        }
    }
}
