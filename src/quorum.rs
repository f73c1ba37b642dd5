//! Fan-out/fan-in over many node calls.
//!
//! Every round issues one call per known participant and then decides which
//! subset counts. Results always carry the index of the originating node in
//! the list the calls were built from, and are returned sorted by that
//! index: downstream combination zips node lists, coefficient arrays and
//! partial values by position, so arrival order must never leak through.
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

use crate::error::{ProtocolError, QuorumFailure};
use crate::transport::TransportError;

/// One successful call, tagged with the position of the node that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumResult<T> {
    pub index: usize,
    pub value: T,
}

impl<T> QuorumResult<T> {
    /// The surviving indices of a batch of results.
    pub fn indices(results: &[QuorumResult<T>]) -> Vec<usize> {
        results.iter().map(|r| r.index).collect()
    }

    /// Strip the indices, keeping values in index order.
    pub fn values(results: Vec<QuorumResult<T>>) -> Vec<T> {
        results.into_iter().map(|r| r.value).collect()
    }
}

fn classify(failures: &[TransportError]) -> ProtocolError {
    if failures
        .iter()
        .any(|e| matches!(e, TransportError::RateLimited))
    {
        ProtocolError::QuorumNotMet(QuorumFailure::RateLimited)
    } else {
        ProtocolError::QuorumNotMet(QuorumFailure::NodesUnreachable)
    }
}

/// Wait for every call and require every one to succeed.
///
/// Used by the key-generation ceremonies, where a missing participant makes
/// the resulting share set useless.
pub async fn gather_all<T, F>(calls: Vec<F>) -> Result<Vec<QuorumResult<T>>, ProtocolError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let settled = join_all(calls).await;
    let mut results = Vec::with_capacity(settled.len());
    let mut failures = Vec::new();
    for (index, outcome) in settled.into_iter().enumerate() {
        match outcome {
            Ok(value) => results.push(QuorumResult { index, value }),
            Err(e) => failures.push(e),
        }
    }
    if !failures.is_empty() {
        return Err(classify(&failures));
    }
    Ok(results)
}

/// Wait for every call to settle, then keep the successes.
///
/// Fails unless at least `threshold` distinct calls succeeded, reporting a
/// rate-limit specifically when any node said so.
pub async fn gather_threshold<T, F>(
    calls: Vec<F>,
    threshold: usize,
) -> Result<Vec<QuorumResult<T>>, ProtocolError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let settled = join_all(calls).await;
    let mut results = Vec::with_capacity(settled.len());
    let mut failures = Vec::new();
    for (index, outcome) in settled.into_iter().enumerate() {
        match outcome {
            Ok(value) => results.push(QuorumResult { index, value }),
            Err(e) => failures.push(e),
        }
    }
    if results.len() < threshold {
        return Err(classify(&failures));
    }
    Ok(results)
}

/// Race the calls and stop at the first `threshold` distinct successes.
///
/// Stragglers are abandoned, not cancelled: the transport owns per-call
/// deadlines, this function just stops listening. Results still come back
/// sorted by original index.
pub async fn race_threshold<T, F>(
    calls: Vec<F>,
    threshold: usize,
) -> Result<Vec<QuorumResult<T>>, ProtocolError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    let mut pending: FuturesUnordered<_> = calls
        .into_iter()
        .enumerate()
        .map(|(index, fut)| async move { (index, fut.await) })
        .collect();

    let mut results = Vec::new();
    let mut failures = Vec::new();
    while let Some((index, outcome)) = pending.next().await {
        match outcome {
            Ok(value) => {
                results.push(QuorumResult { index, value });
                if results.len() >= threshold {
                    break;
                }
            }
            Err(e) => failures.push(e),
        }
    }
    if results.len() < threshold {
        return Err(classify(&failures));
    }
    results.sort_by_key(|r| r.index);
    Ok(results)
}
