//! Secret-sharing arithmetic: Lagrange coefficients and the small
//! combinatorial helpers the aggregation steps lean on.
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{EdwardsPoint, Scalar};

use crate::curve::invert;
use crate::error::ProtocolError;

/// Compute the Lagrange basis coefficient for `xi` evaluated at zero,
/// relative to the evaluation points `xs`.
///
/// `li = Π_{xj ≠ xi} xj / (xj − xi)`, so that `Σ f(xi)·li` reconstructs
/// `f(0)` for any polynomial of low enough degree.
///
/// The set must contain `xi` itself, exactly once; a duplicate makes a zero
/// denominator and fails with `NotInvertible`. Coefficients are only valid
/// for exactly this set of points and must be recomputed whenever the
/// surviving quorum changes. A singleton set yields the empty product, 1.
pub fn lagrange_coefficient(xi: &Scalar, xs: &[Scalar]) -> Result<Scalar, ProtocolError> {
    let mut li = Scalar::ONE;
    let mut found = false;
    for xj in xs {
        if xj == xi {
            if found {
                return Err(ProtocolError::NotInvertible);
            }
            found = true;
            continue;
        }
        li *= xj * invert(&(xj - xi))?;
    }
    if !found {
        return Err(ProtocolError::AssertionFailed(
            "interpolation point is not part of the evaluation set".to_string(),
        ));
    }
    Ok(li)
}

/// Sum a collection of points, starting from the identity element.
pub fn sum_points<'a>(points: impl IntoIterator<Item = &'a EdwardsPoint>) -> EdwardsPoint {
    points
        .into_iter()
        .fold(EdwardsPoint::identity(), |acc, p| acc + p)
}

/// `Σ pointᵢ·coefficientᵢ` — the Lagrange combination of partial points.
pub fn interpolate_points(
    points: &[EdwardsPoint],
    coefficients: &[Scalar],
) -> Result<EdwardsPoint, ProtocolError> {
    if points.len() != coefficients.len() {
        return Err(ProtocolError::AssertionFailed(format!(
            "{} points but {} coefficients",
            points.len(),
            coefficients.len()
        )));
    }
    Ok(points
        .iter()
        .zip(coefficients)
        .fold(EdwardsPoint::identity(), |acc, (p, c)| acc + p * c))
}

/// `Σ scalarᵢ·coefficientᵢ mod ℓ`.
pub fn interpolate_scalars(
    scalars: &[Scalar],
    coefficients: &[Scalar],
) -> Result<Scalar, ProtocolError> {
    if scalars.len() != coefficients.len() {
        return Err(ProtocolError::AssertionFailed(format!(
            "{} scalars but {} coefficients",
            scalars.len(),
            coefficients.len()
        )));
    }
    Ok(scalars
        .iter()
        .zip(coefficients)
        .fold(Scalar::ZERO, |acc, (s, c)| acc + s * c))
}

/// Upper median of a list of timestamps.
///
/// Key-generation timestamps are taken as the median across all node
/// responses so a node with a skewed clock cannot drag the result.
pub fn median(values: &[i64]) -> Result<i64, ProtocolError> {
    if values.is_empty() {
        return Err(ProtocolError::AssertionFailed(
            "median of an empty list".to_string(),
        ));
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    Ok(sorted[sorted.len() / 2])
}

/// Transpose a matrix of per-node share rows.
///
/// Row `i` holds the ciphertexts node `i` produced, one per destination;
/// column `j` is then exactly the list of ciphertexts addressed to node `j`.
/// Shares must reach their intended recipient, not their originator, so the
/// transpose is mandatory before redistribution.
pub fn transpose<T>(rows: Vec<Vec<T>>) -> Result<Vec<Vec<T>>, ProtocolError> {
    let Some(width) = rows.first().map(|r| r.len()) else {
        return Ok(Vec::new());
    };
    if rows.iter().any(|r| r.len() != width) {
        return Err(ProtocolError::InvalidEncoding(
            "share matrix rows have uneven lengths".to_string(),
        ));
    }
    let mut columns: Vec<Vec<T>> = Vec::with_capacity(width);
    for _ in 0..width {
        columns.push(Vec::with_capacity(rows.len()));
    }
    for row in rows {
        for (j, item) in row.into_iter().enumerate() {
            columns[j].push(item);
        }
    }
    Ok(columns)
}
