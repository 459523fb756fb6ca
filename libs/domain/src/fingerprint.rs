//! Stable fingerprints for memoization
//!
//! Fingerprints are sha256 over canonical JSON. Canonicality comes from the
//! data model itself: every map in the model is a `BTreeMap`, and serde_json
//! objects sort their keys, so serializing the same logical value always
//! yields the same bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::step::Step;
use crate::value::Args;

/// Hex-encoded sha256 of the canonical JSON form of a value
#[must_use]
pub fn sha256_hex<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&json);
    hex::encode(digest)
}

/// Fingerprint of a step definition.
///
/// Covers kind, body, attributes, and work configuration — the parts that
/// determine what an invocation computes. The id is deliberately excluded so
/// a renamed but otherwise identical step shares cache entries.
#[must_use]
pub fn step_fingerprint(step: &Step) -> String {
    #[derive(Serialize)]
    struct Projection<'a> {
        body: &'a crate::step::StepBody,
        attributes: &'a std::collections::BTreeMap<String, crate::attribute::AttributeSpec>,
        work: &'a crate::work::WorkConfig,
    }

    sha256_hex(&Projection {
        body: &step.body,
        attributes: &step.attributes,
        work: &step.work,
    })
}

/// Fingerprint of a sorted argument map
#[must_use]
pub fn args_fingerprint(args: &Args) -> String {
    sha256_hex(args)
}
