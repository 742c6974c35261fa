//! Patch gate
//!
//! Accepts or rejects a candidate patch before anything touches disk: the
//! text must be a structurally valid diff and every file it touches must be
//! on the allow-list.

use crate::allowlist::AllowList;
use crate::diff::{validate_unified_diff, MalformedDiff, ValidatedDiff};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a touched path is matched against allow-list entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrictness {
    /// Either string ends with the other (`src/foo.cpp` ~ `foo.cpp`).
    #[default]
    Suffix,
    /// Like `Suffix`, but only on whole path components.
    Component,
    /// Byte-for-byte equality.
    Exact,
}

impl MatchStrictness {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrictness::Suffix => "suffix",
            MatchStrictness::Component => "component",
            MatchStrictness::Exact => "exact",
        }
    }
}

/// Whether `touched` is covered by the allow-list entry `allowed`.
pub fn path_matches(allowed: &str, touched: &str, strictness: MatchStrictness) -> bool {
    match strictness {
        MatchStrictness::Exact => allowed == touched,
        MatchStrictness::Suffix => allowed.ends_with(touched) || touched.ends_with(allowed),
        MatchStrictness::Component => {
            allowed == touched
                || ends_with_component(allowed, touched)
                || ends_with_component(touched, allowed)
        }
    }
}

fn ends_with_component(longer: &str, shorter: &str) -> bool {
    !shorter.is_empty()
        && longer
            .strip_suffix(shorter)
            .map(|head| head.ends_with('/'))
            .unwrap_or(false)
}

/// Why a patch was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateRejection {
    #[error(transparent)]
    MalformedDiff(#[from] MalformedDiff),
    #[error("patch modifies disallowed files: {}", files.join(", "))]
    DisallowedFile { files: Vec<String> },
}

/// Outcome of gating one candidate patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchDecision {
    Accepted(ValidatedDiff),
    RejectedMalformed(MalformedDiff),
    RejectedDisallowed(Vec<String>),
}

impl PatchDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PatchDecision::Accepted(_))
    }

    pub fn into_result(self) -> Result<ValidatedDiff, GateRejection> {
        match self {
            PatchDecision::Accepted(diff) => Ok(diff),
            PatchDecision::RejectedMalformed(err) => Err(GateRejection::MalformedDiff(err)),
            PatchDecision::RejectedDisallowed(files) => Err(GateRejection::DisallowedFile { files }),
        }
    }
}

/// Pure accept/reject decision over an allow-list.
#[derive(Debug, Clone)]
pub struct PatchGate {
    allow: AllowList,
    strictness: MatchStrictness,
}

impl PatchGate {
    pub fn new(allow: AllowList) -> Self {
        Self {
            allow,
            strictness: MatchStrictness::default(),
        }
    }

    pub fn with_strictness(mut self, strictness: MatchStrictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn strictness(&self) -> MatchStrictness {
        self.strictness
    }

    pub fn permits(&self, touched: &str) -> bool {
        self.allow
            .iter()
            .any(|allowed| path_matches(allowed, touched, self.strictness))
    }

    /// Touched paths with no matching allow-list entry, sorted.
    pub fn disallowed<'a>(&self, touched: &'a BTreeSet<String>) -> Vec<&'a str> {
        touched
            .iter()
            .map(String::as_str)
            .filter(|path| !self.permits(path))
            .collect()
    }

    pub fn evaluate(&self, patch: &str) -> PatchDecision {
        let diff = match validate_unified_diff(patch) {
            Ok(diff) => diff,
            Err(err) => return PatchDecision::RejectedMalformed(err),
        };

        let offending = self.disallowed(diff.files());
        if offending.is_empty() {
            PatchDecision::Accepted(diff)
        } else {
            PatchDecision::RejectedDisallowed(offending.into_iter().map(str::to_string).collect())
        }
    }
}
