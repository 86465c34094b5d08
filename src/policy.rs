//! Named admission policies, one per traffic class.

use crate::error::{AdmissionError, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const SEARCH: &str = "search";
pub const RATING: &str = "rating";
pub const COMMENT: &str = "comment";
pub const AUTH: &str = "auth";
pub const UPLOAD: &str = "upload";
pub const API: &str = "api";

/// Policy used when a caller does not name a traffic class.
pub const DEFAULT_POLICY: &str = API;

/// `(name, window_ms, max_requests)` for every built-in traffic class.
pub const BUILTIN_POLICIES: [(&str, u64, u64); 6] = [
    (SEARCH, 10_000, 10),
    (RATING, 60_000, 5),
    (COMMENT, 60_000, 10),
    (AUTH, 3_600_000, 5),
    (UPLOAD, 60_000, 3),
    (API, 60_000, 30),
];

// Names end up in bucket keys as "{policy}:{identifier}", so no ':' allowed.
static POLICY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("policy name pattern is valid"));

/// Admission rule for a single traffic class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub name: String,
    pub window_ms: u64,
    pub max_requests: u64,
}

impl Policy {
    pub fn new(name: &str, window_ms: u64, max_requests: u64) -> Result<Self> {
        if !POLICY_NAME.is_match(name) {
            return Err(AdmissionError::InvalidPolicy(format!(
                "policy name '{}' must match {}",
                name,
                POLICY_NAME.as_str()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            window_ms,
            max_requests,
        })
    }
}

/// Read-only table of policies keyed by name.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Policy>,
}

impl PolicyRegistry {
    /// The built-in traffic classes: search, rating, comment, auth, upload, api.
    pub fn builtin() -> Self {
        let policies = BUILTIN_POLICIES
            .iter()
            .map(|&(name, window_ms, max_requests)| {
                (
                    name.to_string(),
                    Policy {
                        name: name.to_string(),
                        window_ms,
                        max_requests,
                    },
                )
            })
            .collect();
        Self { policies }
    }

    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// Add or replace a policy. Zero limits and zero windows are legal.
    pub fn with_policy(mut self, name: &str, window_ms: u64, max_requests: u64) -> Result<Self> {
        let policy = Policy::new(name, window_ms, max_requests)?;
        self.policies.insert(policy.name.clone(), policy);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Like [`get`](Self::get), but an unknown name is an error.
    pub fn lookup(&self, name: &str) -> Result<&Policy> {
        self.get(name)
            .ok_or_else(|| AdmissionError::UnknownPolicy(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Policies in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
