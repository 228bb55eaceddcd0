//! Authorization verdicts.
//!
//! A verdict is the cached unit of the whole system. It is serialized with
//! MessagePack so every cache tier stores the same opaque bytes.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CoreError, Result};
use crate::model::{Permission, ResourceRef, ResourceType};

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

/// The rule that produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantPath {
    DirectOwner,
    TeamRole,
    ProjectVisibility,
    Inherited,
    None,
}

impl GrantPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectOwner => "direct_owner",
            Self::TeamRole => "team_role",
            Self::ProjectVisibility => "project_visibility",
            Self::Inherited => "inherited",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for GrantPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an authorization check with its justification.
///
/// `grant_path = None` always pairs with `decision = Deny`; the constructors
/// enforce it and [`AuthorizationVerdict::decode`] rejects payloads that don't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationVerdict {
    pub subject_id: String,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub permission: Permission,
    pub decision: Decision,
    pub grant_path: GrantPath,
    #[serde(with = "time::serde::rfc3339")]
    pub resolved_at: OffsetDateTime,
    pub ttl_seconds: u64,
}

impl AuthorizationVerdict {
    /// Build an allow verdict. A `GrantPath::None` degrades to a deny.
    pub fn allow(
        subject_id: impl Into<String>,
        resource: &ResourceRef,
        permission: Permission,
        grant_path: GrantPath,
        ttl_seconds: u64,
    ) -> Self {
        debug_assert!(grant_path != GrantPath::None, "allow requires a grant path");
        let decision = if grant_path == GrantPath::None {
            Decision::Deny
        } else {
            Decision::Allow
        };
        Self {
            subject_id: subject_id.into(),
            resource_id: resource.id.clone(),
            resource_type: resource.resource_type,
            permission,
            decision,
            grant_path,
            resolved_at: OffsetDateTime::now_utc(),
            ttl_seconds,
        }
    }

    /// Build a default-deny verdict.
    pub fn deny(
        subject_id: impl Into<String>,
        resource: &ResourceRef,
        permission: Permission,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            resource_id: resource.id.clone(),
            resource_type: resource.resource_type,
            permission,
            decision: Decision::Deny,
            grant_path: GrantPath::None,
            resolved_at: OffsetDateTime::now_utc(),
            ttl_seconds,
        }
    }

    pub fn with_resolved_at(mut self, resolved_at: OffsetDateTime) -> Self {
        self.resolved_at = resolved_at;
        self
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type, self.resource_id.clone())
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        self.resolved_at
            .checked_add(time::Duration::seconds(ttl))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at() <= now
    }

    /// Time left before this verdict expires, zero if already expired.
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> std::time::Duration {
        let left = self.expires_at() - now;
        if left.is_positive() {
            std::time::Duration::try_from(left).unwrap_or_default()
        } else {
            std::time::Duration::ZERO
        }
    }

    /// `grant_path = none` if and only if `decision = deny`.
    pub fn is_consistent(&self) -> bool {
        match self.decision {
            Decision::Allow => self.grant_path != GrantPath::None,
            Decision::Deny => self.grant_path == GrantPath::None,
        }
    }

    /// Same decision reached through the same rule.
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.decision == other.decision && self.grant_path == other.grant_path
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let verdict: Self = rmp_serde::from_slice(bytes)?;
        if !verdict.is_consistent() {
            return Err(CoreError::InconsistentVerdict(format!(
                "{:?} with grant path {}",
                verdict.decision, verdict.grant_path
            )));
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation() -> ResourceRef {
        ResourceRef::generation("g1")
    }

    #[test]
    fn test_allow_and_deny_constructors() {
        let allow =
            AuthorizationVerdict::allow("alice", &generation(), Permission::Read, GrantPath::DirectOwner, 60);
        assert!(allow.is_allowed());
        assert!(allow.is_consistent());

        let deny = AuthorizationVerdict::deny("bob", &generation(), Permission::Delete, 120);
        assert!(!deny.is_allowed());
        assert_eq!(deny.grant_path, GrantPath::None);
        assert!(deny.is_consistent());
    }

    #[test]
    fn test_codec_preserves_verdict() {
        let verdict =
            AuthorizationVerdict::allow("alice", &generation(), Permission::Read, GrantPath::TeamRole, 60);
        let bytes = verdict.encode().unwrap();
        let decoded = AuthorizationVerdict::decode(&bytes).unwrap();
        assert_eq!(decoded, verdict);
    }

    #[test]
    fn test_decode_rejects_allow_without_grant_path() {
        let mut verdict =
            AuthorizationVerdict::allow("alice", &generation(), Permission::Read, GrantPath::TeamRole, 60);
        verdict.grant_path = GrantPath::None;
        let bytes = rmp_serde::to_vec_named(&verdict).unwrap();
        assert!(matches!(
            AuthorizationVerdict::decode(&bytes),
            Err(CoreError::InconsistentVerdict(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(AuthorizationVerdict::decode(b"not msgpack").is_err());
    }

    #[test]
    fn test_expiry() {
        let resolved = time::macros::datetime!(2026-01-01 00:00 UTC);
        let verdict = AuthorizationVerdict::deny("bob", &generation(), Permission::Read, 30)
            .with_resolved_at(resolved);
        assert_eq!(verdict.expires_at(), resolved + time::Duration::seconds(30));
        assert!(!verdict.is_expired_at(resolved + time::Duration::seconds(29)));
        assert!(verdict.is_expired_at(resolved + time::Duration::seconds(30)));
        assert_eq!(
            verdict.remaining_ttl(resolved + time::Duration::seconds(10)),
            std::time::Duration::from_secs(20)
        );
        assert_eq!(
            verdict.remaining_ttl(resolved + time::Duration::seconds(90)),
            std::time::Duration::ZERO
        );
    }
}
