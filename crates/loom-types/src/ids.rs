//! Typed identifiers for spaces, branches, events, spans, sessions, and principals.
//!
//! Every ID except `ObjectId` wraps a UUIDv7 (time-ordered, globally unique).
//! Ordering on the wrapped UUID is byte-lexical, which is also the lexical order
//! of the hex form; merge tie-breaking relies on that. The `short()` form
//! (first 8 hex chars) is for human-facing output only, never a lookup key.
//!
//! `ObjectId` is caller-named: objects are addressed by whatever key the
//! activity layer chose (`"doc:readme"`, `"chat:general"`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A space identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(uuid::Uuid);

/// A branch (timeline) identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(uuid::Uuid);

/// An event identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(uuid::Uuid);

/// A connection span identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(uuid::Uuid);

/// An uplink session identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

/// Who wrote or read something. UUIDv5 for [`PrincipalId::system`].
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(uuid::Uuid);

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// Eight hex characters for logs and CLI output.
            pub fn short(&self) -> String {
                let mut hex = self.to_hex();
                hex.truncate(8);
                hex
            }

            /// Hyphen-free hex, 32 characters. Prefix matching works on this form.
            pub fn to_hex(&self) -> String {
                self.0.simple().to_string()
            }

            /// Sqlite stores ids as 16-byte blobs.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(bytes))
            }

            /// Accepts hyphenated and plain hex.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::try_parse(s).map(Self)
            }

            /// `label` when it is set and non-empty, otherwise [`short`](Self::short).
            pub fn display_or(&self, label: Option<&str>) -> String {
                label
                    .filter(|l| !l.is_empty())
                    .map_or_else(|| self.short(), str::to_owned)
            }

            pub fn matches_hex_prefix(&self, prefix: &str) -> bool {
                !prefix.is_empty() && self.to_hex().starts_with(&prefix.to_ascii_lowercase())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(raw: uuid::Uuid) -> Self {
                Self(raw)
            }
        }

        impl std::str::FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, uuid::Error> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($name)?;
                write!(f, "({})", self.short())
            }
        }
    };
}

impl_typed_id!(SpaceId, "SpaceId");
impl_typed_id!(BranchId, "BranchId");
impl_typed_id!(EventId, "EventId");
impl_typed_id!(SpanId, "SpanId");
impl_typed_id!(SessionId, "SessionId");
impl_typed_id!(PrincipalId, "PrincipalId");

/// UUIDv5 namespace for well-known principals.
const LOOM_PRINCIPAL_NS: uuid::Uuid = uuid::uuid!("3f6b1a2e-94c7-4d0b-8e21-5a7c9d4f0b18");

impl PrincipalId {
    /// Author of kernel-written events: branch roots, forks, merges. The
    /// same id in every process.
    pub fn system() -> Self {
        Self(uuid::Uuid::new_v5(&LOOM_PRINCIPAL_NS, b"system"))
    }
}

/// Caller-named object key, scoped to a space.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type prefix before the first `:` (`"doc:readme"` → `"doc"`).
    ///
    /// Reducers are registered per prefix.
    pub fn type_prefix(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// Why a branch query did not name exactly one branch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("no branch matches '{0}'")]
    NoMatch(String),
    #[error("'{prefix}' is ambiguous between {candidates:?}")]
    Ambiguous { prefix: String, candidates: Vec<String> },
}

/// Find the branch a user meant by `query`: an exact label wins, then a
/// label that starts with it, then an id whose hex starts with it. Each
/// fallback must be unique.
pub fn resolve_branch_prefix<'a>(
    branches: impl Iterator<Item = (BranchId, Option<&'a str>)>,
    query: &str,
) -> Result<BranchId, PrefixError> {
    let branches: Vec<(BranchId, Option<&str>)> = branches.collect();

    if let Some((id, _)) = branches.iter().find(|(_, label)| *label == Some(query)) {
        return Ok(*id);
    }

    let by_label: Vec<(BranchId, String)> = branches
        .iter()
        .filter_map(|(id, label)| label.filter(|l| l.starts_with(query)).map(|l| (*id, l.to_string())))
        .collect();
    if !by_label.is_empty() {
        return unique(query, by_label);
    }

    let by_hex = branches
        .iter()
        .filter(|(id, _)| id.matches_hex_prefix(query))
        .map(|(id, _)| (*id, id.short()))
        .collect();
    unique(query, by_hex)
}

fn unique(query: &str, mut matches: Vec<(BranchId, String)>) -> Result<BranchId, PrefixError> {
    match matches.len() {
        0 => Err(PrefixError::NoMatch(query.to_string())),
        1 => Ok(matches.remove(0).0),
        _ => Err(PrefixError::Ambiguous {
            prefix: query.to_string(),
            candidates: matches.into_iter().map(|(_, name)| name).collect(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order_and_by_hex() {
        let made: Vec<EventId> = (0..16).map(|_| EventId::new()).collect();
        assert!(made.windows(2).all(|w| w[0] <= w[1]));

        let mut by_hex = made.clone();
        by_hex.reverse();
        by_hex.sort_by_key(|id| id.to_hex());
        assert_eq!(by_hex, made);
    }

    #[test]
    fn parse_accepts_display_and_hex() {
        let id = SpanId::new();
        assert_eq!(SpanId::parse(&id.to_hex()).unwrap(), id);
        assert_eq!(id.to_string().parse::<SpanId>().unwrap(), id);
        assert!(SpanId::parse("span-1").is_err());
    }

    #[test]
    fn short_forms() {
        let id = BranchId::new();
        assert_eq!(format!("{id:?}"), format!("BranchId({})", id.short()));
        assert_eq!(id.display_or(Some("main")), "main");
        assert_eq!(id.display_or(Some("")), id.short());
        assert!(id.matches_hex_prefix(&id.short().to_uppercase()));
        assert!(!id.matches_hex_prefix(""));
    }

    #[test]
    fn system_principal_is_stable() {
        assert_eq!(PrincipalId::system(), PrincipalId::system());
        assert_ne!(PrincipalId::system(), PrincipalId::new());
    }

    #[test]
    fn object_type_prefix() {
        assert_eq!(ObjectId::from("doc:readme").type_prefix(), "doc");
        assert_eq!(ObjectId::from("plain").type_prefix(), "plain");
    }

    #[test]
    fn ids_survive_postcard() {
        let id = EventId::new();
        let bytes = postcard::to_stdvec(&id).unwrap();
        assert_eq!(postcard::from_bytes::<EventId>(&bytes).unwrap(), id);
    }

    #[test]
    fn branch_queries() {
        let (main, f1, f2) = (BranchId::new(), BranchId::new(), BranchId::new());
        let branches = || vec![(main, Some("main")), (f1, Some("fork-1")), (f2, Some("fork-2"))].into_iter();

        assert_eq!(resolve_branch_prefix(branches(), "fork-2"), Ok(f2));
        assert_eq!(resolve_branch_prefix(branches(), "ma"), Ok(main));
        assert!(matches!(resolve_branch_prefix(branches(), "fork"), Err(PrefixError::Ambiguous { .. })));
        assert_eq!(resolve_branch_prefix(branches(), &f1.to_hex()), Ok(f1));
        assert_eq!(resolve_branch_prefix(branches(), "zzz"), Err(PrefixError::NoMatch("zzz".into())));
    }
}
