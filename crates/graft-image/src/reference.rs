//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use graft_common::{GraftError, GraftResult};

/// Tag applied to references that carry no tag or digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
///
/// References come in three shapes: `name`, `name:tag` and `name@digest`.
/// The name is kept exactly as written, including any registry host and
/// port; the store keys on the canonical rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    name: String,
    kind: RefKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RefKind {
    Bare,
    Tag(String),
    Digest(String),
}

impl Reference {
    /// Parse a reference string.
    ///
    /// A colon only introduces a tag when the text after it contains no
    /// `/`, so `registry:5000/foobar` keeps its port and
    /// `registry:5000/foobar:latest` splits on the second colon.
    pub fn parse(reference: &str) -> GraftResult<Self> {
        let reference = reference.trim();
        let invalid = || GraftError::InvalidReference {
            reference: reference.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid());
        }

        if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            let digest = &digest[1..];
            if name.is_empty() || digest.is_empty() {
                return Err(invalid());
            }
            return Ok(Self {
                name: name.to_string(),
                kind: RefKind::Digest(digest.to_string()),
            });
        }

        if let Some(idx) = reference.rfind(':') {
            let candidate = &reference[idx + 1..];
            if !candidate.contains('/') {
                let name = &reference[..idx];
                if name.is_empty() || candidate.is_empty() {
                    return Err(invalid());
                }
                return Ok(Self {
                    name: name.to_string(),
                    kind: RefKind::Tag(candidate.to_string()),
                });
            }
        }

        Ok(Self {
            name: reference.to_string(),
            kind: RefKind::Bare,
        })
    }

    /// A reference consisting of a name alone.
    pub fn with_name(name: &str) -> GraftResult<Self> {
        if name.is_empty() || name.contains('@') {
            return Err(GraftError::InvalidReference {
                reference: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            kind: RefKind::Bare,
        })
    }

    /// The repository name component.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag, if this reference carries one.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match &self.kind {
            RefKind::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// The digest, if this reference carries one.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        match &self.kind {
            RefKind::Digest(digest) => Some(digest),
            _ => None,
        }
    }

    /// Canonical rendering, used as the store key.
    #[must_use]
    pub fn canonical(&self) -> String {
        match &self.kind {
            RefKind::Bare => self.name.clone(),
            RefKind::Tag(tag) => format!("{}:{tag}", self.name),
            RefKind::Digest(digest) => format!("{}@{digest}", self.name),
        }
    }

    /// The same reference with a bare name normalised to `:latest`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        match self.kind {
            RefKind::Bare => Self {
                name: self.name.clone(),
                kind: RefKind::Tag(DEFAULT_TAG.to_string()),
            },
            _ => self.clone(),
        }
    }
}

impl FromStr for Reference {
    type Err = GraftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_name() {
        let r = Reference::parse("busybox").unwrap();
        assert_eq!(r.name(), "busybox");
        assert_eq!(r.tag(), None);
        assert_eq!(r.canonical(), "busybox");
        assert_eq!(r.normalized().canonical(), "busybox:latest");
    }

    #[test]
    fn parse_with_tag() {
        let r = Reference::parse("jess/hollywood:latest").unwrap();
        assert_eq!(r.name(), "jess/hollywood");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.canonical(), "jess/hollywood:latest");
    }

    #[test]
    fn parse_with_digest() {
        let r = Reference::parse("registry@sha256:deadbeef").unwrap();
        assert_eq!(r.name(), "registry");
        assert_eq!(r.digest(), Some("sha256:deadbeef"));
        assert_eq!(r.canonical(), "registry@sha256:deadbeef");
        // Digests are already canonical; normalisation leaves them alone.
        assert_eq!(r.normalized(), r);
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = Reference::parse("registry:5000/foobar").unwrap();
        assert_eq!(r.name(), "registry:5000/foobar");
        assert_eq!(r.tag(), None);

        let r = Reference::parse("registry:5000/foobar:master").unwrap();
        assert_eq!(r.name(), "registry:5000/foobar");
        assert_eq!(r.tag(), Some("master"));
    }

    #[test]
    fn invalid_references() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("name@").is_err());
        assert!(Reference::parse(":justatag").is_err());
        assert!(Reference::with_name("busybox@sha256:ff").is_err());
    }
}
