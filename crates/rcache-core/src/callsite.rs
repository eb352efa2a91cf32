//! Caller-supplied call-site identity.
//!
//! A [`CallSite`] is the explicit stand-in for stack introspection: the
//! test harness builds one per test (the boundary frame) and code under
//! test extends it with [`CallSite::enter`] as calls nest. The signature of
//! a site is the `module:function` path from the innermost frame back out
//! to the nearest boundary, so it names "this test, this call path" and
//! nothing above it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One `(module, function)` step of a call path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub module: String,
    pub function: String,
    /// Signature walks stop at (and include) the innermost boundary frame.
    pub boundary: bool,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

/// An ordered call path, outermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    frames: Vec<Frame>,
}

impl CallSite {
    /// A site rooted at a test entry point, which acts as the boundary.
    #[must_use]
    pub fn suite(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            frames: vec![Frame {
                module: module.into(),
                function: function.into(),
                boundary: true,
            }],
        }
    }

    /// A copy of this site with one more (non-boundary) frame nested inside.
    #[must_use]
    pub fn enter(&self, module: impl Into<String>, function: impl Into<String>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame {
            module: module.into(),
            function: function.into(),
            boundary: false,
        });
        Self { frames }
    }

    /// A copy with a nested boundary frame, e.g. a sub-test.
    #[must_use]
    pub fn child(&self, module: impl Into<String>, function: impl Into<String>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame {
            module: module.into(),
            function: function.into(),
            boundary: true,
        });
        Self { frames }
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The innermost boundary frame, if any.
    #[must_use]
    pub fn boundary(&self) -> Option<&Frame> {
        self.frames.iter().rev().find(|frame| frame.boundary)
    }

    /// Path from the innermost frame outward, up to and including the
    /// innermost boundary frame.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut parts = Vec::new();
        for frame in self.frames.iter().rev() {
            parts.push(frame.to_string());
            if frame.boundary {
                break;
            }
        }
        parts.join("<")
    }

    /// Signature of a call to `callable` made from this site.
    #[must_use]
    pub fn signature_for(&self, callable: &str) -> String {
        format!("{callable}<{}", self.signature())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_stops_at_innermost_boundary() {
        let site = CallSite::suite("tests.api", "test_lookup")
            .enter("api.client", "fetch")
            .child("tests.api", "subtest")
            .enter("api.client", "retry");
        assert_eq!(site.signature(), "api.client:retry<tests.api:subtest");
        assert_eq!(
            site.boundary().map(|f| f.function.as_str()),
            Some("subtest")
        );
    }

    #[test]
    fn test_signature_for_prefixes_callable() {
        let site = CallSite::suite("tests.api", "test_lookup").enter("api.client", "fetch");
        assert_eq!(
            site.signature_for("find"),
            "find<api.client:fetch<tests.api:test_lookup"
        );
    }

    #[test]
    fn test_distinct_paths_have_distinct_signatures() {
        let root = CallSite::suite("m", "t");
        assert_ne!(
            root.enter("a", "f").signature(),
            root.enter("b", "f").signature()
        );
        assert_eq!(CallSite::default().signature(), "");
    }
}
