//! Path routing: template patterns with named segments.
//!
//! Resource descriptors are registered under templates like
//! `"post/:id"`. A template compiles into a sequence of segment
//! matchers with named captures; `resolve` walks the registration
//! order and returns the first descriptor whose pattern matches the
//! full path, together with the captured parameters.
//!
//! Two templates that differ only in parameter names (`"post/:id"` vs
//! `"post/:key"`) address the same paths, so registering the second is
//! a conflict.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handler::ResourceHandler;

/// Sentinel path that matches no descriptor.
///
/// The orchestrator special-cases this path with inert, always-safe
/// state, metastate, and draft values; it never reaches the router.
pub const DEADEND: &str = "#deadend";

/// One compiled segment of a path template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Must match this text exactly.
    Literal(String),
    /// Matches any non-empty segment, capturing it under the name.
    Param(String),
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a template such as `"post/:id"`.
    ///
    /// A leading slash is ignored. Segments beginning with `:` become
    /// named captures; everything else matches literally.
    pub fn compile(template: &str) -> Self {
        let raw = template.trim_start_matches('/').to_string();
        let segments = raw
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(seg.to_string()),
            })
            .collect();
        Self { raw, segments }
    }

    /// The template text this pattern was compiled from.
    pub fn template(&self) -> &str {
        &self.raw
    }

    /// Match a full path, returning captured parameters on success.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let path = path.trim_start_matches('/');
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(text) => {
                    if text != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(PathParams(params))
    }

    /// True if the two patterns address the same set of paths
    /// (parameter names are ignored).
    fn shape_eq(&self, other: &PathPattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| match (a, b) {
                    (Segment::Literal(x), Segment::Literal(y)) => x == y,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Parameters captured from a matched path.
#[derive(Debug, Clone, Default)]
pub struct PathParams(HashMap<String, String>);

impl PathParams {
    /// Look up a captured segment by its template name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the pattern had no named segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A registered resource descriptor: name, compiled pattern, and the
/// backend handler implementation.
#[derive(Clone)]
pub struct Descriptor {
    pub name: String,
    pub pattern: PathPattern,
    pub handler: Arc<dyn ResourceHandler>,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, template: &str, handler: Arc<dyn ResourceHandler>) -> Self {
        Self {
            name: name.into(),
            pattern: PathPattern::compile(template),
            handler,
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.name)
            .field("pattern", &self.pattern.raw)
            .field("readonly", &self.handler.readonly())
            .finish()
    }
}

/// Descriptor table with first-match resolution.
#[derive(Default)]
pub struct Router {
    descriptors: Vec<Descriptor>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under a path template.
    ///
    /// Fails with [`Error::Conflict`] if an equivalent pattern is
    /// already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        template: &str,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        self.insert(Descriptor::new(name, template, handler))
    }

    /// Register an already-built descriptor.
    pub fn insert(&mut self, descriptor: Descriptor) -> Result<()> {
        if let Some(existing) = self
            .descriptors
            .iter()
            .find(|d| d.pattern.shape_eq(&descriptor.pattern))
        {
            return Err(Error::Conflict {
                name: descriptor.name,
                pattern: descriptor.pattern.raw,
                existing: format!("{} @ {}", existing.name, existing.pattern),
            });
        }

        tracing::debug!(name = %descriptor.name, pattern = %descriptor.pattern, "Registered resource descriptor");
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Resolve a path to its descriptor and captured parameters.
    ///
    /// Resolution is deterministic and pure: registration order decides
    /// ties, and the same path always yields the same descriptor.
    pub fn resolve(&self, path: &str) -> Result<(Descriptor, PathParams)> {
        self.descriptors
            .iter()
            .find_map(|d| d.pattern.matches(path).map(|p| (d.clone(), p)))
            .ok_or_else(|| Error::NotFound {
                path: path.to_string(),
            })
    }
}
