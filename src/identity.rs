//! Deterministic node identity.
//!
//! A node's identity is a pure function of its structural path: the owning
//! partition, the nearest enclosing *named* construct, the construct kind and
//! its declared name. Position and insertion order never participate, so
//! adding unrelated code to a file leaves every existing identity untouched.
//!
//! When two distinct constructs resolve to the same path (e.g. two anonymous
//! callbacks named `<anonymous>` in the same function), a content-derived
//! disambiguator is appended. An ordinal is appended only among constructs
//! that share both the path and the disambiguator, and it is scoped to one
//! [`IdentityResolver`]; there is no process-wide counter.
//!
//! ```text
//! src/app.js->handler->FUNCTION-><anonymous>#3f9a01c2[1]
//! └─partition└─scope   └─kind    └─name      └─content └─ordinal
//! ```

use std::collections::HashMap;

/// Separator between structural path components.
const PATH_SEP: &str = "->";

/// Scope used for top-level constructs (no enclosing named construct).
const GLOBAL_SCOPE: &str = "global";

/// Derive the u128 storage id from a semantic id string.
///
/// `id = first 16 bytes (LE) of BLAKE3(semantic_id)`.
pub fn id_from_semantic(semantic_id: &str) -> u128 {
    let hash = blake3::hash(semantic_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[0..16]);
    u128::from_le_bytes(bytes)
}

/// Content fingerprint used for no-op detection and disambiguation.
///
/// Never returns 0, which is reserved for "not computed".
pub fn content_fingerprint(content: &[u8]) -> u64 {
    let hash = blake3::hash(content);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes).max(1)
}

/// Structural location of a construct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralPath {
    partition: String,
    scope: Option<String>,
    kind: String,
    name: String,
}

impl StructuralPath {
    pub fn new(partition: &str, kind: &str, name: &str) -> Self {
        Self {
            partition: partition.to_string(),
            scope: None,
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// Set the nearest enclosing named construct.
    pub fn within(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Render the undisambiguated semantic id.
    pub fn render(&self) -> String {
        let scope = self.scope.as_deref().unwrap_or(GLOBAL_SCOPE);
        [self.partition.as_str(), scope, self.kind.as_str(), self.name.as_str()].join(PATH_SEP)
    }

    /// Semantic id for a construct known to be unique in its scope.
    pub fn semantic_id(&self) -> String {
        self.render()
    }

    /// Storage id for a construct known to be unique in its scope.
    pub fn id(&self) -> u128 {
        id_from_semantic(&self.render())
    }
}

/// A resolved identity: the semantic id string and its derived u128.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub semantic_id: String,
    pub id: u128,
}

/// Collects the constructs of one analysis scope (typically one partition)
/// and assigns collision-free identities.
///
/// Resolution depends only on the *set* of registered constructs and, for
/// exact duplicates, their relative order. Unique paths keep their plain
/// rendering regardless of what else is registered.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    entries: Vec<(String, u64)>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a construct. Returns its handle (index into the result of
    /// [`resolve`](Self::resolve)).
    pub fn add(&mut self, path: &StructuralPath, content: &[u8]) -> usize {
        self.entries.push((path.render(), content_fingerprint(content)));
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assign identities to every registered construct, in registration order.
    pub fn resolve(self) -> Vec<ResolvedIdentity> {
        let mut path_counts: HashMap<&str, usize> = HashMap::new();
        let mut exact_counts: HashMap<(&str, u64), usize> = HashMap::new();
        for (path, fp) in &self.entries {
            *path_counts.entry(path.as_str()).or_default() += 1;
            *exact_counts.entry((path.as_str(), *fp)).or_default() += 1;
        }

        let mut ordinals: HashMap<(&str, u64), usize> = HashMap::new();
        self.entries
            .iter()
            .map(|(path, fp)| {
                let semantic_id = if path_counts[path.as_str()] == 1 {
                    path.clone()
                } else {
                    let key = (path.as_str(), *fp);
                    let disambiguated = format!("{}#{:016x}", path, fp);
                    if exact_counts[&key] == 1 {
                        disambiguated
                    } else {
                        let ordinal = ordinals.entry(key).or_default();
                        let id = format!("{}[{}]", disambiguated, ordinal);
                        *ordinal += 1;
                        id
                    }
                };
                let id = id_from_semantic(&semantic_id);
                ResolvedIdentity { semantic_id, id }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        assert_eq!(id_from_semantic("a->global->FUNCTION->f"), id_from_semantic("a->global->FUNCTION->f"));
        assert_ne!(id_from_semantic("a->global->FUNCTION->f"), id_from_semantic("a->global->FUNCTION->g"));
    }

    #[test]
    fn test_fingerprint_never_zero() {
        for i in 0u32..1000 {
            assert_ne!(content_fingerprint(&i.to_le_bytes()), 0);
        }
    }

    #[test]
    fn test_render_with_and_without_scope() {
        let top = StructuralPath::new("src/a.js", "FUNCTION", "main");
        assert_eq!(top.render(), "src/a.js->global->FUNCTION->main");

        let nested = StructuralPath::new("src/a.js", "VARIABLE", "x").within("main");
        assert_eq!(nested.render(), "src/a.js->main->VARIABLE->x");
    }

    #[test]
    fn test_unique_paths_are_plain() {
        let mut r = IdentityResolver::new();
        r.add(&StructuralPath::new("f.js", "FUNCTION", "a"), b"function a() {}");
        r.add(&StructuralPath::new("f.js", "FUNCTION", "b"), b"function b() {}");
        let ids = r.resolve();
        assert_eq!(ids[0].semantic_id, "f.js->global->FUNCTION->a");
        assert_eq!(ids[1].semantic_id, "f.js->global->FUNCTION->b");
        assert_eq!(ids[0].id, id_from_semantic(&ids[0].semantic_id));
    }

    #[test]
    fn test_unrelated_insert_does_not_perturb() {
        let a = StructuralPath::new("f.js", "FUNCTION", "a");
        let b = StructuralPath::new("f.js", "FUNCTION", "b");

        let mut before = IdentityResolver::new();
        before.add(&a, b"A");
        let before = before.resolve();

        let mut after = IdentityResolver::new();
        after.add(&b, b"B"); // inserted ahead of `a`
        after.add(&a, b"A");
        let after = after.resolve();

        assert_eq!(before[0], after[1]);
    }

    #[test]
    fn test_collision_uses_content_disambiguator() {
        let anon = StructuralPath::new("f.js", "FUNCTION", "<anonymous>").within("main");
        let mut r = IdentityResolver::new();
        r.add(&anon, b"() => 1");
        r.add(&anon, b"() => 2");
        let ids = r.resolve();
        assert_ne!(ids[0].id, ids[1].id);
        assert!(ids[0].semantic_id.contains('#'));
        assert!(!ids[0].semantic_id.contains('['));
    }

    #[test]
    fn test_disambiguator_keeps_every_fingerprint_bit() {
        let path = StructuralPath::new("f.js", "FUNCTION", "<anonymous>").render();
        let mut r = IdentityResolver::new();
        // Same high half, different low half.
        r.entries.push((path.clone(), 0x1234_5678_0000_0001));
        r.entries.push((path.clone(), 0x1234_5678_0000_0002));
        let ids = r.resolve();
        assert_eq!(ids[0].semantic_id, format!("{}#1234567800000001", path));
        assert_eq!(ids[1].semantic_id, format!("{}#1234567800000002", path));
        assert_ne!(ids[0].id, ids[1].id);
    }

    #[test]
    fn test_disambiguator_is_order_independent() {
        let anon = StructuralPath::new("f.js", "FUNCTION", "<anonymous>");
        let mut r1 = IdentityResolver::new();
        r1.add(&anon, b"x");
        r1.add(&anon, b"y");
        let mut r2 = IdentityResolver::new();
        r2.add(&anon, b"y");
        r2.add(&anon, b"x");
        let a = r1.resolve();
        let b = r2.resolve();
        assert_eq!(a[0], b[1]);
        assert_eq!(a[1], b[0]);
    }

    #[test]
    fn test_identical_content_falls_back_to_ordinal() {
        let anon = StructuralPath::new("f.js", "CALL", "log");
        let mut r = IdentityResolver::new();
        r.add(&anon, b"log()");
        r.add(&anon, b"log()");
        r.add(&anon, b"log(1)");
        let ids = r.resolve();
        assert!(ids[0].semantic_id.ends_with("[0]"));
        assert!(ids[1].semantic_id.ends_with("[1]"));
        assert!(!ids[2].semantic_id.contains('['));
        assert_ne!(ids[0].id, ids[1].id);
    }
}
