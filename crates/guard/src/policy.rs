//! Route-to-permission policy matching.
//!
//! A static table maps `(method, route pattern)` to the permissions a
//! request must hold. Patterns are path templates where a `:name` segment
//! matches any single path segment (`/modules/:id` matches `/modules/42`).
//!
//! # Fail-open default
//!
//! A route with no matching rule requires the empty permission set — it is
//! public. This is deliberate, specified behavior for *unlisted* routes, not
//! a security guarantee: operators own the completeness of the table, and
//! every protected route must have an entry.

use std::collections::BTreeSet;

use crate::token::IdentityContext;

/// One `(method, pattern) → permissions` rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    method: String,
    segments: Vec<Segment>,
    required: BTreeSet<String>,
}

/// A single path segment of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Matches exactly this text.
    Literal(String),
    /// `:name` — matches any single segment.
    Param,
}

impl PolicyRule {
    /// Creates a rule.
    ///
    /// `method` is matched case-insensitively; `pattern` is a path template
    /// like `/modules/:id/install`.
    #[must_use]
    pub fn new<I, S>(method: impl Into<String>, pattern: &str, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with(':') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_owned())
                }
            })
            .collect();

        Self {
            method: method.into().to_ascii_uppercase(),
            segments,
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }

        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if path_segments.len() != self.segments.len() {
            return false;
        }

        self.segments.iter().zip(&path_segments).all(|(pattern, actual)| match pattern {
            Segment::Literal(text) => text == actual,
            Segment::Param => true,
        })
    }
}

/// The static policy table, loaded at startup.
///
/// First matching rule wins; rules are checked in insertion order, so place
/// more specific patterns first.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    /// Creates an empty table (every route public).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table from rules.
    #[must_use]
    pub fn from_rules(rules: impl IntoIterator<Item = PolicyRule>) -> Self {
        Self { rules: rules.into_iter().collect() }
    }

    /// Adds a rule.
    #[must_use]
    pub fn with_rule<I, S>(mut self, method: impl Into<String>, pattern: &str, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(PolicyRule::new(method, pattern, required));
        self
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the permissions required for `(method, path)`.
    ///
    /// Unlisted routes require the empty set — see the module docs for why
    /// this fail-open default exists.
    #[must_use]
    pub fn required_permissions(&self, method: &str, path: &str) -> BTreeSet<String> {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.required.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if the identity holds every required permission.
    #[must_use]
    pub fn authorize(&self, identity: &IdentityContext, required: &BTreeSet<String>) -> bool {
        identity.has_permissions(required)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::token::{TokenClaims, TokenKind, WILDCARD_PERMISSION};

    fn registry_table() -> PolicyTable {
        PolicyTable::new()
            .with_rule("GET", "/modules/discovery", Vec::<String>::new())
            .with_rule("POST", "/modules/register", ["modules:register"])
            .with_rule("DELETE", "/modules/:id", ["modules:delete"])
            .with_rule("POST", "/modules/:id/install", ["modules:install"])
            .with_rule("GET", "/admin", ["admin:read"])
            .with_rule("POST", "/admin", ["admin:write"])
    }

    fn identity_with(permissions: &[&str]) -> IdentityContext {
        let claims = TokenClaims::new(
            "user-1",
            TokenKind::Principal { session_id: None },
            "modhub-auth",
            Duration::from_secs(3600),
        )
        .with_permissions(permissions.iter().copied());
        IdentityContext::from_claims(claims, false).unwrap()
    }

    #[rstest]
    #[case::exact("POST", "/modules/register", &["modules:register"])]
    #[case::param("DELETE", "/modules/42", &["modules:delete"])]
    #[case::param_with_suffix("POST", "/modules/42/install", &["modules:install"])]
    #[case::method_disambiguates("POST", "/admin", &["admin:write"])]
    fn lookup_matches_rules(
        #[case] method: &str,
        #[case] path: &str,
        #[case] expected: &[&str],
    ) {
        let table = registry_table();
        let required = table.required_permissions(method, path);
        let expected: BTreeSet<String> = expected.iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(required, expected);
    }

    #[test]
    fn explicit_public_route_requires_nothing() {
        let table = registry_table();
        assert!(table.required_permissions("GET", "/modules/discovery").is_empty());
    }

    #[test]
    fn unlisted_route_is_public() {
        let table = registry_table();
        assert!(table.required_permissions("GET", "/health").is_empty());
        assert!(table.required_permissions("PATCH", "/modules/register").is_empty());
    }

    #[test]
    fn param_does_not_match_extra_segments() {
        let table = registry_table();
        // `/modules/:id` has 2 segments; a 3-segment path must not match it
        assert!(table.required_permissions("DELETE", "/modules/42/extra").is_empty());
    }

    #[test]
    fn method_matching_is_case_insensitive() {
        let table = registry_table();
        let required = table.required_permissions("post", "/modules/register");
        assert!(required.contains("modules:register"));
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let table = registry_table();
        let required = table.required_permissions("POST", "/modules/register/");
        assert!(required.contains("modules:register"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = PolicyTable::new()
            .with_rule("GET", "/modules/special", ["modules:special"])
            .with_rule("GET", "/modules/:id", ["modules:read"]);

        assert!(table.required_permissions("GET", "/modules/special").contains("modules:special"));
        assert!(table.required_permissions("GET", "/modules/99").contains("modules:read"));
    }

    #[test]
    fn authorize_requires_superset() {
        let table = registry_table();
        let required = table.required_permissions("POST", "/modules/register");

        assert!(table.authorize(&identity_with(&["modules:register", "extra"]), &required));
        assert!(!table.authorize(&identity_with(&["modules:read"]), &required));
        assert!(!table.authorize(&identity_with(&[]), &required));
    }

    #[test]
    fn wildcard_authorizes_everything() {
        let table = registry_table();
        let required = table.required_permissions("POST", "/admin");
        assert!(table.authorize(&identity_with(&[WILDCARD_PERMISSION]), &required));
    }

    #[test]
    fn empty_required_set_authorizes_anyone() {
        let table = registry_table();
        let required = table.required_permissions("GET", "/modules/discovery");
        assert!(table.authorize(&identity_with(&[]), &required));
    }
}
