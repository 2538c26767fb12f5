//! Method and path routing for a single application.
//!
//! Patterns are split on `/` into segments:
//! - `users` matches the literal segment,
//! - `:id` matches any one non-empty segment and binds it as `id`,
//! - `*rest` (last segment only) matches the remainder of the path, possibly empty.
//!
//! When several patterns match a path the one with the most literal segments wins;
//! ties go to the pattern registered first.

use crate::error::ConfigError;

/// Path parameters bound by a matched pattern, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Returns the value bound to `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
    CatchAll(String),
}

/// A parsed URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a pattern such as `/users/:id` or `/static/*path`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidPattern {
            pattern: raw.to_string(),
            reason,
        };

        let rest = raw.strip_prefix('/').ok_or(invalid("must start with '/'"))?;
        let parts: Vec<&str> = rest.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(invalid("parameter needs a name"));
                }
                Segment::Param(name.to_string())
            } else if let Some(name) = part.strip_prefix('*') {
                if name.is_empty() {
                    return Err(invalid("catch-all needs a name"));
                }
                if i + 1 != parts.len() {
                    return Err(invalid("catch-all must be the last segment"));
                }
                Segment::CatchAll(name.to_string())
            } else {
                Segment::Static(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Static(_)))
            .count()
    }

    /// Matches `path` against the pattern, returning bound parameters on success.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let rest = path.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let mut params = Vec::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::CatchAll(name) => {
                    params.push((name.clone(), tail_after(rest, i).to_string()));
                    return Some(Params(params));
                }
                Segment::Static(literal) => {
                    if parts.next()? != literal {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.next()?;
                    if value.is_empty() {
                        return None;
                    }
                    params.push((name.clone(), value.to_string()));
                }
            }
        }

        if parts.next().is_some() {
            return None;
        }
        Some(Params(params))
    }
}

/// The remainder of `rest` after skipping `count` `/`-separated segments.
fn tail_after(rest: &str, count: usize) -> &str {
    let mut tail = rest;
    for _ in 0..count {
        match tail.find('/') {
            Some(idx) => tail = &tail[idx + 1..],
            None => return "",
        }
    }
    tail
}

/// Normalizes an HTTP method name to upper case, rejecting non-token input.
pub fn normalize_method(method: &str) -> Result<String, ConfigError> {
    const TOKEN_SYMBOLS: &str = "!#$%&'*+-.^_`|~";

    let valid = !method.is_empty()
        && method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || TOKEN_SYMBOLS.contains(c));
    if !valid {
        return Err(ConfigError::InvalidMethod(method.to_string()));
    }
    Ok(method.to_ascii_uppercase())
}

#[derive(Debug, Clone)]
struct Route<H> {
    method: String,
    pattern: Pattern,
    handler: H,
}

/// Result of resolving a request against a [`Router`].
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<'a, H> {
    /// A route matched both the method and the path.
    Matched {
        /// Handler bound at registration.
        handler: &'a H,
        /// Parameters bound by the pattern.
        params: Params,
    },
    /// No pattern under any method matches the path.
    NoRoute,
    /// The path matches, but only under other methods.
    MethodNotAllowed {
        /// Methods registered for matching patterns, sorted and deduplicated.
        allowed: Vec<String>,
    },
}

/// Maps `(method, pattern)` pairs to handlers.
#[derive(Debug, Clone)]
pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> Router<H> {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` and `pattern`.
    ///
    /// The method is upper-cased. Registering the same method and pattern twice is an
    /// error.
    pub fn handle(&mut self, method: &str, pattern: &str, handler: H) -> Result<(), ConfigError> {
        let method = normalize_method(method)?;
        let pattern = Pattern::parse(pattern)?;

        if self
            .routes
            .iter()
            .any(|r| r.method == method && r.pattern == pattern)
        {
            return Err(ConfigError::DuplicateRoute {
                method,
                pattern: pattern.raw,
            });
        }

        self.routes.push(Route {
            method,
            pattern,
            handler,
        });
        Ok(())
    }

    /// Shorthand for `handle("GET", ..)`.
    pub fn get(&mut self, pattern: &str, handler: H) -> Result<(), ConfigError> {
        self.handle("GET", pattern, handler)
    }

    /// Resolves a request method and path.
    pub fn resolve(&self, method: &str, path: &str) -> Resolution<'_, H> {
        let mut best: Option<(usize, &Route<H>, Params)> = None;
        let mut allowed: Vec<String> = Vec::new();

        for route in &self.routes {
            let Some(params) = route.pattern.matches(path) else {
                continue;
            };

            if route.method != method {
                allowed.push(route.method.clone());
                continue;
            }

            let score = route.pattern.specificity();
            let is_better = match &best {
                None => true,
                Some((best_score, _, _)) => score > *best_score,
            };
            if is_better {
                best = Some((score, route, params));
            }
        }

        match best {
            Some((_, route, params)) => Resolution::Matched {
                handler: &route.handler,
                params,
            },
            None if allowed.is_empty() => Resolution::NoRoute,
            None => {
                allowed.sort();
                allowed.dedup();
                Resolution::MethodNotAllowed { allowed }
            }
        }
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router(routes: &[(&str, &str, u32)]) -> Router<u32> {
        let mut router = Router::new();
        for (method, pattern, id) in routes {
            router.handle(method, pattern, *id).unwrap();
        }
        router
    }

    fn matched(resolution: Resolution<'_, u32>) -> (u32, Params) {
        match resolution {
            Resolution::Matched { handler, params } => (*handler, params),
            other => panic!("expected a match, got {:?}", other),
        }
    }

    #[test]
    fn test_static_route_matches() {
        let r = router(&[("GET", "/health", 1)]);
        let (id, params) = matched(r.resolve("GET", "/health"));
        assert_eq!(id, 1);
        assert_eq!(params, Params::default());
    }

    #[test]
    fn test_named_param_is_bound() {
        let r = router(&[("GET", "/users/:id", 7)]);
        let (id, params) = matched(r.resolve("GET", "/users/42"));
        assert_eq!(id, 7);
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("missing"), None);
    }

    #[test]
    fn test_param_requires_non_empty_segment() {
        let r = router(&[("GET", "/users/:id", 1)]);
        assert_eq!(r.resolve("GET", "/users/"), Resolution::NoRoute);
        assert_eq!(r.resolve("GET", "/users"), Resolution::NoRoute);
    }

    #[test]
    fn test_extra_segments_do_not_match() {
        let r = router(&[("GET", "/users/:id", 1)]);
        assert_eq!(r.resolve("GET", "/users/42/posts"), Resolution::NoRoute);
        assert_eq!(r.resolve("GET", "/users/42/"), Resolution::NoRoute);
    }

    #[test]
    fn test_catch_all_binds_remainder() {
        let r = router(&[("GET", "/static/*path", 3)]);
        let (_, params) = matched(r.resolve("GET", "/static/css/site.css"));
        assert_eq!(params.get("path"), Some("css/site.css"));

        let (_, params) = matched(r.resolve("GET", "/static/"));
        assert_eq!(params.get("path"), Some(""));
    }

    #[test]
    fn test_catch_all_after_param() {
        let r = router(&[("GET", "/repos/:owner/*rest", 3)]);
        let (_, params) = matched(r.resolve("GET", "/repos/me/a/b"));
        assert_eq!(params.get("owner"), Some("me"));
        assert_eq!(params.get("rest"), Some("a/b"));
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let r = router(&[("GET", "/items/:id", 1), ("delete", "/items/:id", 2)]);
        assert_eq!(
            r.resolve("POST", "/items/9"),
            Resolution::MethodNotAllowed {
                allowed: vec!["DELETE".to_string(), "GET".to_string()]
            }
        );
    }

    #[test]
    fn test_no_route_when_nothing_matches() {
        let r = router(&[("GET", "/items", 1)]);
        assert_eq!(r.resolve("GET", "/other"), Resolution::NoRoute);
        assert_eq!(r.resolve("POST", "/other"), Resolution::NoRoute);
    }

    #[test]
    fn test_method_is_normalized() {
        let r = router(&[("post", "/items", 1)]);
        assert_eq!(matched(r.resolve("POST", "/items")).0, 1);
        assert_eq!(
            r.resolve("GET", "/items"),
            Resolution::MethodNotAllowed {
                allowed: vec!["POST".to_string()]
            }
        );
    }

    #[test]
    fn test_request_method_is_case_sensitive() {
        let r = router(&[("GET", "/items", 1)]);
        assert_eq!(
            r.resolve("get", "/items"),
            Resolution::MethodNotAllowed {
                allowed: vec!["GET".to_string()]
            }
        );
    }

    #[test]
    fn test_static_beats_param() {
        let r = router(&[("GET", "/users/:id", 1), ("GET", "/users/me", 2)]);
        assert_eq!(matched(r.resolve("GET", "/users/me")).0, 2);
        assert_eq!(matched(r.resolve("GET", "/users/5")).0, 1);
    }

    #[test]
    fn test_first_registered_wins_ties() {
        let r = router(&[("GET", "/a/:x", 1), ("GET", "/a/:y", 2)]);
        assert_eq!(matched(r.resolve("GET", "/a/b")).0, 1);
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut r = Router::new();
        r.handle("GET", "/a", 1).unwrap();
        let err = r.handle("get", "/a", 2).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateRoute { .. }));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for pattern in ["users", "/a/:", "/a/*", "/a/*rest/b"] {
            assert!(
                Pattern::parse(pattern).is_err(),
                "{pattern} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_methods_rejected() {
        assert!(normalize_method("").is_err());
        assert!(normalize_method("GE T").is_err());
        assert_eq!(normalize_method("patch").unwrap(), "PATCH");
    }

    #[test]
    fn test_root_pattern() {
        let r = router(&[("GET", "/", 1)]);
        assert_eq!(matched(r.resolve("GET", "/")).0, 1);
        assert_eq!(r.resolve("GET", "/x"), Resolution::NoRoute);
    }

    proptest! {
        #[test]
        fn prop_registered_route_resolves(
            segments in proptest::collection::vec("[a-z]{1,8}", 1..5),
            value in "[a-zA-Z0-9]{1,12}",
        ) {
            let pattern = format!("/{}/:param", segments.join("/"));
            let path = format!("/{}/{}", segments.join("/"), value);

            let mut r = Router::new();
            r.handle("GET", &pattern, 1u32).unwrap();

            let (id, params) = matched(r.resolve("GET", &path));
            prop_assert_eq!(id, 1);
            prop_assert_eq!(params.get("param"), Some(value.as_str()));

            let is_method_miss = matches!(
                r.resolve("PUT", &path),
                Resolution::MethodNotAllowed { .. }
            );
            prop_assert!(is_method_miss);
        }
    }
}
