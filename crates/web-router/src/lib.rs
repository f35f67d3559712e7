//! Web selector (component C5): maps `(host_pattern, path_prefix)` to a
//! service. Longest path-prefix wins; among equal-length prefixes, an exact
//! host beats a wildcard pattern, which beats the `null`/any-host entry.

#[macro_use]
extern crate tracing;

/// How a registered route's host must relate to an incoming request's `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Matches only this exact host.
    Exact(String),
    /// Matches subdomain wildcards as in TLS wildcard certificates, e.g. `*.example.com`.
    Wildcard(String),
    /// Matches any host (the `null` host pattern of SPEC_FULL.md §4.5).
    Any,
}

impl HostPattern {
    fn specificity(&self) -> u8 {
        match self {
            HostPattern::Exact(_) => 2,
            HostPattern::Wildcard(_) => 1,
            HostPattern::Any => 0,
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(expected) => expected == host,
            HostPattern::Any => true,
            HostPattern::Wildcard(pattern) => {
                let mut expected_it = pattern.rsplit('.');
                let mut actual_it = host.rsplit('.');
                loop {
                    match (expected_it.next(), actual_it.next()) {
                        (Some(expected), Some(actual)) if expected == actual => {}
                        (Some("*"), Some(_)) => {}
                        (None, None) => return true,
                        _ => return false,
                    }
                }
            }
        }
    }
}

struct Route<S> {
    host: HostPattern,
    path_prefix: String,
    service: S,
}

/// Host+path dispatch table. `S` is whatever a caller wants routed to — a
/// transport handle, an axum `Router`, a boxed handler, etc.
pub struct WebSelector<S> {
    routes: Vec<Route<S>>,
    not_found: S,
}

impl<S> WebSelector<S> {
    pub fn new(not_found: S) -> Self {
        Self {
            routes: Vec::new(),
            not_found,
        }
    }

    /// Registers (or replaces, if the same `(host, path_prefix)` already exists) a route.
    pub fn register(&mut self, host: HostPattern, path_prefix: impl Into<String>, service: S) {
        let path_prefix = path_prefix.into();
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.host == host && r.path_prefix == path_prefix)
        {
            existing.service = service;
            return;
        }
        self.routes.push(Route {
            host,
            path_prefix,
            service,
        });
    }

    /// Removes a route. A no-op (not an error) if it doesn't exist.
    pub fn remove(&mut self, host: &HostPattern, path_prefix: &str) {
        self.routes.retain(|r| !(&r.host == host && r.path_prefix == path_prefix));
    }

    /// Finds the best-matching service for `(host, path)`.
    pub fn lookup(&self, host: &str, path: &str) -> &S {
        let best = self
            .routes
            .iter()
            .filter(|r| path.starts_with(r.path_prefix.as_str()) && r.host.matches(host))
            .max_by_key(|r| (r.path_prefix.len(), r.host.specificity()));

        match best {
            Some(route) => &route.service,
            None => {
                trace!(host, path, "no route matched; falling back to not-found service");
                &self.not_found
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut selector = WebSelector::new("404");
        selector.register(HostPattern::Any, "/a", "short");
        selector.register(HostPattern::Any, "/a/b", "long");

        assert_eq!(*selector.lookup("any.host", "/a/b/c"), "long");
        assert_eq!(*selector.lookup("any.host", "/a/x"), "short");
    }

    #[test]
    fn exact_host_beats_wildcard_beats_any_on_equal_prefix() {
        let mut selector = WebSelector::new("404");
        selector.register(HostPattern::Any, "/a", "any");
        selector.register(HostPattern::Wildcard("*.example.com".into()), "/a", "wildcard");
        selector.register(HostPattern::Exact("api.example.com".into()), "/a", "exact");

        assert_eq!(*selector.lookup("api.example.com", "/a"), "exact");
        assert_eq!(*selector.lookup("sub.example.com", "/a"), "wildcard");
        assert_eq!(*selector.lookup("other.org", "/a"), "any");
    }

    #[test]
    fn no_match_returns_not_found() {
        let mut selector = WebSelector::new("404");
        selector.register(HostPattern::Exact("api.example.com".into()), "/a", "exact");
        assert_eq!(*selector.lookup("other.org", "/a"), "404");
    }

    #[test]
    fn registration_and_removal_are_idempotent() {
        let mut selector = WebSelector::new("404");
        selector.register(HostPattern::Any, "/a", "first");
        selector.register(HostPattern::Any, "/a", "second");
        assert_eq!(selector.routes.len(), 1);
        assert_eq!(*selector.lookup("x", "/a"), "second");

        selector.remove(&HostPattern::Any, "/a");
        selector.remove(&HostPattern::Any, "/a");
        assert_eq!(*selector.lookup("x", "/a"), "404");
    }
}
