use http::Method;
use regex::Regex;

use pagi_protocol::{SharedApp, SharedMiddleware};

use crate::pattern::Pattern;

/// Which HTTP methods a route answers.
#[derive(Debug, Clone)]
pub enum MethodSpec {
    /// The `*` wildcard: any method, and never counted toward `Allow`.
    Any,
    One(Method),
    Many(Vec<Method>),
}

impl MethodSpec {
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodSpec::Any => true,
            MethodSpec::One(m) => m == method,
            MethodSpec::Many(ms) => ms.contains(method),
        }
    }

    /// True when a HEAD request may fall back onto this route's GET handler.
    pub fn accepts_get(&self) -> bool {
        self.matches(&Method::GET)
    }

    /// Method tokens this route contributes to a 405 `Allow` header.
    /// Wildcard routes contribute nothing.
    pub fn allow_tokens(&self) -> Vec<&str> {
        match self {
            MethodSpec::Any => Vec::new(),
            MethodSpec::One(m) => vec![m.as_str()],
            MethodSpec::Many(ms) => ms.iter().map(Method::as_str).collect(),
        }
    }
}

impl From<Method> for MethodSpec {
    fn from(m: Method) -> Self {
        MethodSpec::One(m)
    }
}

impl From<Vec<Method>> for MethodSpec {
    fn from(ms: Vec<Method>) -> Self {
        MethodSpec::Many(ms)
    }
}

/// A registered route. Immutable once the router is finalized; the builder
/// may attach chained constraints, a name, and middleware up to that point.
pub struct Route {
    pub(crate) pattern: Pattern,
    pub(crate) methods: MethodSpec,
    /// Constraints chained on after registration, checked together with the
    /// pattern's inline constraints after a regex match.
    pub(crate) constraints: Vec<(String, Regex)>,
    pub(crate) middleware: Vec<SharedMiddleware>,
    pub(crate) handler: SharedApp,
    pub(crate) name: Option<String>,
}

impl Route {
    /// Whether `path` matches this route's pattern and every constraint.
    pub(crate) fn match_path(&self, path: &str) -> Option<pagi_protocol::PathParams> {
        let params = self.pattern.match_path(path)?;
        for (name, constraint) in &self.constraints {
            match params.get(name) {
                Some(value) if constraint.is_match(value) => {}
                _ => return None,
            }
        }
        Some(params)
    }

    pub fn template(&self) -> &str {
        self.pattern.template()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagi_protocol::{AppError, Receiver, Scope, Sender};
    use std::sync::Arc;

    fn noop_handler() -> SharedApp {
        Arc::new(|_: Scope, _: Receiver, _: Sender| async { Ok::<(), AppError>(()) })
    }

    fn route(template: &str, methods: MethodSpec) -> Route {
        Route {
            pattern: Pattern::compile(template).unwrap(),
            methods,
            constraints: Vec::new(),
            middleware: Vec::new(),
            handler: noop_handler(),
            name: None,
        }
    }

    #[test]
    fn wildcard_matches_everything_but_contributes_no_allow() {
        let spec = MethodSpec::Any;
        assert!(spec.matches(&Method::DELETE));
        assert!(spec.allow_tokens().is_empty());
    }

    #[test]
    fn method_list_is_membership() {
        let spec = MethodSpec::Many(vec![Method::GET, Method::POST]);
        assert!(spec.matches(&Method::POST));
        assert!(!spec.matches(&Method::PUT));
        assert_eq!(spec.allow_tokens(), vec!["GET", "POST"]);
    }

    #[test]
    fn chained_constraint_rejects_after_pattern_match() {
        let mut r = route("/users/{id}", MethodSpec::One(Method::GET));
        r.constraints
            .push(("id".into(), Regex::new(r"^\d+$").unwrap()));
        assert!(r.match_path("/users/42").is_some());
        assert!(r.match_path("/users/abc").is_none());
    }
}
