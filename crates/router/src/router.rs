use std::sync::Arc;

use http::Method;
use indexmap::IndexMap;
use regex::Regex;

use pagi_protocol::{Application, SharedApp, SharedMiddleware};

use crate::dispatch::{CompiledRoute, RouterApp};
use crate::middleware::compose;
use crate::pattern::{Pattern, PatternError};
use crate::route::{MethodSpec, Route};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("no route registered yet; chained helpers act on the last-added route")]
    NoLastRoute,
    #[error("route name {0:?} is already taken")]
    DuplicateName(String),
    #[error("no route named {0:?}")]
    UnknownName(String),
    #[error("constraint for {param:?} is not a valid regex: {source}")]
    InvalidConstraint {
        param: String,
        source: regex::Error,
    },
}

/// What to do with a path that misses every route but would hit one without
/// its trailing slash. Out of conformance scope; `Strict` is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrailingSlash {
    /// `/users/` and `/users` are distinct paths.
    #[default]
    Strict,
    /// Permanent-redirect `/users/` to `/users` when only the latter exists.
    Redirect,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Table {
    Http,
    WebSocket,
    Sse,
}

struct GroupFrame {
    prefix: String,
    middleware: Vec<SharedMiddleware>,
    namespace: Option<String>,
}

/// The registration-time route builder.
///
/// The group stack exists only during registration; [`to_app`](Self::to_app)
/// snapshots the tables into an immutable dispatcher and may be called more
/// than once on a stable route set.
#[derive(Default)]
pub struct Router {
    http: Vec<Route>,
    websocket: Vec<Route>,
    sse: Vec<Route>,
    mounts: Vec<(String, SharedApp)>,
    named: IndexMap<String, (Table, usize)>,
    not_found: Option<SharedApp>,
    trailing_slash: TrailingSlash,
    groups: Vec<GroupFrame>,
    last: Option<(Table, usize)>,
}

fn join_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if path == "/" {
        if prefix.is_empty() {
            "/".to_string()
        } else {
            prefix.to_string()
        }
    } else {
        format!("{prefix}{path}")
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn effective_template(&self, template: &str) -> String {
        let mut prefix = String::new();
        for frame in &self.groups {
            prefix = join_prefix(&prefix, &frame.prefix);
        }
        join_prefix(&prefix, template)
    }

    fn group_middleware(&self) -> Vec<SharedMiddleware> {
        self.groups
            .iter()
            .flat_map(|f| f.middleware.iter().cloned())
            .collect()
    }

    fn namespaced(&self, name: &str) -> String {
        let mut full = String::new();
        for frame in &self.groups {
            if let Some(ns) = &frame.namespace {
                full.push_str(ns);
                full.push('.');
            }
        }
        full.push_str(name);
        full
    }

    fn table_mut(&mut self, table: Table) -> &mut Vec<Route> {
        match table {
            Table::Http => &mut self.http,
            Table::WebSocket => &mut self.websocket,
            Table::Sse => &mut self.sse,
        }
    }

    fn add(
        &mut self,
        table: Table,
        methods: MethodSpec,
        template: &str,
        handler: SharedApp,
    ) -> Result<&mut Self, RouterError> {
        let template = self.effective_template(template);
        let route = Route {
            pattern: Pattern::compile(&template)?,
            methods,
            constraints: Vec::new(),
            middleware: self.group_middleware(),
            handler,
            name: None,
        };
        let routes = self.table_mut(table);
        routes.push(route);
        self.last = Some((table, self.table_mut(table).len() - 1));
        Ok(self)
    }

    /// Register a route for an explicit method spec.
    pub fn route(
        &mut self,
        methods: impl Into<MethodSpec>,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.add(Table::Http, methods.into(), template, Arc::new(handler))
    }

    pub fn get(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::GET, template, handler)
    }

    pub fn post(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::POST, template, handler)
    }

    pub fn put(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::PUT, template, handler)
    }

    pub fn delete(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::DELETE, template, handler)
    }

    pub fn patch(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::PATCH, template, handler)
    }

    pub fn options(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(Method::OPTIONS, template, handler)
    }

    /// Register a route answering a list of methods.
    pub fn any(
        &mut self,
        methods: &[Method],
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(MethodSpec::Many(methods.to_vec()), template, handler)
    }

    /// Register a wildcard route: matches every method, never contributes
    /// to a 405 `Allow` header.
    pub fn all(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.route(MethodSpec::Any, template, handler)
    }

    /// Register a WebSocket route. Path-only matching.
    pub fn websocket(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.add(Table::WebSocket, MethodSpec::Any, template, Arc::new(handler))
    }

    /// Register a Server-Sent Events route. Path-only matching.
    pub fn sse(
        &mut self,
        template: &str,
        handler: impl Application,
    ) -> Result<&mut Self, RouterError> {
        self.add(Table::Sse, MethodSpec::Any, template, Arc::new(handler))
    }

    /// Delegate everything under `prefix` to an independent sub-application.
    ///
    /// At dispatch the prefix is stripped from `path` and accumulated onto
    /// `root_path`. Mounts are tried longest-prefix-first and never
    /// contribute to 405.
    pub fn mount(&mut self, prefix: &str, app: impl Application) -> &mut Self {
        let prefix = self
            .effective_template(prefix)
            .trim_end_matches('/')
            .to_string();
        self.mounts.push((prefix, Arc::new(app)));
        self
    }

    /// Name the most recently added route for URL generation.
    pub fn name(&mut self, name: &str) -> Result<&mut Self, RouterError> {
        let (table, idx) = self.last.ok_or(RouterError::NoLastRoute)?;
        let full = self.namespaced(name);
        if self.named.contains_key(&full) {
            return Err(RouterError::DuplicateName(full));
        }
        self.named.insert(full.clone(), (table, idx));
        self.table_mut(table)[idx].name = Some(full);
        Ok(self)
    }

    /// Chain a constraint onto the most recently added route.
    pub fn constrain(&mut self, param: &str, pattern: &str) -> Result<&mut Self, RouterError> {
        let (table, idx) = self.last.ok_or(RouterError::NoLastRoute)?;
        let compiled =
            Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                RouterError::InvalidConstraint {
                    param: param.to_string(),
                    source,
                }
            })?;
        self.table_mut(table)[idx]
            .constraints
            .push((param.to_string(), compiled));
        Ok(self)
    }

    /// Append middleware to the most recently added route. Group middleware
    /// registered via [`group`](Self::group) always runs outside it.
    pub fn wrap(&mut self, middleware: impl pagi_protocol::Middleware) -> Result<&mut Self, RouterError> {
        let (table, idx) = self.last.ok_or(RouterError::NoLastRoute)?;
        self.table_mut(table)[idx]
            .middleware
            .push(Arc::new(middleware));
        Ok(self)
    }

    /// Register routes under a shared prefix and middleware stack.
    ///
    /// Purely registration-time sugar: the callback registers on this same
    /// router, and every registration consults the group stack for prefix
    /// and middleware before compiling.
    pub fn group<F>(
        &mut self,
        prefix: &str,
        middleware: Vec<SharedMiddleware>,
        register: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: FnOnce(&mut Router) -> Result<(), RouterError>,
    {
        self.group_as(prefix, None, middleware, register)
    }

    /// [`group`](Self::group) with a namespace prefixed onto every route
    /// name introduced inside it.
    pub fn group_as<F>(
        &mut self,
        prefix: &str,
        namespace: Option<&str>,
        middleware: Vec<SharedMiddleware>,
        register: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: FnOnce(&mut Router) -> Result<(), RouterError>,
    {
        self.groups.push(GroupFrame {
            prefix: prefix.to_string(),
            middleware,
            namespace: namespace.map(str::to_string),
        });
        let result = register(self);
        self.groups.pop();
        result?;
        Ok(self)
    }

    /// Snapshot-copy another router's routes under a prefix and middleware
    /// stack. Later modifications to `source` do not affect this router.
    /// Name collisions are errors.
    pub fn include(
        &mut self,
        prefix: &str,
        middleware: Vec<SharedMiddleware>,
        source: &Router,
    ) -> Result<&mut Self, RouterError> {
        self.include_as(prefix, None, middleware, source)
    }

    /// [`include`](Self::include) with a namespace for the copied names.
    ///
    /// The source router's 404 handler and trailing-slash policy are not
    /// copied: a single dispatch table survives, governed by this router.
    pub fn include_as(
        &mut self,
        prefix: &str,
        namespace: Option<&str>,
        middleware: Vec<SharedMiddleware>,
        source: &Router,
    ) -> Result<&mut Self, RouterError> {
        self.groups.push(GroupFrame {
            prefix: prefix.to_string(),
            middleware,
            namespace: namespace.map(str::to_string),
        });
        let result = self.copy_tables(source);
        self.groups.pop();
        result?;
        Ok(self)
    }

    fn copy_tables(&mut self, source: &Router) -> Result<(), RouterError> {
        for (table, routes) in [
            (Table::Http, &source.http),
            (Table::WebSocket, &source.websocket),
            (Table::Sse, &source.sse),
        ] {
            for route in routes {
                let template = self.effective_template(route.template());
                let mut middleware = self.group_middleware();
                middleware.extend(route.middleware.iter().cloned());
                let copied = Route {
                    pattern: Pattern::compile(&template)?,
                    methods: route.methods.clone(),
                    constraints: route.constraints.clone(),
                    middleware,
                    handler: route.handler.clone(),
                    name: None,
                };
                let routes = self.table_mut(table);
                routes.push(copied);
                let idx = routes.len() - 1;
                self.last = Some((table, idx));
                if let Some(name) = &route.name {
                    self.name(name)?;
                }
            }
        }
        for (prefix, app) in &source.mounts {
            let prefix = self.effective_template(prefix);
            self.mounts.push((prefix, app.clone()));
        }
        Ok(())
    }

    /// Install a custom 404 application.
    pub fn not_found(&mut self, handler: impl Application) -> &mut Self {
        self.not_found = Some(Arc::new(handler));
        self
    }

    pub fn trailing_slash(&mut self, policy: TrailingSlash) -> &mut Self {
        self.trailing_slash = policy;
        self
    }

    /// Generate a URL path for a named route. Substituted values are not
    /// validated against the route's constraints.
    pub fn uri_for<I, K, V>(&self, name: &str, params: I) -> Result<String, RouterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (table, idx) = *self
            .named
            .get(name)
            .ok_or_else(|| RouterError::UnknownName(name.to_string()))?;
        let routes = match table {
            Table::Http => &self.http,
            Table::WebSocket => &self.websocket,
            Table::Sse => &self.sse,
        };
        let params = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(routes[idx].pattern.expand(&params)?)
    }

    /// Freeze the tables into an immutable dispatcher with every route's
    /// middleware chain pre-composed.
    ///
    /// May be called more than once; each call snapshots the current route
    /// set and yields equivalent dispatch behavior for a stable set.
    pub fn to_app(&self) -> RouterApp {
        let compile = |routes: &[Route]| -> Vec<CompiledRoute> {
            routes
                .iter()
                .map(|route| CompiledRoute {
                    pattern: route.pattern.clone(),
                    methods: route.methods.clone(),
                    constraints: route.constraints.clone(),
                    handler: compose(&route.middleware, route.handler.clone()),
                    template: Arc::from(route.template()),
                })
                .collect()
        };

        let mut mounts = self.mounts.clone();
        mounts.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));

        let named = self
            .named
            .iter()
            .map(|(name, (table, idx))| {
                let routes = match table {
                    Table::Http => &self.http,
                    Table::WebSocket => &self.websocket,
                    Table::Sse => &self.sse,
                };
                (name.clone(), routes[*idx].pattern.clone())
            })
            .collect();

        RouterApp::new(
            compile(&self.http),
            compile(&self.websocket),
            compile(&self.sse),
            mounts,
            named,
            self.not_found.clone(),
            self.trailing_slash,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagi_protocol::{AppError, Receiver, Scope, Sender};

    fn handler() -> impl Application {
        |_: Scope, _: Receiver, _: Sender| async { Ok::<(), AppError>(()) }
    }

    #[test]
    fn chained_helpers_require_a_route() {
        let mut r = Router::new();
        assert!(matches!(r.name("home"), Err(RouterError::NoLastRoute)));
        assert!(matches!(
            r.constrain("id", r"\d+"),
            Err(RouterError::NoLastRoute)
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut r = Router::new();
        r.get("/a", handler()).unwrap().name("thing").unwrap();
        r.get("/b", handler()).unwrap();
        assert!(matches!(
            r.name("thing"),
            Err(RouterError::DuplicateName(_))
        ));
    }

    #[test]
    fn uri_for_expands_named_routes() {
        let mut r = Router::new();
        r.get(r"/users/{id:\d+}/posts/*rest", handler())
            .unwrap()
            .name("user_posts")
            .unwrap();
        let url = r
            .uri_for("user_posts", [("id", "9"), ("rest", "a/b")])
            .unwrap();
        assert_eq!(url, "/users/9/posts/a/b");
        assert!(matches!(
            r.uri_for("nope", [("a", "b")]),
            Err(RouterError::UnknownName(_))
        ));
    }

    #[test]
    fn group_namespace_prefixes_names() {
        let mut r = Router::new();
        r.group_as("/api", Some("api"), Vec::new(), |r| {
            r.get("/users", handler())?.name("users")?;
            Ok(())
        })
        .unwrap();
        assert!(r.uri_for("api.users", std::iter::empty::<(String, String)>()).is_ok());
    }

    #[test]
    fn include_snapshot_is_isolated_from_source() {
        let mut child = Router::new();
        child.get("/widgets", handler()).unwrap().name("widgets").unwrap();

        let mut parent = Router::new();
        parent.include("/v1", Vec::new(), &child).unwrap();

        // Mutating the source after the copy must not affect the parent.
        child.get("/gadgets", handler()).unwrap();

        let app = parent.to_app();
        assert!(app.uri_for("widgets", std::iter::empty::<(String, String)>()).is_ok());
        assert_eq!(
            parent
                .uri_for("widgets", std::iter::empty::<(String, String)>())
                .unwrap(),
            "/v1/widgets"
        );
    }

    #[test]
    fn include_name_collision_is_an_error() {
        let mut child = Router::new();
        child.get("/x", handler()).unwrap().name("x").unwrap();
        let mut parent = Router::new();
        parent.get("/y", handler()).unwrap().name("x").unwrap();
        assert!(matches!(
            parent.include("/v1", Vec::new(), &child),
            Err(RouterError::DuplicateName(_))
        ));
    }

    #[test]
    fn nested_group_prefixes_accumulate() {
        let mut r = Router::new();
        r.group("/api", Vec::new(), |r| {
            r.group("/v2", Vec::new(), |r| {
                r.get("/ping", handler())?.name("ping")?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            r.uri_for("ping", std::iter::empty::<(String, String)>())
                .unwrap(),
            "/api/v2/ping"
        );
    }
}
