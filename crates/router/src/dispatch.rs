use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;

use pagi_protocol::{
    AppError, AppEvent, Application, BodyPayload, Receiver, RequestScope, Scope, Sender,
    SharedApp, WebSocketScope,
};

use crate::pattern::Pattern;
use crate::route::MethodSpec;
use crate::router::{RouterError, TrailingSlash};

/// A route frozen for dispatch: its middleware chain is already composed
/// into `handler`.
pub(crate) struct CompiledRoute {
    pub(crate) pattern: Pattern,
    pub(crate) methods: MethodSpec,
    pub(crate) constraints: Vec<(String, Regex)>,
    pub(crate) handler: SharedApp,
    pub(crate) template: Arc<str>,
}

impl CompiledRoute {
    fn match_path(&self, path: &str) -> Option<pagi_protocol::PathParams> {
        let params = self.pattern.match_path(path)?;
        for (name, constraint) in &self.constraints {
            match params.get(name) {
                Some(value) if constraint.is_match(value) => {}
                _ => return None,
            }
        }
        Some(params)
    }
}

/// The finalized dispatcher. A PAGI application in its own right: hand it to
/// the server, or mount it inside another router.
pub struct RouterApp {
    http: Vec<CompiledRoute>,
    websocket: Vec<CompiledRoute>,
    sse: Vec<CompiledRoute>,
    /// Longest-prefix-first.
    mounts: Vec<(String, SharedApp)>,
    named: indexmap::IndexMap<String, Pattern>,
    not_found: SharedApp,
    trailing_slash: TrailingSlash,
}

impl RouterApp {
    pub(crate) fn new(
        http: Vec<CompiledRoute>,
        websocket: Vec<CompiledRoute>,
        sse: Vec<CompiledRoute>,
        mounts: Vec<(String, SharedApp)>,
        named: indexmap::IndexMap<String, Pattern>,
        not_found: Option<SharedApp>,
        trailing_slash: TrailingSlash,
    ) -> Self {
        Self {
            http,
            websocket,
            sse,
            mounts,
            named,
            not_found: not_found.unwrap_or_else(|| Arc::new(default_not_found)),
            trailing_slash,
        }
    }

    /// Generate a URL path for a named route; the finalized counterpart of
    /// [`Router::uri_for`](crate::Router::uri_for).
    pub fn uri_for<I, K, V>(&self, name: &str, params: I) -> Result<String, RouterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pattern = self
            .named
            .get(name)
            .ok_or_else(|| RouterError::UnknownName(name.to_string()))?;
        let params: HashMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(pattern.expand(&params)?)
    }

    /// The templates in each dispatch table, for startup logging.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.http
            .iter()
            .chain(&self.websocket)
            .chain(&self.sse)
            .map(|r| &*r.template)
    }

    fn find_mount<'a>(&'a self, path: &str) -> Option<(&'a str, &'a SharedApp, String)> {
        for (prefix, app) in &self.mounts {
            if let Some(rest) = strip_mount_prefix(path, prefix) {
                return Some((prefix, app, rest));
            }
        }
        None
    }

    async fn dispatch_http(
        &self,
        mut request: RequestScope,
        receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        let path = request.path.clone();
        let mut allow: Vec<&str> = Vec::new();
        let mut path_matched = false;

        for route in &self.http {
            if let Some(params) = route.match_path(&path) {
                let method_ok = route.methods.matches(&request.method)
                    || (request.method == Method::HEAD && route.methods.accepts_get());
                if method_ok {
                    request.path_params = params;
                    request.route = Some(route.template.clone());
                    return route.handler.call(Scope::Http(request), receive, send).await;
                }
                path_matched = true;
                allow.extend(route.methods.allow_tokens());
            }
        }

        // A path match with no method match is a 405; mounts are only
        // consulted when no route path matched at all.
        if path_matched {
            return respond_method_not_allowed(&send, allow).await;
        }

        if let Some((prefix, app, rest)) = self.find_mount(&path) {
            request.root_path.push_str(prefix);
            request.path = rest;
            return app.call(Scope::Http(request), receive, send).await;
        }

        if self.trailing_slash == TrailingSlash::Redirect {
            if let Some(target) = self.slash_redirect_target(&request) {
                return respond_redirect(&send, &target).await;
            }
        }

        self.not_found.call(Scope::Http(request), receive, send).await
    }

    fn slash_redirect_target(&self, request: &RequestScope) -> Option<String> {
        let trimmed = request.path.strip_suffix('/')?;
        if trimmed.is_empty() {
            return None;
        }
        self.http.iter().find(|r| r.match_path(trimmed).is_some())?;
        let mut target = trimmed.to_string();
        if !request.query_string.is_empty() {
            target.push('?');
            target.push_str(&String::from_utf8_lossy(&request.query_string));
        }
        Some(target)
    }

    async fn dispatch_path_only(
        &self,
        table: &[CompiledRoute],
        mut request: RequestScope,
        wrap: impl Fn(RequestScope) -> Scope,
        receive: Receiver,
        send: Sender,
    ) -> Result<(), AppError> {
        let path = request.path.clone();
        for route in table {
            if let Some(params) = route.match_path(&path) {
                request.path_params = params;
                request.route = Some(route.template.clone());
                return route.handler.call(wrap(request), receive, send).await;
            }
        }
        if let Some((prefix, app, rest)) = self.find_mount(&path) {
            request.root_path.push_str(prefix);
            request.path = rest;
            return app.call(wrap(request), receive, send).await;
        }
        // No route: the server turns this into its 404-equivalent for the
        // transport (handshake rejection / error response).
        Err(AppError::Unsupported)
    }
}

#[async_trait]
impl Application for RouterApp {
    async fn call(&self, scope: Scope, receive: Receiver, send: Sender) -> Result<(), AppError> {
        match scope {
            Scope::Http(request) => self.dispatch_http(request, receive, send).await,
            Scope::Sse(request) => {
                self.dispatch_path_only(&self.sse, request, Scope::Sse, receive, send)
                    .await
            }
            Scope::WebSocket(WebSocketScope {
                request,
                subprotocols,
            }) => {
                self.dispatch_path_only(
                    &self.websocket,
                    request,
                    move |request| {
                        Scope::WebSocket(WebSocketScope {
                            request,
                            subprotocols: subprotocols.clone(),
                        })
                    },
                    receive,
                    send,
                )
                .await
            }
            // Routers have no lifecycle of their own; lifespan hooks wrap
            // the router at the application level.
            Scope::Lifespan(_) => Err(AppError::Unsupported),
        }
    }
}

fn strip_mount_prefix(path: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(path.to_string());
    }
    if path == prefix {
        return Some("/".to_string());
    }
    path.strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
        .map(str::to_string)
}

async fn default_not_found(
    _scope: Scope,
    _receive: Receiver,
    send: Sender,
) -> Result<(), AppError> {
    let body = "Not Found";
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    send.send(AppEvent::ResponseStart {
        status: StatusCode::NOT_FOUND,
        headers,
        trailers: false,
    })
    .await?;
    send.send(AppEvent::ResponseBody {
        payload: BodyPayload::from(body),
        more: false,
    })
    .await?;
    Ok(())
}

async fn respond_method_not_allowed(send: &Sender, allow: Vec<&str>) -> Result<(), AppError> {
    let mut seen = Vec::new();
    for token in allow {
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ALLOW,
        HeaderValue::from_str(&seen.join(", ")).unwrap_or(HeaderValue::from_static("")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
    send.send(AppEvent::ResponseStart {
        status: StatusCode::METHOD_NOT_ALLOWED,
        headers,
        trailers: false,
    })
    .await?;
    send.send(AppEvent::ResponseBody {
        payload: BodyPayload::Bytes(bytes::Bytes::new()),
        more: false,
    })
    .await?;
    Ok(())
}

async fn respond_redirect(send: &Sender, location: &str) -> Result<(), AppError> {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::LOCATION, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
    send.send(AppEvent::ResponseStart {
        status: StatusCode::PERMANENT_REDIRECT,
        headers,
        trailers: false,
    })
    .await?;
    send.send(AppEvent::ResponseBody {
        payload: BodyPayload::Bytes(bytes::Bytes::new()),
        more: false,
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use bytes::Bytes;
    use http::Version;
    use pagi_protocol::{
        app_channel, server_channel, AppEventQueue, PagiInfo, PathParams, Scheme,
        SharedMiddleware, Stash, State, Tasks,
    };
    use std::sync::Mutex;

    fn request(method: Method, path: &str) -> RequestScope {
        RequestScope {
            method,
            path: path.to_string(),
            raw_path: Bytes::copy_from_slice(path.as_bytes()),
            query_string: Bytes::new(),
            headers: HeaderMap::new(),
            scheme: Scheme::Http,
            http_version: Version::HTTP_11,
            client: "127.0.0.1:40000".parse().unwrap(),
            server: "127.0.0.1:8080".parse().unwrap(),
            tls: None,
            root_path: String::new(),
            pagi: PagiInfo::single_process(),
            state: State::new(),
            stash: Stash::new(),
            tasks: Tasks::disconnected(),
            path_params: PathParams::new(),
            route: None,
        }
    }

    async fn run(app: &RouterApp, method: Method, path: &str) -> (Result<(), AppError>, AppEventQueue) {
        let (_queue, receiver) = server_channel(4);
        let (sender, events) = app_channel(16, None);
        let result = app
            .call(Scope::Http(request(method, path)), receiver, sender)
            .await;
        (result, events)
    }

    async fn response_status(events: &mut AppEventQueue) -> StatusCode {
        match events.next().await {
            Some(AppEvent::ResponseStart { status, .. }) => status,
            other => panic!("expected response start, got {other:?}"),
        }
    }

    /// Handler that echoes the `id` path parameter as the response body.
    fn echo_id() -> impl Application {
        |scope: Scope, _: Receiver, send: Sender| async move {
            let request = scope.request().expect("request scope");
            let id = request
                .path_params
                .get("id")
                .unwrap_or_default()
                .to_string();
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(id.len()));
            send.send(AppEvent::ResponseStart {
                status: StatusCode::OK,
                headers,
                trailers: false,
            })
            .await?;
            send.send(AppEvent::ResponseBody {
                payload: BodyPayload::Bytes(Bytes::from(id)),
                more: false,
            })
            .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn constraint_match_and_miss() {
        let mut router = Router::new();
        router.get(r"/users/{id:\d+}", echo_id()).unwrap();
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::GET, "/users/42").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::OK);
        match events.next().await {
            Some(AppEvent::ResponseBody { payload: BodyPayload::Bytes(b), more }) => {
                assert_eq!(&b[..], b"42");
                assert!(!more);
            }
            other => panic!("unexpected {other:?}"),
        }

        let (result, mut events) = run(&app, Method::GET, "/users/abc").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn method_miss_yields_405_with_allow_union() {
        let mut router = Router::new();
        router.get("/users/{id}", echo_id()).unwrap();
        router
            .any(&[Method::PUT, Method::PATCH], "/users/{id}", echo_id())
            .unwrap();
        // Wildcard routes must not contribute to Allow.
        router.all("/users/{id}", echo_id()).unwrap();
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::DELETE, "/users/42").await;
        result.unwrap();
        // The wildcard route matches DELETE first? Registration order: the
        // GET route, then PUT/PATCH, then wildcard; the wildcard matches.
        assert_eq!(response_status(&mut events).await, StatusCode::OK);

        let mut router = Router::new();
        router.get("/users/{id}", echo_id()).unwrap();
        router
            .any(&[Method::PUT, Method::PATCH], "/users/{id}", echo_id())
            .unwrap();
        let app = router.to_app();
        let (result, mut events) = run(&app, Method::DELETE, "/users/42").await;
        result.unwrap();
        match events.next().await {
            Some(AppEvent::ResponseStart { status, headers, .. }) => {
                assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
                assert_eq!(headers.get(header::ALLOW).unwrap(), "GET, PUT, PATCH");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn head_falls_back_to_get() {
        let mut router = Router::new();
        router.get("/doc", echo_id()).unwrap();
        let app = router.to_app();
        let (result, mut events) = run(&app, Method::HEAD, "/doc").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn group_flattening_matches_manual_registration() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let auth: SharedMiddleware = Arc::new({
            let log = log.clone();
            move |scope: Scope, receive: Receiver, send: Sender, next: pagi_protocol::Next| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push("auth".into());
                    next.run(scope, receive, send).await
                }
            }
        });

        let mut router = Router::new();
        router
            .group("/api", vec![auth], |r| {
                r.get("/users", echo_id())?;
                Ok(())
            })
            .unwrap();
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::GET, "/api/users").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), vec!["auth"]);

        // The unprefixed path must not exist.
        let (result, mut events) = run(&app, Method::GET, "/users").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mount_strips_prefix_and_accumulates_root_path() {
        let seen = Arc::new(Mutex::new(None::<(String, String)>));
        let sub_seen = seen.clone();
        let sub = move |scope: Scope, _: Receiver, send: Sender| {
            let seen = sub_seen.clone();
            async move {
                let request = scope.request().unwrap();
                *seen.lock().unwrap() =
                    Some((request.root_path.clone(), request.path.clone()));
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
                send.send(AppEvent::ResponseStart {
                    status: StatusCode::NO_CONTENT,
                    headers,
                    trailers: false,
                })
                .await?;
                send.send(AppEvent::ResponseBody {
                    payload: BodyPayload::Bytes(Bytes::new()),
                    more: false,
                })
                .await?;
                Ok(())
            }
        };

        let mut router = Router::new();
        router.mount("/admin", sub);
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::GET, "/admin/tools/db").await;
        result.unwrap();
        assert_eq!(response_status(&mut events).await, StatusCode::NO_CONTENT);
        assert_eq!(
            seen.lock().unwrap().clone().unwrap(),
            ("/admin".to_string(), "/tools/db".to_string())
        );
    }

    #[tokio::test]
    async fn longest_mount_prefix_wins() {
        let tag = |label: &'static str| {
            move |_: Scope, _: Receiver, send: Sender| async move {
                let mut headers = HeaderMap::new();
                headers.insert("x-mount", HeaderValue::from_static(label));
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0));
                send.send(AppEvent::ResponseStart {
                    status: StatusCode::OK,
                    headers,
                    trailers: false,
                })
                .await?;
                send.send(AppEvent::ResponseBody {
                    payload: BodyPayload::Bytes(Bytes::new()),
                    more: false,
                })
                .await?;
                Ok(())
            }
        };

        let mut router = Router::new();
        router.mount("/api", tag("short"));
        router.mount("/api/v2", tag("long"));
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::GET, "/api/v2/things").await;
        result.unwrap();
        match events.next().await {
            Some(AppEvent::ResponseStart { headers, .. }) => {
                assert_eq!(headers.get("x-mount").unwrap(), "long");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn websocket_dispatch_is_path_only_and_404_is_unsupported() {
        let mut router = Router::new();
        router
            .websocket("/ws/{room}", |scope: Scope, _: Receiver, _: Sender| async move {
                assert!(matches!(scope, Scope::WebSocket(_)));
                Ok(())
            })
            .unwrap();
        let app = router.to_app();

        let (_queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let ws_scope = Scope::WebSocket(WebSocketScope {
            request: request(Method::GET, "/ws/lobby"),
            subprotocols: vec![],
        });
        app.call(ws_scope, receiver, sender).await.unwrap();

        let (_queue, receiver) = server_channel(4);
        let (sender, _events) = app_channel(4, None);
        let miss = Scope::WebSocket(WebSocketScope {
            request: request(Method::GET, "/nope"),
            subprotocols: vec![],
        });
        assert!(matches!(
            app.call(miss, receiver, sender).await,
            Err(AppError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn compiling_twice_dispatches_identically() {
        let mut router = Router::new();
        router.get("/ping", echo_id()).unwrap();
        let first = router.to_app();
        let second = router.to_app();
        for app in [&first, &second] {
            let (result, mut events) = run(app, Method::GET, "/ping").await;
            result.unwrap();
            assert_eq!(response_status(&mut events).await, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn trailing_slash_redirect_policy() {
        let mut router = Router::new();
        router.trailing_slash(TrailingSlash::Redirect);
        router.get("/about", echo_id()).unwrap();
        let app = router.to_app();

        let (result, mut events) = run(&app, Method::GET, "/about/").await;
        result.unwrap();
        match events.next().await {
            Some(AppEvent::ResponseStart { status, headers, .. }) => {
                assert_eq!(status, StatusCode::PERMANENT_REDIRECT);
                assert_eq!(headers.get(header::LOCATION).unwrap(), "/about");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
