use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method};

use pagi_protocol::{
    PathParams, ProtocolError, Receiver, RequestScope, ServerEvent, Stash, State, Tasks,
};

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// A convenience wrapper over an HTTP scope and its `receive` stream.
///
/// Body accessors drain the event stream once and cache the result, so
/// `json()` after `body()` does not re-read the wire.
pub struct Request {
    scope: RequestScope,
    receive: Receiver,
    cached_body: Option<Bytes>,
    disconnected: bool,
}

impl Request {
    pub fn new(scope: RequestScope, receive: Receiver) -> Self {
        Self {
            scope,
            receive,
            cached_body: None,
            disconnected: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.scope.method
    }

    pub fn path(&self) -> &str {
        &self.scope.path
    }

    pub fn root_path(&self) -> &str {
        &self.scope.root_path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.scope.headers
    }

    /// First value of a header, as UTF-8. Lookup is case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.scope.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in wire order.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.scope
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    /// A captured path parameter, as bound by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.scope.path_params.get(name)
    }

    pub fn params(&self) -> &PathParams {
        &self.scope.path_params
    }

    /// The matched route template, when dispatched through a router.
    pub fn route(&self) -> Option<&str> {
        self.scope.route.as_deref()
    }

    /// Decoded query pairs, in order of appearance.
    pub fn query(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.scope.query_string)
            .into_owned()
            .collect()
    }

    /// First query value for a name.
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.scope.query_string)
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Cookies from the `Cookie` header.
    pub fn cookies(&self) -> HashMap<String, String> {
        let mut cookies = HashMap::new();
        for value in self.header_all(header::COOKIE.as_str()) {
            for pair in value.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
        cookies
    }

    /// The per-request stash shared with middleware.
    pub fn stash(&self) -> &Stash {
        &self.scope.stash
    }

    /// The process-wide state populated at startup.
    pub fn state(&self) -> &State {
        &self.scope.state
    }

    /// The background-task sink for this scope.
    pub fn tasks(&self) -> &Tasks {
        &self.scope.tasks
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    /// Drain the request body to bytes. Cached after the first call.
    pub async fn body(&mut self) -> Result<Bytes, ProtocolError> {
        if let Some(body) = &self.cached_body {
            return Ok(body.clone());
        }
        if self.disconnected {
            return Err(ProtocolError::Closed);
        }
        let mut buf = BytesMut::new();
        loop {
            match self.receive.next().await {
                Some(ServerEvent::HttpRequest { body, more }) => {
                    buf.extend_from_slice(&body);
                    if !more {
                        break;
                    }
                }
                Some(ServerEvent::HttpDisconnect) | None => {
                    self.disconnected = true;
                    return Err(ProtocolError::Closed);
                }
                Some(other) => {
                    tracing::debug!(event = other.name(), "unexpected event while reading body");
                }
            }
        }
        let body = buf.freeze();
        self.cached_body = Some(body.clone());
        Ok(body)
    }

    /// Body parsed as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let body = self.body().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Body parsed as `application/x-www-form-urlencoded` pairs.
    pub async fn form(&mut self) -> anyhow::Result<Vec<(String, String)>> {
        let body = self.body().await?;
        Ok(url::form_urlencoded::parse(&body).into_owned().collect())
    }

    /// Body parsed as `multipart/form-data`.
    pub async fn uploads(&mut self) -> anyhow::Result<Vec<Upload>> {
        let content_type = self
            .content_type()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("multipart request without a content-type header"))?;
        let boundary = multer::parse_boundary(&content_type)?;
        let body = self.body().await?;

        let stream = futures::stream::once(async move {
            Ok::<_, std::convert::Infallible>(body)
        });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut uploads = Vec::new();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(|m| m.to_string());
            let data = field.bytes().await?;
            uploads.push(Upload {
                name,
                filename,
                content_type,
                data,
            });
        }
        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Version};
    use pagi_protocol::{server_channel, PagiInfo, Scheme};

    fn scope(query: &'static [u8]) -> RequestScope {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; theme=dark"),
        );
        headers.append("x-tag", HeaderValue::from_static("one"));
        headers.append("x-tag", HeaderValue::from_static("two"));
        RequestScope {
            method: Method::POST,
            path: "/submit".into(),
            raw_path: Bytes::from_static(b"/submit"),
            query_string: Bytes::from_static(query),
            headers,
            scheme: Scheme::Http,
            http_version: Version::HTTP_11,
            client: "127.0.0.1:9999".parse().unwrap(),
            server: "127.0.0.1:80".parse().unwrap(),
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

    #[tokio::test]
    async fn body_concatenates_installments_and_caches() {
        let (queue, receiver) = server_channel(8);
        let mut request = Request::new(scope(b""), receiver);
        for (chunk, more) in [(&b"ab"[..], true), (&b"cd"[..], false)] {
            queue
                .push(ServerEvent::HttpRequest {
                    body: Bytes::copy_from_slice(chunk),
                    more,
                })
                .await;
        }
        assert_eq!(&request.body().await.unwrap()[..], b"abcd");
        // Second call must not consult the stream again.
        assert_eq!(&request.body().await.unwrap()[..], b"abcd");
    }

    #[tokio::test]
    async fn query_and_cookies_parse() {
        let (_queue, receiver) = server_channel(1);
        let request = Request::new(scope(b"a=1&b=two%20words&a=3"), receiver);
        assert_eq!(request.query_param("b").unwrap(), "two words");
        let query = request.query();
        assert_eq!(query.len(), 3);
        assert_eq!(query[0], ("a".into(), "1".into()));

        let cookies = request.cookies();
        assert_eq!(cookies.get("session").unwrap(), "abc");
        assert_eq!(cookies.get("theme").unwrap(), "dark");
    }

    #[tokio::test]
    async fn header_all_returns_every_value() {
        let (_queue, receiver) = server_channel(1);
        let request = Request::new(scope(b""), receiver);
        assert_eq!(request.header_all("x-tag"), vec!["one", "two"]);
        assert_eq!(request.header("x-tag"), Some("one"));
        assert_eq!(request.header("missing"), None);
    }

    #[tokio::test]
    async fn json_round_trips() {
        #[derive(serde::Deserialize)]
        struct Payload {
            n: u32,
        }
        let (queue, receiver) = server_channel(4);
        let mut request = Request::new(scope(b""), receiver);
        queue
            .push(ServerEvent::HttpRequest {
                body: Bytes::from_static(b"{\"n\": 7}"),
                more: false,
            })
            .await;
        let payload: Payload = request.json().await.unwrap();
        assert_eq!(payload.n, 7);
    }

    #[tokio::test]
    async fn disconnect_surfaces_as_closed() {
        let (queue, receiver) = server_channel(4);
        let mut request = Request::new(scope(b""), receiver);
        queue.push(ServerEvent::HttpDisconnect).await;
        assert!(matches!(
            request.body().await,
            Err(ProtocolError::Closed)
        ));
    }
}
