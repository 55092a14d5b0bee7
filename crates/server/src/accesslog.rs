//! Structured access logging with a pre-compiled format.
//!
//! The Apache-style format string is compiled once at startup into a
//! fragment pipeline, so rendering a line is a straight walk with no
//! parsing on the request path. The logged size is the response body as
//! written to the transport, not any pre-transform size.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use chrono::{DateTime, Local};
use http::HeaderMap;

use crate::config::{AccessLogSettings, AccessLogTarget};

/// The Common Log Format.
pub const COMMON_FORMAT: &str = "%h %l %u %t \"%r\" %>s %b";

/// Common plus referer and user agent.
pub const COMBINED_FORMAT: &str =
    "%h %l %u %t \"%r\" %>s %b \"%{referer}i\" \"%{user-agent}i\"";

#[derive(Debug, Clone, PartialEq)]
enum Fragment {
    Literal(String),
    RemoteHost,
    Ident,
    User,
    Time,
    RequestLine,
    Status,
    /// `%b`: body bytes, `-` when zero.
    BytesClf,
    /// `%B`: body bytes, `0` when zero.
    Bytes,
    HeaderIn(String),
    HeaderOut(String),
    DurationMicros,
    DurationSecs,
    Pid,
}

/// Everything one log line can draw on.
pub struct LogRecord<'a> {
    pub remote: SocketAddr,
    pub user: Option<&'a str>,
    pub time: DateTime<Local>,
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
    pub status: u16,
    /// Response body bytes actually written to the transport.
    pub bytes: u64,
    pub duration: Duration,
    pub request_headers: &'a HeaderMap,
    pub response_headers: &'a HeaderMap,
}

/// A compiled access-log format.
#[derive(Debug, Clone)]
pub struct LogFormat {
    fragments: Vec<Fragment>,
}

impl LogFormat {
    pub fn compile(format: &str) -> anyhow::Result<Self> {
        let mut fragments = Vec::new();
        let mut literal = String::new();
        let mut chars = format.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            // Flush any pending literal before a directive.
            if !literal.is_empty() {
                fragments.push(Fragment::Literal(std::mem::take(&mut literal)));
            }
            // `%>s` is accepted as an alias of `%s`: with no internal
            // redirects the final status is the only status.
            if chars.peek() == Some(&'>') {
                chars.next();
            }
            let directive = match chars.next() {
                Some(d) => d,
                None => bail!("access log format ends with a bare '%'"),
            };
            let fragment = match directive {
                '%' => {
                    literal.push('%');
                    continue;
                }
                'h' => Fragment::RemoteHost,
                'l' => Fragment::Ident,
                'u' => Fragment::User,
                't' => Fragment::Time,
                'r' => Fragment::RequestLine,
                's' => Fragment::Status,
                'b' => Fragment::BytesClf,
                'B' => Fragment::Bytes,
                'D' => Fragment::DurationMicros,
                'T' => Fragment::DurationSecs,
                'P' => Fragment::Pid,
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => bail!("unterminated %{{name}} in access log format"),
                        }
                    }
                    match chars.next() {
                        Some('i') => Fragment::HeaderIn(name.to_ascii_lowercase()),
                        Some('o') => Fragment::HeaderOut(name.to_ascii_lowercase()),
                        other => bail!(
                            "%{{{name}}} must be followed by 'i' or 'o', found {other:?}"
                        ),
                    }
                }
                other => bail!("unknown access log directive %{other}"),
            };
            fragments.push(fragment);
        }
        if !literal.is_empty() {
            fragments.push(Fragment::Literal(literal));
        }
        Ok(Self { fragments })
    }

    pub fn render(&self, record: &LogRecord<'_>) -> String {
        let mut out = String::with_capacity(96);
        for fragment in &self.fragments {
            match fragment {
                Fragment::Literal(s) => out.push_str(s),
                Fragment::RemoteHost => {
                    let _ = write!(out, "{}", record.remote.ip());
                }
                Fragment::Ident => out.push('-'),
                Fragment::User => out.push_str(record.user.unwrap_or("-")),
                Fragment::Time => {
                    let _ = write!(out, "[{}]", record.time.format("%d/%b/%Y:%H:%M:%S %z"));
                }
                Fragment::RequestLine => {
                    let _ = write!(
                        out,
                        "{} {} {}",
                        record.method, record.target, record.version
                    );
                }
                Fragment::Status => {
                    let _ = write!(out, "{}", record.status);
                }
                Fragment::BytesClf => {
                    if record.bytes == 0 {
                        out.push('-');
                    } else {
                        let _ = write!(out, "{}", record.bytes);
                    }
                }
                Fragment::Bytes => {
                    let _ = write!(out, "{}", record.bytes);
                }
                Fragment::HeaderIn(name) => {
                    push_header(&mut out, record.request_headers, name);
                }
                Fragment::HeaderOut(name) => {
                    push_header(&mut out, record.response_headers, name);
                }
                Fragment::DurationMicros => {
                    let _ = write!(out, "{}", record.duration.as_micros());
                }
                Fragment::DurationSecs => {
                    let _ = write!(out, "{}", record.duration.as_secs());
                }
                Fragment::Pid => {
                    let _ = write!(out, "{}", std::process::id());
                }
            }
        }
        out
    }
}

fn push_header(out: &mut String, headers: &HeaderMap, name: &str) {
    match headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(value) => out.push_str(value),
        None => out.push('-'),
    }
}

/// A compiled format bound to its sink.
pub struct AccessLog {
    format: LogFormat,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    pub fn open(settings: &AccessLogSettings) -> anyhow::Result<Self> {
        let format = LogFormat::compile(&settings.format)?;
        let sink: Box<dyn Write + Send> = match &settings.target {
            AccessLogTarget::Stderr => Box::new(std::io::stderr()),
            AccessLogTarget::File(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        anyhow::anyhow!("cannot open access log {}: {e}", path.display())
                    })?,
            ),
        };
        Ok(Self {
            format,
            sink: Mutex::new(sink),
        })
    }

    pub fn log(&self, record: &LogRecord<'_>) {
        let line = self.format.render(record);
        let mut sink = self.sink.lock().unwrap();
        // A failed write is not worth killing a request over.
        let _ = writeln!(sink, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn record<'a>(req: &'a HeaderMap, res: &'a HeaderMap) -> LogRecord<'a> {
        LogRecord {
            remote: "192.0.2.7:55000".parse().unwrap(),
            user: None,
            time: Local::now(),
            method: "GET",
            target: "/widgets?page=2",
            version: "HTTP/1.1",
            status: 200,
            bytes: 1234,
            duration: Duration::from_millis(5),
            request_headers: req,
            response_headers: res,
        }
    }

    #[test]
    fn common_format_renders_all_fields() {
        let format = LogFormat::compile(COMMON_FORMAT).unwrap();
        let (req, res) = (HeaderMap::new(), HeaderMap::new());
        let line = format.render(&record(&req, &res));
        assert!(line.starts_with("192.0.2.7 - - ["), "{line}");
        assert!(line.contains("\"GET /widgets?page=2 HTTP/1.1\" 200 1234"), "{line}");
    }

    #[test]
    fn clf_bytes_renders_dash_for_zero() {
        let format = LogFormat::compile("%b %B").unwrap();
        let (req, res) = (HeaderMap::new(), HeaderMap::new());
        let mut rec = record(&req, &res);
        rec.bytes = 0;
        assert_eq!(format.render(&rec), "- 0");
    }

    #[test]
    fn header_directives_look_up_case_insensitively() {
        let format = LogFormat::compile("%{User-Agent}i|%{X-Served-By}o").unwrap();
        let mut req = HeaderMap::new();
        req.insert("user-agent", HeaderValue::from_static("curl/8"));
        let res = HeaderMap::new();
        assert_eq!(format.render(&record(&req, &res)), "curl/8|-");
    }

    #[test]
    fn unknown_directive_is_rejected() {
        assert!(LogFormat::compile("%q").is_err());
        assert!(LogFormat::compile("%{name}z").is_err());
        assert!(LogFormat::compile("trailing %").is_err());
    }

    #[test]
    fn duration_directives_render() {
        let format = LogFormat::compile("%D %T").unwrap();
        let (req, res) = (HeaderMap::new(), HeaderMap::new());
        assert_eq!(format.render(&record(&req, &res)), "5000 0");
    }

    #[test]
    fn escaped_percent_is_literal() {
        let format = LogFormat::compile("100%% %s").unwrap();
        let (req, res) = (HeaderMap::new(), HeaderMap::new());
        assert_eq!(format.render(&record(&req, &res)), "100% 200");
    }
}
