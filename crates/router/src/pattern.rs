//! Path pattern compilation.
//!
//! One tokenizer handles every template form:
//!
//! * a literal segment is regex-escaped;
//! * `:name` or `{name}` captures one segment (`[^/]+`);
//! * `{name:pattern}` captures with an inline constraint;
//! * `*name` captures the rest of the path (`.+`) and must be the final
//!   segment, at most once per template.
//!
//! Compilation yields an anchored regex with named groups, the ordered
//! capture names, and the inline constraints, which are re-checked alongside
//! any chained constraints after a regex match.

use std::collections::HashMap;

use pagi_protocol::PathParams;
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("route template {template:?}: {detail}")]
    InvalidTemplate { template: String, detail: String },
    #[error("route template {template:?}: constraint for {name:?} is not a valid regex: {source}")]
    InvalidConstraint {
        template: String,
        name: String,
        source: regex::Error,
    },
    #[error("no value for parameter {name:?} expanding route {template:?}")]
    MissingParam { template: String, name: String },
}

/// One piece of a compiled template, kept for URL generation.
#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    /// `:name`, `{name}` or `{name:pattern}`: one segment.
    Param(String),
    /// `*name`: the rest of the path.
    Wildcard(String),
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct Pattern {
    template: String,
    regex: Regex,
    tokens: Vec<Token>,
    captures: Vec<String>,
    inline_constraints: Vec<(String, Regex)>,
}

fn valid_capture_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl Pattern {
    pub fn compile(template: &str) -> Result<Self, PatternError> {
        let invalid = |detail: &str| PatternError::InvalidTemplate {
            template: template.to_string(),
            detail: detail.to_string(),
        };

        if !template.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut regex_src = String::from("^");
        let mut tokens = Vec::new();
        let mut captures: Vec<String> = Vec::new();
        let mut inline_constraints = Vec::new();
        let mut saw_wildcard = false;

        let segments: Vec<&str> = template[1..].split('/').collect();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if saw_wildcard {
                return Err(invalid("'*name' must be the final segment"));
            }
            regex_src.push('/');

            let mut push_capture = |name: &str,
                                    group: &str,
                                    regex_src: &mut String|
             -> Result<(), PatternError> {
                if !valid_capture_name(name) {
                    return Err(invalid("unnamed or invalid capture name"));
                }
                if captures.iter().any(|c| c == name) {
                    return Err(invalid(&format!("duplicate capture name {name:?}")));
                }
                regex_src.push_str(&format!("(?P<{name}>{group})"));
                captures.push(name.to_string());
                Ok(())
            };

            if let Some(name) = segment.strip_prefix(':') {
                push_capture(name, "[^/]+", &mut regex_src)?;
                tokens.push(Token::Param(name.to_string()));
            } else if let Some(name) = segment.strip_prefix('*') {
                if i != last {
                    return Err(invalid("'*name' must be the final segment"));
                }
                push_capture(name, ".+", &mut regex_src)?;
                tokens.push(Token::Wildcard(name.to_string()));
                saw_wildcard = true;
            } else if segment.starts_with('{') && segment.ends_with('}') {
                let inner = &segment[1..segment.len() - 1];
                match inner.split_once(':') {
                    Some((name, pattern)) => {
                        push_capture(name, pattern, &mut regex_src)?;
                        let compiled = Regex::new(&format!("^(?:{pattern})$")).map_err(
                            |source| PatternError::InvalidConstraint {
                                template: template.to_string(),
                                name: name.to_string(),
                                source,
                            },
                        )?;
                        inline_constraints.push((name.to_string(), compiled));
                        tokens.push(Token::Param(name.to_string()));
                    }
                    None => {
                        push_capture(inner, "[^/]+", &mut regex_src)?;
                        tokens.push(Token::Param(inner.to_string()));
                    }
                }
            } else {
                regex_src.push_str(&regex::escape(segment));
                tokens.push(Token::Literal(segment.to_string()));
            }
        }
        regex_src.push('$');

        let regex = Regex::new(&regex_src).map_err(|e| PatternError::InvalidTemplate {
            template: template.to_string(),
            detail: e.to_string(),
        })?;

        Ok(Self {
            template: template.to_string(),
            regex,
            tokens,
            captures,
            inline_constraints,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn capture_names(&self) -> &[String] {
        &self.captures
    }

    pub fn inline_constraints(&self) -> &[(String, Regex)] {
        &self.inline_constraints
    }

    /// Match a concrete path, returning captures in template order.
    ///
    /// Inline constraints are already part of the regex; they are re-checked
    /// here together so chained constraints (validated by the caller) and
    /// inline ones share one code path.
    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut params = PathParams::new();
        for name in &self.captures {
            let value = caps.name(name)?.as_str();
            params.insert(name.clone(), value);
        }
        for (name, constraint) in &self.inline_constraints {
            if !constraint.is_match(params.get(name)?) {
                return None;
            }
        }
        Some(params)
    }

    /// Substitute parameter values into the template. Values are not
    /// validated against constraints.
    pub fn expand(&self, params: &HashMap<String, String>) -> Result<String, PatternError> {
        let mut out = String::new();
        for token in &self.tokens {
            out.push('/');
            match token {
                Token::Literal(lit) => out.push_str(lit),
                Token::Param(name) | Token::Wildcard(name) => {
                    let value =
                        params
                            .get(name)
                            .ok_or_else(|| PatternError::MissingParam {
                                template: self.template.clone(),
                                name: name.clone(),
                            })?;
                    out.push_str(value);
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literal_template_matches_exactly() {
        let p = Pattern::compile("/health").unwrap();
        assert!(p.match_path("/health").is_some());
        assert!(p.match_path("/health/").is_none());
        assert!(p.match_path("/healthz").is_none());
    }

    #[test]
    fn colon_and_brace_forms_are_equivalent() {
        for template in ["/users/:id", "/users/{id}"] {
            let p = Pattern::compile(template).unwrap();
            let m = p.match_path("/users/42").unwrap();
            assert_eq!(m.get("id"), Some("42"));
            assert!(p.match_path("/users/42/posts").is_none());
            assert!(p.match_path("/users/").is_none());
        }
    }

    #[test]
    fn inline_constraint_restricts_matches() {
        let p = Pattern::compile(r"/users/{id:\d+}").unwrap();
        assert_eq!(p.match_path("/users/42").unwrap().get("id"), Some("42"));
        assert!(p.match_path("/users/abc").is_none());
        assert_eq!(p.inline_constraints().len(), 1);
    }

    #[test]
    fn wildcard_captures_rest_of_path() {
        let p = Pattern::compile("/static/*path").unwrap();
        let m = p.match_path("/static/css/site.css").unwrap();
        assert_eq!(m.get("path"), Some("css/site.css"));
        assert!(p.match_path("/static/").is_none());
    }

    #[test]
    fn wildcard_must_be_last() {
        assert!(matches!(
            Pattern::compile("/files/*rest/meta"),
            Err(PatternError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn unnamed_captures_are_rejected() {
        for template in ["/a/:", "/a/*", "/a/{}", "/a/{:\\d+}"] {
            assert!(Pattern::compile(template).is_err(), "{template} accepted");
        }
    }

    #[test]
    fn duplicate_capture_names_are_rejected() {
        assert!(Pattern::compile("/a/{x}/b/{x}").is_err());
    }

    #[test]
    fn regex_metacharacters_in_literals_are_escaped() {
        let p = Pattern::compile("/v1.0/items").unwrap();
        assert!(p.match_path("/v1.0/items").is_some());
        assert!(p.match_path("/v1x0/items").is_none());
    }

    #[test]
    fn expand_is_the_inverse_of_matching() {
        let p = Pattern::compile(r"/users/{id:\d+}/files/*path").unwrap();
        let url = p
            .expand(&params(&[("id", "7"), ("path", "a/b.txt")]))
            .unwrap();
        assert_eq!(url, "/users/7/files/a/b.txt");
        let m = p.match_path(&url).unwrap();
        assert_eq!(m.get("id"), Some("7"));
        assert_eq!(m.get("path"), Some("a/b.txt"));
    }

    #[test]
    fn expand_reports_missing_params() {
        let p = Pattern::compile("/users/:id").unwrap();
        assert!(matches!(
            p.expand(&HashMap::new()),
            Err(PatternError::MissingParam { .. })
        ));
    }
}
