//! Mock rule definitions and their compiled matchers.

use crate::error::{ConversionError, MockResolutionError};
use crate::model::{Headers, Method, Request};
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;
use matchit::Router;
use std::sync::Arc;

/// Path matching strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// Matches any path
    Any,
    Exact(String),
    /// Plain string prefix (`/api` matches `/api/users` and `/apiary`)
    Prefix(String),
    /// Parameterized segments in radix router syntax: `/users/{id}`,
    /// `/files/{*rest}`
    Template(String),
}

impl PathPattern {
    pub fn as_str(&self) -> &str {
        match self {
            PathPattern::Any => "*",
            PathPattern::Exact(p) | PathPattern::Prefix(p) | PathPattern::Template(p) => p,
        }
    }
}

/// What a rule matches on. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatcher {
    pub method: Option<Method>,
    /// Exact host (case-insensitive) or a `*.example.com` wildcard
    pub host: Option<String>,
    pub path: PathPattern,
}

impl RuleMatcher {
    pub fn new(path: PathPattern) -> Self {
        Self {
            method: None,
            host: None,
            path,
        }
    }

    pub fn any() -> Self {
        Self::new(PathPattern::Any)
    }

    pub fn exact(path: impl Into<String>) -> Self {
        Self::new(PathPattern::Exact(path.into()))
    }

    pub fn prefix(path: impl Into<String>) -> Self {
        Self::new(PathPattern::Prefix(path.into()))
    }

    pub fn template(path: impl Into<String>) -> Self {
        Self::new(PathPattern::Template(path.into()))
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    fn matches_host(&self, request: &Request) -> bool {
        let Some(pattern) = &self.host else {
            return true;
        };
        let Some(host) = request.url().host_str() else {
            return false;
        };
        match pattern.strip_prefix("*.") {
            Some(suffix) => {
                host.len() > suffix.len()
                    && host.to_ascii_lowercase().ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
            }
            None => host.eq_ignore_ascii_case(pattern),
        }
    }
}

/// Literal response served by the local mock endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status and headers as `http` types.
    pub(crate) fn to_parts(&self) -> Result<(StatusCode, HeaderMap), ConversionError> {
        let status =
            StatusCode::from_u16(self.status).map_err(|_| ConversionError::InvalidStatus(self.status))?;
        Ok((status, self.headers.to_header_map()?))
    }

    fn validate(&self) -> Result<(), ConversionError> {
        self.to_parts().map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAction {
    /// Dial this URL instead. `{name}` placeholders are filled from
    /// template path captures.
    Redirect { url: String },
    /// Answer with a literal response through the local mock endpoint.
    Respond(MockResponse),
}

/// An administrator-defined mock rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRule {
    pub id: String,
    /// Lower values are checked first; ties keep insertion order
    pub priority: u32,
    pub matcher: RuleMatcher,
    pub action: MockAction,
}

impl MockRule {
    pub fn new(id: impl Into<String>, matcher: RuleMatcher, action: MockAction) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            matcher,
            action,
        }
    }

    pub fn redirect(id: impl Into<String>, matcher: RuleMatcher, url: impl Into<String>) -> Self {
        Self::new(id, matcher, MockAction::Redirect { url: url.into() })
    }

    pub fn respond(id: impl Into<String>, matcher: RuleMatcher, response: MockResponse) -> Self {
        Self::new(id, matcher, MockAction::Respond(response))
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

enum CompiledPath {
    Any,
    Exact(String),
    Prefix(String),
    Template(Router<()>),
}

/// A rule ready for lookups. Shared between rule-set generations.
pub(crate) struct CompiledRule {
    pub(crate) rule: Arc<MockRule>,
    pub(crate) seq: u64,
    path: CompiledPath,
}

impl CompiledRule {
    pub(crate) fn compile(rule: MockRule, seq: u64) -> Result<Self, MockResolutionError> {
        let path = match &rule.matcher.path {
            PathPattern::Any => CompiledPath::Any,
            PathPattern::Exact(p) => CompiledPath::Exact(p.clone()),
            PathPattern::Prefix(p) => CompiledPath::Prefix(p.clone()),
            PathPattern::Template(p) => {
                let mut router = Router::new();
                router
                    .insert(p.as_str(), ())
                    .map_err(|e| MockResolutionError::InvalidPattern {
                        rule_id: rule.id.clone(),
                        pattern: p.clone(),
                        reason: e.to_string(),
                    })?;
                CompiledPath::Template(router)
            }
        };

        if let MockAction::Redirect { url } = &rule.action {
            // Placeholders are filled per request; the rest must already parse
            url::Url::parse(&blank_placeholders(url)).map_err(|e| {
                MockResolutionError::InvalidUrl {
                    rule_id: rule.id.clone(),
                    url: url.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let MockAction::Respond(response) = &rule.action {
            response.validate().map_err(|e| MockResolutionError::InvalidResponse {
                rule_id: rule.id.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            rule: Arc::new(rule),
            seq,
            path,
        })
    }

    /// Path captures when the rule matches `request`.
    pub(crate) fn matches(&self, request: &Request) -> Option<Vec<(String, String)>> {
        let matcher = &self.rule.matcher;
        if let Some(method) = &matcher.method {
            if method != request.method() {
                return None;
            }
        }
        if !matcher.matches_host(request) {
            return None;
        }

        let path = request.url().path();
        match &self.path {
            CompiledPath::Any => Some(Vec::new()),
            CompiledPath::Exact(exact) => (path == exact.as_str()).then(Vec::new),
            CompiledPath::Prefix(prefix) => path.starts_with(prefix.as_str()).then(Vec::new),
            CompiledPath::Template(router) => router.at(path).ok().map(|matched| {
                matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            }),
        }
    }
}

/// Replace `{name}` / `{*name}` placeholders with captured values.
pub(crate) fn fill_placeholders(template: &str, params: &[(String, String)]) -> String {
    let mut out = template.to_string();
    for (name, value) in params {
        out = out
            .replace(&format!("{{{name}}}"), value)
            .replace(&format!("{{*{name}}}"), value);
    }
    out
}

fn blank_placeholders(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut in_placeholder = false;
    for c in template.chars() {
        match c {
            '{' => in_placeholder = true,
            '}' if in_placeholder => {
                in_placeholder = false;
                out.push('x');
            }
            _ if in_placeholder => {}
            _ => out.push(c),
        }
    }
    out
}
