//! Mock rule configuration.

use crate::error::MockResolutionError;
use crate::resolver::{MockAction, MockResponse, MockRule, PathPattern, RuleMatcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockRuleConfig {
    pub id: String,
    /// Lower values are checked first
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "match", default)]
    pub match_config: MatchConfig,
    /// Substitute URL; `{name}` placeholders take path captures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond: Option<RespondConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MatchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Exact host or `*.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub path: PathMatch,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(untagged)]
pub enum PathMatch {
    #[default]
    Any,
    Exact {
        exact: String,
    },
    Prefix {
        prefix: String,
    },
    /// Radix router syntax: `/users/{id}`, `/files/{*rest}`
    Pattern {
        pattern: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RespondConfig {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// JSON body; sets `content-type: application/json` unless given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

fn default_status() -> u16 {
    200
}

impl PathMatch {
    fn to_pattern(&self) -> PathPattern {
        match self {
            PathMatch::Any => PathPattern::Any,
            PathMatch::Exact { exact } => PathPattern::Exact(exact.clone()),
            PathMatch::Prefix { prefix } => PathPattern::Prefix(prefix.clone()),
            PathMatch::Pattern { pattern } => PathPattern::Template(pattern.clone()),
        }
    }
}

impl RespondConfig {
    fn to_response(&self) -> Result<MockResponse, anyhow::Error> {
        let mut response = MockResponse::new(self.status);
        for (name, value) in &self.headers {
            response = response.with_header(name.as_str(), value.as_str());
        }

        match &self.json {
            Some(json) => {
                if !self.body.is_empty() {
                    anyhow::bail!("'body' and 'json' are mutually exclusive");
                }
                if !response.headers.contains("content-type") {
                    response = response.with_header("content-type", "application/json");
                }
                Ok(response.with_body(serde_json::to_vec(json)?))
            }
            None => Ok(response.with_body(self.body.clone())),
        }
    }
}

impl MockRuleConfig {
    /// Build the resolver rule this entry describes.
    pub fn to_rule(&self) -> Result<MockRule, anyhow::Error> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Mock rule id must not be empty");
        }

        let mut matcher = RuleMatcher::new(self.match_config.path.to_pattern());
        if let Some(method) = &self.match_config.method {
            // Config accepts `get` as well as `GET`
            let method = method
                .to_ascii_uppercase()
                .parse()
                .map_err(|_| MockResolutionError::InvalidMethod {
                    rule_id: self.id.clone(),
                    method: method.clone(),
                })?;
            matcher = matcher.method(method);
        }
        if let Some(host) = &self.match_config.host {
            matcher = matcher.host(host.as_str());
        }

        let action = match (&self.redirect, &self.respond) {
            (Some(url), None) => MockAction::Redirect { url: url.clone() },
            (None, Some(respond)) => MockAction::Respond(
                respond
                    .to_response()
                    .map_err(|e| anyhow::anyhow!("Mock rule '{}': {}", self.id, e))?,
            ),
            (Some(_), Some(_)) => anyhow::bail!(
                "Mock rule '{}' defines both 'redirect' and 'respond'; choose one",
                self.id
            ),
            (None, None) => anyhow::bail!(
                "Mock rule '{}' needs either 'redirect' or 'respond'",
                self.id
            ),
        };

        Ok(MockRule::new(self.id.clone(), matcher, action).with_priority(self.priority))
    }
}
