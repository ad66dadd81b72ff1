//! Mock resolver: decides whether a canonical request is answered by a mock.
//!
//! The active rule set is an immutable [`RuleSet`] behind an `Arc`. Lookups
//! clone the `Arc` under a brief read lock and then match without any lock
//! held, so an in-flight lookup sees either the previous or the next rule
//! set in full. Administrative changes build a new set and swap it in;
//! writers are serialized so concurrent add/remove never lose an update.
//!
//! # Matching
//!
//! First rule in priority order (lower `priority` first, then insertion
//! order) whose method, host and path pattern all match. Path patterns are
//! exact, prefix, or parameterized templates (`/users/{id}`) backed by a
//! radix router.

mod rule;

pub use rule::{MockAction, MockResponse, MockRule, PathPattern, RuleMatcher};

use crate::error::{MockResolutionError, RuleSetError};
use crate::model::Request;
use parking_lot::{Mutex, RwLock};
use rule::{fill_placeholders, CompiledRule};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Substitute produced for a matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTarget {
    /// Dial this URL instead of the original
    Redirect(Url),
    /// Serve this response from the local mock endpoint
    Literal(MockResponse),
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub rule: Arc<MockRule>,
    pub target: MockTarget,
    /// Captures from a template path pattern
    pub params: Vec<(String, String)>,
    /// Generation of the rule set that answered
    pub generation: u64,
}

/// One immutable generation of mock rules, sorted for lookup.
pub struct RuleSet {
    rules: Vec<Arc<CompiledRule>>,
    generation: u64,
}

impl RuleSet {
    fn empty() -> Self {
        Self {
            rules: Vec::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in lookup order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<MockRule>> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    pub fn resolve(&self, request: &Request) -> Result<Option<Resolution>, MockResolutionError> {
        for compiled in &self.rules {
            let Some(params) = compiled.matches(request) else {
                continue;
            };
            let rule = Arc::clone(&compiled.rule);
            debug!(
                "Mock rule '{}' matched {} {}",
                rule.id,
                request.method(),
                request.url()
            );

            let target = match &rule.action {
                MockAction::Redirect { url } => {
                    let filled = fill_placeholders(url, &params);
                    let target = Url::parse(&filled).map_err(|e| MockResolutionError::InvalidUrl {
                        rule_id: rule.id.clone(),
                        url: filled.clone(),
                        reason: e.to_string(),
                    })?;
                    MockTarget::Redirect(target)
                }
                MockAction::Respond(response) => MockTarget::Literal(response.clone()),
            };

            return Ok(Some(Resolution {
                rule,
                target,
                params,
                generation: self.generation,
            }));
        }
        Ok(None)
    }
}

/// Compile `rule` without installing it.
pub fn check_rule(rule: &MockRule) -> Result<(), MockResolutionError> {
    CompiledRule::compile(rule.clone(), 0).map(|_| ())
}

/// Copy-on-write mock rule store.
pub struct MockResolver {
    active: RwLock<Arc<RuleSet>>,
    /// Serializes writers; readers never take it
    admin: Mutex<()>,
    next_seq: AtomicU64,
}

impl MockResolver {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(RuleSet::empty())),
            admin: Mutex::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Create a resolver with an initial rule set.
    pub fn with_rules(rules: Vec<MockRule>) -> Result<Self, RuleSetError> {
        let resolver = Self::new();
        resolver.replace_rules(rules)?;
        Ok(resolver)
    }

    /// The current rule set. Holding it keeps that generation alive.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.active.read().clone()
    }

    pub fn resolve(&self, request: &Request) -> Result<Option<Resolution>, MockResolutionError> {
        self.snapshot().resolve(request)
    }

    /// Atomically replace every rule. Nothing changes if any rule is invalid.
    pub fn replace_rules(&self, rules: Vec<MockRule>) -> Result<u64, RuleSetError> {
        let _guard = self.admin.lock();
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if !seen.insert(rule.id.clone()) {
                return Err(RuleSetError::DuplicateRule(rule.id));
            }
            compiled.push(Arc::new(self.compile(rule)?));
        }
        Ok(self.install(compiled))
    }

    pub fn add_rule(&self, rule: MockRule) -> Result<u64, RuleSetError> {
        let _guard = self.admin.lock();
        let current = self.snapshot();
        if current.rules().any(|r| r.id == rule.id) {
            return Err(RuleSetError::DuplicateRule(rule.id));
        }
        let mut compiled = current.rules.clone();
        compiled.push(Arc::new(self.compile(rule)?));
        Ok(self.install(compiled))
    }

    pub fn remove_rule(&self, id: &str) -> Result<Arc<MockRule>, RuleSetError> {
        let _guard = self.admin.lock();
        let current = self.snapshot();
        let position = current
            .rules
            .iter()
            .position(|c| c.rule.id == id)
            .ok_or_else(|| RuleSetError::RuleNotFound(id.to_string()))?;
        let mut compiled = current.rules.clone();
        let removed = compiled.remove(position);
        self.install(compiled);
        Ok(Arc::clone(&removed.rule))
    }

    /// Remove every rule, returning the new generation.
    pub fn clear(&self) -> u64 {
        let _guard = self.admin.lock();
        self.install(Vec::new())
    }

    /// Rules in lookup order.
    pub fn rules(&self) -> Vec<Arc<MockRule>> {
        self.snapshot().rules().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    fn compile(&self, rule: MockRule) -> Result<CompiledRule, MockResolutionError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        CompiledRule::compile(rule, seq)
    }

    /// Caller holds the admin lock.
    fn install(&self, mut rules: Vec<Arc<CompiledRule>>) -> u64 {
        rules.sort_by_key(|c| (c.rule.priority, c.seq));
        let mut active = self.active.write();
        let generation = active.generation + 1;
        let count = rules.len();
        *active = Arc::new(RuleSet { rules, generation });
        drop(active);
        info!(
            "Mock rule set installed: {} rules (generation {})",
            count, generation
        );
        generation
    }
}

impl Default for MockResolver {
    fn default() -> Self {
        Self::new()
    }
}
