//! Visibility rules for non-duplicate entries.
//!
//! Rules come in two flavours. When any *include* rule is enabled an entry
//! must match at least one of them; a matching *exclude* rule then hides it
//! regardless. With no enabled rules everything is visible.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use lru::LruCache;
use regex::{Regex, RegexBuilder};

use crate::feed::EntryDraft;
use crate::storage::{FilterRule, MatchType, RuleType};

/// Compiled programs above this size are rejected as invalid patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// An immutable, ordered set of enabled rules.
///
/// The version changes whenever the rule set does, and keys the regex cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleSet {
    version: u64,
    rules: Vec<FilterRule>,
}

impl RuleSet {
    fn new(rules: Vec<FilterRule>, version: u64) -> Self {
        Self {
            version,
            rules: active_rules(rules),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Enabled rules, highest priority first.
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn active_rules(mut rules: Vec<FilterRule>) -> Vec<FilterRule> {
    rules.retain(|r| r.enabled);
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    rules
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDecision {
    pub visible: bool,
    /// The rule that decided: the exclude that hid the entry, or the first
    /// include that admitted it.
    pub matched_rule: Option<i64>,
}

struct RegexCache {
    version: u64,
    compiled: LruCache<(i64, u64), Option<Arc<Regex>>>,
    warned: HashSet<i64>,
}

/// Evaluates drafts against the current [`RuleSet`].
///
/// Safe to share between concurrent cycles. Each cycle should evaluate its
/// whole batch against one [`snapshot`](Self::snapshot).
pub struct FilterEngine {
    rules: RwLock<Arc<RuleSet>>,
    regex_cache: Mutex<RegexCache>,
}

impl FilterEngine {
    pub fn new(rules: Vec<FilterRule>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            rules: RwLock::new(Arc::new(RuleSet::new(rules, 1))),
            regex_cache: Mutex::new(RegexCache {
                version: 1,
                compiled: LruCache::new(capacity),
                warned: HashSet::new(),
            }),
        }
    }

    /// Swap in a new rule list.
    ///
    /// Returns `false` (and keeps the current version) when the enabled rules
    /// are unchanged.
    pub fn replace_rules(&self, rules: Vec<FilterRule>) -> bool {
        let rules = active_rules(rules);
        let mut current = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if current.rules == rules {
            return false;
        }

        let version = current.version + 1;
        tracing::debug!(version, rules = rules.len(), "Filter rules changed");
        *current = Arc::new(RuleSet { version, rules });
        true
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Whether `draft` is visible under the current rules.
    pub fn evaluate(&self, draft: &EntryDraft) -> bool {
        self.evaluate_in(&self.snapshot(), draft).visible
    }

    pub fn evaluate_in(&self, set: &RuleSet, draft: &EntryDraft) -> FilterDecision {
        if set.is_empty() {
            return FilterDecision {
                visible: true,
                matched_rule: None,
            };
        }

        let haystack = Haystack::new(draft);
        let mut admitted_by = None;

        let mut includes = set
            .rules
            .iter()
            .filter(|r| r.match_type == MatchType::Include)
            .peekable();
        if includes.peek().is_some() {
            admitted_by = includes
                .find(|rule| self.matches(set.version, rule, &haystack))
                .map(|rule| rule.id);
            if admitted_by.is_none() {
                return FilterDecision {
                    visible: false,
                    matched_rule: None,
                };
            }
        }

        let excluded_by = set
            .rules
            .iter()
            .filter(|r| r.match_type == MatchType::Exclude)
            .find(|rule| self.matches(set.version, rule, &haystack));

        match excluded_by {
            Some(rule) => FilterDecision {
                visible: false,
                matched_rule: Some(rule.id),
            },
            None => FilterDecision {
                visible: true,
                matched_rule: admitted_by,
            },
        }
    }

    fn matches(&self, version: u64, rule: &FilterRule, haystack: &Haystack<'_>) -> bool {
        let pattern = rule.pattern.trim();
        if pattern.is_empty() {
            return false;
        }

        match rule.rule_type {
            RuleType::Keyword => haystack.lowered.contains(&pattern.to_lowercase()),
            RuleType::Regex => self
                .compiled(version, rule)
                .is_some_and(|re| re.is_match(&haystack.text)),
            RuleType::Tag => {
                let pattern = pattern.to_lowercase();
                haystack.draft.tags.iter().any(|t| t.to_lowercase() == pattern)
            }
            RuleType::Language => haystack
                .draft
                .language
                .as_deref()
                .is_some_and(|lang| lang.eq_ignore_ascii_case(pattern)),
        }
    }

    /// Compiled regex for `rule` under `version`; `None` for invalid patterns.
    fn compiled(&self, version: u64, rule: &FilterRule) -> Option<Arc<Regex>> {
        let mut cache = self
            .regex_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if cache.version != version {
            cache.version = version;
            cache.compiled.clear();
            cache.warned.clear();
        }

        let key = (rule.id, version);
        if let Some(compiled) = cache.compiled.get(&key) {
            return compiled.clone();
        }

        let compiled = match RegexBuilder::new(rule.pattern.trim())
            .case_insensitive(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
        {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                if cache.warned.insert(rule.id) {
                    tracing::warn!(
                        rule_id = rule.id,
                        rule = %rule.name,
                        error = %e,
                        "Invalid filter regex, rule will never match"
                    );
                }
                None
            }
        };
        cache.compiled.put(key, compiled.clone());
        compiled
    }

    #[cfg(test)]
    fn cached_regexes(&self) -> usize {
        self.regex_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .compiled
            .len()
    }
}

/// The text rules search, built once per evaluation.
struct Haystack<'a> {
    draft: &'a EntryDraft,
    text: String,
    lowered: String,
}

impl<'a> Haystack<'a> {
    fn new(draft: &'a EntryDraft) -> Self {
        let text = [
            Some(draft.title.as_str()),
            draft.summary.as_deref(),
            draft.content.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("\n");
        let lowered = text.to_lowercase();
        Self {
            draft,
            text,
            lowered,
        }
    }
}
