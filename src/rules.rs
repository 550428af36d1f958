//! Cache-key rewrite rules.
//!
//! The proxy turns every network path (`host/path?query`) into a relative
//! cache key through a [`Rewrite`] implementation. [`RewriteRules`] is the
//! regex based one configured from settings: `join` rules map many network
//! paths onto one shared location (first match wins), `rewrite` rules then
//! edit the result in order.

use std::fmt::Debug;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Maps a network path onto a relative cache key.
pub trait Rewrite: Send + Sync + Debug {
    fn rewrite(&self, netpath: &str) -> String;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    replacement: String,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self> {
        let pattern = Regex::new(&config.pattern)
            .with_context(|| format!("invalid rule pattern '{}'", config.pattern))?;
        Ok(Self {
            pattern,
            replacement: expand_group_refs(&config.replacement),
        })
    }

    fn apply(&self, input: &str) -> Option<String> {
        if !self.pattern.is_match(input) {
            return None;
        }
        Some(
            self.pattern
                .replacen(input, 1, self.replacement.as_str())
                .into_owned(),
        )
    }
}

/// Converts bare `$N` group references into `${N}` so that a reference
/// directly followed by text (`$1abc`) still resolves to group 1.
fn expand_group_refs(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len() + 8);
    let mut chars = replacement.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let mut digits = String::new();
        while let Some(next) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(next);
            chars.next();
        }
        if digits.is_empty() {
            out.push('$');
        } else {
            out.push_str("${");
            out.push_str(&digits);
            out.push('}');
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct RewriteRules {
    join: Vec<Rule>,
    rewrite: Vec<Rule>,
}

impl RewriteRules {
    pub fn compile(join: &[RuleConfig], rewrite: &[RuleConfig]) -> Result<Self> {
        let join = join.iter().map(Rule::compile).collect::<Result<Vec<_>>>()?;
        let rewrite = rewrite
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { join, rewrite })
    }

    pub fn len(&self) -> usize {
        self.join.len() + self.rewrite.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Rewrite for RewriteRules {
    fn rewrite(&self, netpath: &str) -> String {
        let mut path = self
            .join
            .iter()
            .find_map(|rule| rule.apply(netpath))
            .unwrap_or_else(|| netpath.to_string());
        for rule in &self.rewrite {
            if let Some(next) = rule.apply(&path) {
                path = next;
            }
        }
        path.trim_start_matches('/').to_string()
    }
}
