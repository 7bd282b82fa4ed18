// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Identifier rewrite rules.
//!
//! A [`RewriteTable`] maps original frame identifiers to the identifiers
//! used when the frame is retransmitted. Submitting a rule for an
//! `original_id` that already exists replaces the previous rule (last write
//! wins); the replaced rule keeps its display position.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use crate::frame::EXTENDED_ID_MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid identifier '{value}': {reason}")]
    InvalidFormat { value: String, reason: String },
    #[error("invalid identifier in row {}: {source}", .row + 1)]
    Row {
        row: usize,
        #[source]
        source: Box<RuleError>,
    },
    #[error("no rule for identifier 0x{0:X}")]
    NotFound(u32),
}

impl RuleError {
    fn invalid(value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Check that a raw identifier is non-negative and fits in 29 bits.
pub fn validate_id(raw: i64) -> Result<u32, RuleError> {
    if raw < 0 {
        return Err(RuleError::invalid(raw, "identifier must not be negative"));
    }
    if raw > i64::from(EXTENDED_ID_MAX) {
        return Err(RuleError::invalid(raw, "identifier exceeds 29 bits"));
    }
    Ok(raw as u32)
}

/// Parse a hexadecimal identifier such as `1A0`, `0x1A0` or `-5`.
pub fn parse_hex_id(text: &str) -> Result<u32, RuleError> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(RuleError::invalid(text, "expected a hexadecimal value"));
    }
    let magnitude = i64::from_str_radix(digits, 16)
        .map_err(|_| RuleError::invalid(text, "expected a hexadecimal value"))?;
    validate_id(if negative { -magnitude } else { magnitude })
}

/// A single `original_id -> rewritten_id` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewriteRule {
    pub original_id: u32,
    pub rewritten_id: u32,
}

impl RewriteRule {
    /// Build a rule from raw integers, validating both identifiers.
    pub fn new(original_id: i64, rewritten_id: i64) -> Result<Self, RuleError> {
        Ok(Self {
            original_id: validate_id(original_id)?,
            rewritten_id: validate_id(rewritten_id)?,
        })
    }

    /// Re-check a rule built by struct literal.
    pub fn validate(&self) -> Result<(), RuleError> {
        validate_id(i64::from(self.original_id))?;
        validate_id(i64::from(self.rewritten_id))?;
        Ok(())
    }
}

/// Ordered collection of rewrite rules with unique `original_id`s.
#[derive(Debug, Clone, Default)]
pub struct RewriteTable {
    rules: Vec<RewriteRule>,
    index: HashMap<u32, u32>,
}

impl RewriteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(original, rewritten)` hexadecimal text rows.
    ///
    /// Rows with both cells blank are skipped. The first malformed row
    /// aborts parsing with its 0-based index.
    pub fn parse_hex_rows<S: AsRef<str>>(rows: &[(S, S)]) -> Result<Self, RuleError> {
        let mut table = Self::new();
        for (row, (original, rewritten)) in rows.iter().enumerate() {
            let (original, rewritten) = (original.as_ref(), rewritten.as_ref());
            if original.trim().is_empty() && rewritten.trim().is_empty() {
                continue;
            }
            let rule = parse_hex_id(original)
                .and_then(|original_id| {
                    parse_hex_id(rewritten).map(|rewritten_id| RewriteRule {
                        original_id,
                        rewritten_id,
                    })
                })
                .map_err(|e| RuleError::Row {
                    row,
                    source: Box::new(e),
                })?;
            table.add(rule)?;
        }
        Ok(table)
    }

    /// Rewritten identifier for `id`, if a rule matches.
    pub fn lookup(&self, id: u32) -> Option<u32> {
        self.index.get(&id).copied()
    }

    /// Insert a rule. Returns the rule it replaced, if any.
    pub fn add(&mut self, rule: RewriteRule) -> Result<Option<RewriteRule>, RuleError> {
        rule.validate()?;
        let previous = self.index.insert(rule.original_id, rule.rewritten_id);
        match self
            .rules
            .iter_mut()
            .find(|r| r.original_id == rule.original_id)
        {
            Some(existing) => {
                let replaced = *existing;
                *existing = rule;
                Ok(Some(replaced))
            }
            None => {
                debug_assert!(previous.is_none());
                self.rules.push(rule);
                Ok(None)
            }
        }
    }

    /// Change the target of an existing rule.
    pub fn update(&mut self, original_id: u32, rewritten_id: u32) -> Result<(), RuleError> {
        let rewritten_id = validate_id(i64::from(rewritten_id))?;
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.original_id == original_id)
            .ok_or(RuleError::NotFound(original_id))?;
        rule.rewritten_id = rewritten_id;
        self.index.insert(original_id, rewritten_id);
        Ok(())
    }

    pub fn remove(&mut self, original_id: u32) -> Option<RewriteRule> {
        self.index.remove(&original_id)?;
        let pos = self
            .rules
            .iter()
            .position(|r| r.original_id == original_id)?;
        Some(self.rules.remove(pos))
    }

    /// Rules in display order.
    pub fn iter(&self) -> impl Iterator<Item = &RewriteRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
