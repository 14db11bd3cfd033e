//! Typed builder for Drive v3 `q` search expressions.
//!
//! Clauses are joined with `and`; [`DriveQuery::build`] appends
//! `trashed = false`. String literals are escaped, and literals containing
//! control characters make `build` fail with `InvalidArgument`.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::{GcloudError, Result};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveQuery {
    clauses: Vec<String>,
    invalid: Option<String>,
}

/// Quote `value` as a Drive string literal.
fn literal(value: &str) -> std::result::Result<String, String> {
    if let Some(c) = value.chars().find(|c| c.is_control()) {
        return Err(format!(
            "Drive query literal contains control character U+{:04X}",
            c as u32
        ));
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\\' || c == '\'' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    Ok(out)
}

impl DriveQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, clause: impl FnOnce() -> std::result::Result<String, String>) -> Self {
        if self.invalid.is_none() {
            match clause() {
                Ok(c) => self.clauses.push(c),
                Err(e) => self.invalid = Some(e),
            }
        }
        self
    }

    #[must_use]
    pub fn name_eq(self, name: &str) -> Self {
        self.push(|| Ok(format!("name = {}", literal(name)?)))
    }

    #[must_use]
    pub fn name_contains(self, fragment: &str) -> Self {
        self.push(|| Ok(format!("name contains {}", literal(fragment)?)))
    }

    #[must_use]
    pub fn mime_type_eq(self, mime_type: &str) -> Self {
        self.push(|| Ok(format!("mimeType = {}", literal(mime_type)?)))
    }

    #[must_use]
    pub fn mime_type_ne(self, mime_type: &str) -> Self {
        self.push(|| Ok(format!("mimeType != {}", literal(mime_type)?)))
    }

    #[must_use]
    pub fn folders_only(self) -> Self {
        self.mime_type_eq(FOLDER_MIME_TYPE)
    }

    #[must_use]
    pub fn in_parents(self, parent_id: &str) -> Self {
        self.push(|| Ok(format!("{} in parents", literal(parent_id)?)))
    }

    /// Match an app-private property (`appProperties` set by this app).
    #[must_use]
    pub fn app_property(self, key: &str, value: &str) -> Self {
        self.push(|| {
            Ok(format!(
                "appProperties has {{ key={} and value={} }}",
                literal(key)?,
                literal(value)?
            ))
        })
    }

    /// Match a public custom property.
    #[must_use]
    pub fn property(self, key: &str, value: &str) -> Self {
        self.push(|| {
            Ok(format!(
                "properties has {{ key={} and value={} }}",
                literal(key)?,
                literal(value)?
            ))
        })
    }

    #[must_use]
    pub fn full_text_contains(self, text: &str) -> Self {
        self.push(|| Ok(format!("fullText contains {}", literal(text)?)))
    }

    #[must_use]
    pub fn modified_after(self, time: DateTime<Utc>) -> Self {
        let stamp = time.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.push(|| Ok(format!("modifiedTime > '{stamp}'")))
    }

    #[must_use]
    pub fn starred(self, starred: bool) -> Self {
        self.push(|| Ok(format!("starred = {starred}")))
    }

    /// Require every clause of `other` as well.
    #[must_use]
    pub fn and(mut self, other: DriveQuery) -> Self {
        if self.invalid.is_none() {
            self.invalid = other.invalid;
        }
        self.clauses.extend(other.clauses);
        self
    }

    /// Match either this query or `other`.
    #[must_use]
    pub fn or(self, other: DriveQuery) -> Self {
        let clauses = match (self.grouped(), other.grouped()) {
            (Some(a), Some(b)) => vec![format!("({a} or {b})")],
            (Some(only), None) | (None, Some(only)) => vec![only],
            (None, None) => Vec::new(),
        };
        Self {
            clauses,
            invalid: self.invalid.or(other.invalid),
        }
    }

    /// Negate `other` and add it as a clause.
    #[must_use]
    pub fn not(mut self, other: DriveQuery) -> Self {
        if self.invalid.is_none() {
            self.invalid = other.invalid.clone();
        }
        if let Some(expr) = other.expression() {
            self.clauses.push(format!("not ({expr})"));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    fn expression(&self) -> Option<String> {
        match self.clauses.len() {
            0 => None,
            1 => Some(self.clauses[0].clone()),
            _ => Some(self.clauses.join(" and ")),
        }
    }

    /// The expression as one operand, parenthesized when it joins clauses.
    fn grouped(&self) -> Option<String> {
        match self.clauses.len() {
            0 | 1 => self.expression(),
            _ => self.expression().map(|expr| format!("({expr})")),
        }
    }

    /// The final `q` value, always excluding trashed files.
    pub fn build(&self) -> Result<String> {
        if let Some(reason) = &self.invalid {
            return Err(GcloudError::InvalidArgument(reason.clone()));
        }
        Ok(match self.expression() {
            Some(expr) => format!("{expr} and trashed = false"),
            None => "trashed = false".to_string(),
        })
    }
}
