//! Capture-date extraction.
//!
//! Every variant names its assets differently, but all of them encode the
//! capture day as an 8-digit `YYYYMMDD` token. [`DateExtractor`] is the single
//! seam for pulling that token out of a URL or a local filename, so the fetch
//! stage and the synthesizer agree on naming without sharing regex code.

use crate::error::{HarvestError, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::fmt;

/// Format of the date token embedded in local filenames.
pub const TOKEN_FORMAT: &str = "%Y%m%d";

/// Something that can recover a capture date from a name.
pub trait DateExtractor: fmt::Debug + Send + Sync {
    /// Return the capture date encoded in `input`, if any.
    fn extract(&self, input: &str) -> Option<NaiveDate>;
}

/// Format a date as the 8-digit token used in filenames.
pub fn token(date: NaiveDate) -> String {
    date.format(TOKEN_FORMAT).to_string()
}

/// Parse an 8-digit token. Rejects anything that is not exactly eight ASCII
/// digits forming a real calendar day.
pub fn parse_token(token: &str) -> Option<NaiveDate> {
    if token.len() != 8 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(token, TOKEN_FORMAT).ok()
}

/// Extracts the date from the first capture group of a variant pattern,
/// e.g. `\.(\d{8})-S\d{6}` for early-run file names.
#[derive(Debug, Clone)]
pub struct RegexDateExtractor {
    pattern: Regex,
}

impl RegexDateExtractor {
    /// Compile `pattern`. The pattern must contain at least one capture group.
    pub fn new(pattern: &str) -> Result<Self> {
        let compiled = Regex::new(pattern)
            .map_err(|e| HarvestError::Config(format!("invalid date pattern '{pattern}': {e}")))?;
        if compiled.captures_len() < 2 {
            return Err(HarvestError::Config(format!(
                "date pattern '{pattern}' has no capture group"
            )));
        }
        Ok(Self { pattern: compiled })
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Extract the date or fail with [`HarvestError::DateToken`].
    pub fn require(&self, input: &str) -> Result<NaiveDate> {
        self.extract(input).ok_or_else(|| HarvestError::DateToken {
            input: input.to_string(),
        })
    }
}

impl DateExtractor for RegexDateExtractor {
    fn extract(&self, input: &str) -> Option<NaiveDate> {
        let caps = self.pattern.captures(input)?;
        parse_token(caps.get(1)?.as_str())
    }
}

/// Reads the token after the last `_` of a file stem, the convention for
/// local rasters (`imerg_l_20240101`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StemDateExtractor;

impl DateExtractor for StemDateExtractor {
    fn extract(&self, input: &str) -> Option<NaiveDate> {
        let (_, tail) = input.rsplit_once('_')?;
        parse_token(tail)
    }
}
