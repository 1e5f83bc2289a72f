// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! ISA-95 tag paths.
//!
//! A [`TagPath`] is the normalised identity of a signal:
//! `{site}/{area}/{line}/{equipment}/{signal_type}/{tag}`. Construction is
//! deterministic: the same raw input and context always produce the same
//! path, across restarts and across processes, because the full path is
//! the key under which the lakehouse upserts.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The replacement used for a segment that sanitises to nothing when no
/// default is configured.
pub const DEFAULT_SEGMENT: &str = "unspecified";

/// An error produced when parsing an already-normalised path string.
#[derive(Debug, Clone, Error)]
pub enum PathError {
    #[error("tag path must have exactly 6 segments, found {0}")]
    WrongSegmentCount(usize),
    #[error("tag path segment {0} is empty")]
    EmptySegment(usize),
}

/// A normalised six-segment ISA-95 path.
///
/// Stored as the joined string, since that is the form every consumer
/// (spool frames, wire batches, status snapshots) wants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagPath(String);

impl TagPath {
    /// Builds a path from six raw segments, sanitising each one. Segments
    /// that sanitise to nothing are replaced with `default_segment`.
    pub fn from_segments<'a, I>(segments: I, default_segment: &str) -> TagPath
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = String::new();
        for (i, segment) in segments.into_iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(&sanitize_segment(segment, default_segment));
        }
        TagPath(out)
    }

    /// Parses a string that is expected to already be in normalised form.
    /// Used when reloading paths from configuration or the spool.
    pub fn parse(s: &str) -> Result<TagPath, PathError> {
        let segments: Vec<&str> = s.split('/').collect();
        if segments.len() != 6 {
            return Err(PathError::WrongSegmentCount(segments.len()));
        }
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(i));
            }
        }
        Ok(TagPath(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The final segment: the tag name itself.
    pub fn tag(&self) -> &str {
        self.0.rsplit('/').next().expect("paths have segments")
    }
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitises one path segment: lower-case, runs of non-alphanumeric
/// characters collapsed to a single `_`, leading and trailing `_` removed.
/// An input that sanitises to nothing yields `default_segment`.
pub fn sanitize_segment(raw: &str, default_segment: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if out.is_empty() {
        default_segment.to_owned()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize_segment("Bearing Temp", "x"), "bearing_temp");
        assert_eq!(sanitize_segment("PLC-01//cell", "x"), "plc_01_cell");
        assert_eq!(sanitize_segment("  Line 1  ", "x"), "line_1");
        assert_eq!(sanitize_segment("___", "x"), "x");
        assert_eq!(sanitize_segment("", "unspecified"), "unspecified");
    }

    #[test]
    fn build_is_deterministic() {
        let a = TagPath::from_segments(
            ["Plant1", "Production", "Line1", "PLC 1", "Temperature", "Bearing Temp"],
            DEFAULT_SEGMENT,
        );
        let b = TagPath::from_segments(
            ["Plant1", "Production", "Line1", "PLC 1", "Temperature", "Bearing Temp"],
            DEFAULT_SEGMENT,
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "plant1/production/line1/plc_1/temperature/bearing_temp");
        assert_eq!(a.tag(), "bearing_temp");
    }

    #[test]
    fn empty_segments_take_the_default() {
        let p = TagPath::from_segments(["site", "", "line", "eq", "flow", "v"], "unspecified");
        assert_eq!(p.as_str(), "site/unspecified/line/eq/flow/v");
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        assert!(TagPath::parse("a/b/c/d/e/f").is_ok());
        assert!(TagPath::parse("a/b/c").is_err());
        assert!(TagPath::parse("a//c/d/e/f").is_err());
    }
}
