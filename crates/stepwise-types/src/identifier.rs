//! Step identifiers: `category://[channel/]grouping/version/name`.
//!
//! Every step in the catalog is addressed by a [`StepIdentifier`]. The string
//! form is the only form users write (in fragment files and on the command
//! line); the structured form is what the engine compares, orders, and uses
//! to lay out definitions and artifacts on disk.
//!
//! Shapes per category:
//!
//! ```text
//! snapshot://grouping/version/name[.ext]
//! data://channel/grouping/version/name
//! grapher://grouping/version/name
//! export://channel/grouping/version/name
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Coarse classification of a step. Determines the identifier shape and the
/// adapter that executes the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// An external raw input, recorded by content checksum.
    RawSnapshot,
    /// A cleaned/derived dataset.
    CuratedDataset,
    /// A dataset prepared for publication.
    PublishedView,
    /// An export of one or more datasets to an outside consumer.
    ExportedArtifact,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::RawSnapshot,
        Category::CuratedDataset,
        Category::PublishedView,
        Category::ExportedArtifact,
    ];

    /// URI scheme used in the identifier grammar.
    pub fn scheme(&self) -> &'static str {
        match self {
            Category::RawSnapshot => "snapshot",
            Category::CuratedDataset => "data",
            Category::PublishedView => "grapher",
            Category::ExportedArtifact => "export",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Category::ALL.into_iter().find(|c| c.scheme() == scheme)
    }

    /// Whether identifiers of this category carry a channel segment.
    pub fn has_channel(&self) -> bool {
        matches!(self, Category::CuratedDataset | Category::ExportedArtifact)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::RawSnapshot => "raw-snapshot",
            Category::CuratedDataset => "curated-dataset",
            Category::PublishedView => "published-view",
            Category::ExportedArtifact => "exported-artifact",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Version segment of an identifier: a calendar date or a literal tag such as
/// `latest`. Dates order before literals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    Date(NaiveDate),
    Literal(String),
}

impl Version {
    fn parse(segment: &str) -> Result<Self, MalformedReason> {
        if segment.is_empty() {
            return Err(MalformedReason::EmptySegment("version"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(MalformedReason::InvalidVersion(segment.to_string()));
        }
        // Only zero-padded dates are dates; anything that would not render back
        // identically stays a literal so rendering is lossless.
        if let Ok(date) = NaiveDate::parse_from_str(segment, "%Y-%m-%d") {
            if date.format("%Y-%m-%d").to_string() == segment {
                return Ok(Version::Date(date));
            }
        }
        Ok(Version::Literal(segment.to_string()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Version::Literal(tag) => f.write_str(tag),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A step identifier string that does not follow the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed step identifier '{input}': {reason}")]
pub struct MalformedIdentifierError {
    pub input: String,
    pub reason: MalformedReason,
}

/// Why an identifier failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("missing '://' after the category")]
    MissingScheme,

    #[error("unrecognized category '{0}' (expected snapshot, data, grapher or export)")]
    UnknownCategory(String),

    #[error("expected {expected} path segments, found {found}")]
    SegmentCount { expected: usize, found: usize },

    #[error("empty {0} segment")]
    EmptySegment(&'static str),

    #[error("{segment} '{value}' contains characters outside [a-z0-9_]")]
    InvalidCharacters { segment: &'static str, value: String },

    #[error("version '{0}' contains characters outside [a-z0-9-]")]
    InvalidVersion(String),

    #[error("file extension '{0}' is only allowed on snapshot identifiers")]
    UnexpectedExtension(String),
}

// ---------------------------------------------------------------------------
// StepIdentifier
// ---------------------------------------------------------------------------

/// Unique, immutable name of a step.
///
/// Field order is the ordering order: category, channel, grouping, version,
/// name, extension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepIdentifier {
    category: Category,
    channel: Option<String>,
    grouping: String,
    version: Version,
    name: String,
    extension: Option<String>,
}

impl StepIdentifier {
    /// Parse the canonical string form.
    pub fn parse(input: &str) -> Result<Self, MalformedIdentifierError> {
        Self::parse_inner(input).map_err(|reason| MalformedIdentifierError {
            input: input.to_string(),
            reason,
        })
    }

    fn parse_inner(input: &str) -> Result<Self, MalformedReason> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or(MalformedReason::MissingScheme)?;
        let category = Category::from_scheme(scheme)
            .ok_or_else(|| MalformedReason::UnknownCategory(scheme.to_string()))?;

        let segments: Vec<&str> = rest.split('/').collect();
        let expected = if category.has_channel() { 4 } else { 3 };
        if segments.len() != expected {
            return Err(MalformedReason::SegmentCount {
                expected,
                found: segments.len(),
            });
        }

        let (channel, tail) = if category.has_channel() {
            (Some(word(segments[0], "channel")?), &segments[1..])
        } else {
            (None, &segments[..])
        };
        let grouping = word(tail[0], "grouping")?;
        let version = Version::parse(tail[1])?;

        let (name, extension) = match tail[2].split_once('.') {
            Some((name, ext)) => {
                if category != Category::RawSnapshot {
                    return Err(MalformedReason::UnexpectedExtension(ext.to_string()));
                }
                (word(name, "name")?, Some(extension(ext)?))
            }
            None => (word(tail[2], "name")?, None),
        };

        Ok(Self {
            category,
            channel,
            grouping,
            version,
            name,
            extension,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn grouping(&self) -> &str {
        &self.grouping
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// Last path segment, including the snapshot file extension if any.
    pub fn file_name(&self) -> String {
        match &self.extension {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        }
    }

    /// Relative path below the category root: `[channel/]grouping/version/file_name`.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        if let Some(channel) = &self.channel {
            path.push(channel);
        }
        path.push(&self.grouping);
        path.push(self.version.to_string());
        path.push(self.file_name());
        path
    }

    /// Whether the rendered identifier contains `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        self.to_string().contains(pattern)
    }
}

fn word(segment: &str, what: &'static str) -> Result<String, MalformedReason> {
    if segment.is_empty() {
        return Err(MalformedReason::EmptySegment(what));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(MalformedReason::InvalidCharacters {
            segment: what,
            value: segment.to_string(),
        });
    }
    Ok(segment.to_string())
}

fn extension(ext: &str) -> Result<String, MalformedReason> {
    let valid = ext
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    if !valid {
        return Err(MalformedReason::InvalidCharacters {
            segment: "extension",
            value: ext.to_string(),
        });
    }
    Ok(ext.to_string())
}

impl fmt::Display for StepIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.category.scheme())?;
        if let Some(channel) = &self.channel {
            write!(f, "{channel}/")?;
        }
        write!(f, "{}/{}/{}", self.grouping, self.version, self.name)?;
        if let Some(ext) = &self.extension {
            write!(f, ".{ext}")?;
        }
        Ok(())
    }
}

impl FromStr for StepIdentifier {
    type Err = MalformedIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for StepIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        StepIdentifier::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
