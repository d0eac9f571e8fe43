//! Cell addressing: `<cell-path>!<item>@<host>`
//!
//! A [`CellPath`] names a node in the cell tree, counted from the top cell
//! (`api.east.rack1`). The empty path means "this cell". A [`TargetAddress`]
//! pins an item (a service id, a compute node id, a host name) to a cell and,
//! optionally, to a host inside that cell.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CellError, Result};

/// Separates the cell path from the item
pub const CELL_ITEM_SEPARATOR: char = '!';
/// Separates the item from the host
pub const HOST_SEPARATOR: char = '@';
/// Joins cell path segments unless configured otherwise
pub const DEFAULT_PATH_SEPARATOR: char = '.';

/// Path from the top of the cell tree down to one cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellPath {
    segments: Vec<String>,
}

impl CellPath {
    /// The zero-length path, meaning "this cell"
    pub fn local() -> Self {
        Self::default()
    }

    /// Build a path from already split segments
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new_with(segments, DEFAULT_PATH_SEPARATOR)
    }

    /// Build a path whose segments must also stay clear of `separator`
    pub fn new_with<I, S>(segments: I, separator: char) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment, separator).map_err(|reason| CellError::malformed(segment, reason))?;
        }
        Ok(Self { segments })
    }

    /// Parse a path joined with the default separator
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, DEFAULT_PATH_SEPARATOR)
    }

    /// Parse a path joined with `separator`
    pub fn parse_with(text: &str, separator: char) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self::local());
        }
        let mut segments = Vec::new();
        for segment in text.split(separator) {
            validate_segment(segment, separator).map_err(|reason| CellError::malformed(text, reason))?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True for the zero-length path
    pub fn is_local(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments (0 for the local path)
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Name of the cell itself (last segment)
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path of the parent cell, `None` at the top or for the local path
    pub fn parent(&self) -> Option<CellPath> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Path of a direct child named `name`
    pub fn child(&self, name: &str) -> Result<CellPath> {
        validate_segment(name, DEFAULT_PATH_SEPARATOR).map_err(|reason| CellError::malformed(name, reason))?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// True when `self` is a strict prefix of `other`
    pub fn is_ancestor_of(&self, other: &CellPath) -> bool {
        !self.is_local()
            && self.segments.len() < other.segments.len()
            && other.segments.starts_with(&self.segments)
    }

    /// True when `other` is `self` or lies below it
    pub fn contains(&self, other: &CellPath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Render with an explicit separator
    pub fn to_string_with(&self, separator: char) -> String {
        let mut buf = [0u8; 4];
        self.segments.join(separator.encode_utf8(&mut buf))
    }
}

/// A segment may hold neither address delimiter, nor the separator in use,
/// nor the default separator the serialized form is joined with.
fn validate_segment(segment: &str, separator: char) -> std::result::Result<(), String> {
    if segment.is_empty() {
        return Err("empty cell name in path".into());
    }
    if let Some(bad) = segment.chars().find(|c| {
        *c == CELL_ITEM_SEPARATOR || *c == HOST_SEPARATOR || *c == DEFAULT_PATH_SEPARATOR || *c == separator
    }) {
        return Err(format!("cell name '{segment}' contains reserved character '{bad}'"));
    }
    Ok(())
}

impl fmt::Display for CellPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with(DEFAULT_PATH_SEPARATOR))
    }
}

impl FromStr for CellPath {
    type Err = CellError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CellPath {
    type Error = CellError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CellPath> for String {
    fn from(path: CellPath) -> Self {
        path.to_string()
    }
}

/// An item in a cell, optionally pinned to a host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub cell_path: CellPath,
    pub item: String,
    pub host: Option<String>,
}

impl TargetAddress {
    /// Build and validate an address
    pub fn new(cell_path: CellPath, item: impl Into<String>, host: Option<String>) -> Result<Self> {
        let addr = Self {
            cell_path,
            item: item.into(),
            host,
        };
        addr.validate()?;
        Ok(addr)
    }

    /// Parse `cell_path!item` or `cell_path!item@host` with the default separator
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, DEFAULT_PATH_SEPARATOR)
    }

    /// Parse with a configured path separator.
    ///
    /// The host is split off at the last `@`; the cell path ends at the first `!`.
    pub fn parse_with(text: &str, separator: char) -> Result<Self> {
        let (rest, host) = match text.rfind(HOST_SEPARATOR) {
            Some(at) => (&text[..at], Some(text[at + 1..].to_string())),
            None => (text, None),
        };
        let bang = rest
            .find(CELL_ITEM_SEPARATOR)
            .ok_or_else(|| CellError::malformed(text, "missing '!' between cell path and item"))?;
        let cell_path = CellPath::parse_with(&rest[..bang], separator).map_err(|e| match e {
            CellError::MalformedAddress { reason, .. } => CellError::malformed(text, reason),
            other => other,
        })?;
        let addr = Self {
            cell_path,
            item: rest[bang + 1..].to_string(),
            host,
        };
        addr.validate().map_err(|e| match e {
            CellError::MalformedAddress { reason, .. } => CellError::malformed(text, reason),
            other => other,
        })?;
        Ok(addr)
    }

    /// Inverse of [`TargetAddress::parse`]
    pub fn format(&self) -> String {
        self.format_with(DEFAULT_PATH_SEPARATOR)
    }

    pub fn format_with(&self, separator: char) -> String {
        let mut out = self.cell_path.to_string_with(separator);
        out.push(CELL_ITEM_SEPARATOR);
        out.push_str(&self.item);
        if let Some(host) = &self.host {
            out.push(HOST_SEPARATOR);
            out.push_str(host);
        }
        out
    }

    /// The host a host-scoped request should land on: `@host` if given, else the item
    pub fn destination_host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.item)
    }

    fn validate(&self) -> Result<()> {
        let shown = || self.format();
        if self.item.is_empty() {
            return Err(CellError::malformed(&shown(), "empty item"));
        }
        match &self.host {
            Some(host) if host.is_empty() => {
                return Err(CellError::malformed(&shown(), "empty host after '@'"));
            }
            Some(host) if host.contains(HOST_SEPARATOR) => {
                return Err(CellError::malformed(&shown(), "host contains '@'"));
            }
            None if self.item.contains(HOST_SEPARATOR) => {
                return Err(CellError::malformed(&shown(), "item contains '@' but no host is set"));
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for TargetAddress {
    type Err = CellError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Qualify `item` with the cell it came from: `cell!item`
pub fn cell_with_item(cell: &CellPath, item: &str, separator: char) -> String {
    let mut out = cell.to_string_with(separator);
    out.push(CELL_ITEM_SEPARATOR);
    out.push_str(item);
    out
}
