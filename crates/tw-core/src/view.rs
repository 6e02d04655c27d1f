//! View negotiation types: sort directions, sort key specs and paging.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a sort key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn reversed(&self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

impl FromStr for SortDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Ascending),
            "desc" | "descending" => Ok(Self::Descending),
            other => Err(CoreError::InvalidSortDirection(other.to_string())),
        }
    }
}

/// A `{name, direction}` pair naming a registered sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKeySpec {
    pub name: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKeySpec {
    pub fn new(name: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    pub fn ascending(name: impl Into<String>) -> Self {
        Self::new(name, SortDirection::Ascending)
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self::new(name, SortDirection::Descending)
    }
}

impl fmt::Display for SortKeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.direction)
    }
}

/// Requested page (zero-based index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub index: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn new(index: usize, size: usize) -> Self {
        Self { index, size }
    }

    pub fn first(size: usize) -> Self {
        Self { index: 0, size }
    }
}

/// Negotiated page, computed against the filtered set size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResponse {
    /// Effective (possibly clamped) page index.
    pub index: usize,
    pub size: usize,
    /// Item count after filtering, before paging.
    pub total_items: usize,
    pub total_pages: usize,
}

impl PageResponse {
    /// Offset of the first item on this page.
    pub fn offset(&self) -> usize {
        self.index.saturating_mul(self.size)
    }

    pub fn has_next(&self) -> bool {
        self.index + 1 < self.total_pages
    }

    pub fn has_previous(&self) -> bool {
        self.index > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!(
            "DESC".parse::<SortDirection>().unwrap(),
            SortDirection::Descending
        );
        assert_eq!(
            "ascending".parse::<SortDirection>().unwrap(),
            SortDirection::Ascending
        );
        assert!("sideways".parse::<SortDirection>().is_err());
        assert_eq!(
            SortDirection::Ascending.reversed(),
            SortDirection::Descending
        );
    }

    #[test]
    fn test_sort_key_spec_default_direction() {
        let spec: SortKeySpec = serde_json::from_str(r#"{"name":"price"}"#).unwrap();
        assert_eq!(spec, SortKeySpec::ascending("price"));
    }

    #[test]
    fn test_page_response_navigation() {
        let page = PageResponse {
            index: 1,
            size: 10,
            total_items: 23,
            total_pages: 3,
        };
        assert_eq!(page.offset(), 10);
        assert!(page.has_next());
        assert!(page.has_previous());
    }
}
