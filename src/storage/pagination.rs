//! Pagination and sorting.
//!
//! [`Paginator::plan`] validates a [`PaginationSpec`] into a [`PagePlan`]:
//! a sort on `(sort_key, direction)` with a `uid` ascending tiebreak, plus
//! a bounded skip/limit window. The resulting total order is what makes
//! offset paging free of skips and duplicates on an unchanged dataset.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bson::{Document, doc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::error::PaginationError;
use crate::storage::schema::Schema;
use crate::storage::types::CatalogRecord;

// =============================================================================
// Constants
// =============================================================================

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_SORT_KEY: &str = "creation_time";

// =============================================================================
// Request types
// =============================================================================

/// Sort direction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    EnumString,
    Display,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_mongo(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

/// Paging parameters as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationSpec {
    pub page_size: Option<i64>,
    pub offset: Option<i64>,
    /// Opaque token from a previous page; takes precedence over `offset`.
    pub cursor: Option<String>,
    pub sort_key: Option<String>,
    pub sort_direction: SortDirection,
    pub include_total: bool,
}

impl PaginationSpec {
    pub fn with_page_size(mut self, size: i64) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn sorted_by(mut self, key: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_key = Some(key.into());
        self.sort_direction = direction;
        self
    }

    pub fn with_total(mut self) -> Self {
        self.include_total = true;
        self
    }
}

/// Page-size bounds, normally taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

// =============================================================================
// Plan
// =============================================================================

/// A validated paging window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    /// Client-facing sort key.
    pub sort_key: String,
    /// Stored document path of the sort key.
    pub sort_path: String,
    pub direction: SortDirection,
    pub offset: u64,
    pub limit: u32,
    pub include_total: bool,
}

impl PagePlan {
    /// Sort document with the `uid` tiebreak appended.
    pub fn sort_document(&self) -> Document {
        if self.sort_path == "uid" {
            return doc! { "uid": self.direction.as_mongo() };
        }
        doc! {
            self.sort_path.as_str(): self.direction.as_mongo(),
            "uid": 1,
        }
    }

    /// Cursor for the page following one that returned `returned` records.
    ///
    /// `None` when the page was short or the known total is exhausted.
    pub fn next_cursor(&self, returned: usize, total: Option<u64>) -> Option<String> {
        if returned < self.limit as usize {
            return None;
        }
        let next = self.offset + returned as u64;
        if total.is_some_and(|t| next >= t) {
            return None;
        }
        Some(
            CursorToken {
                offset: next,
                sort_key: self.sort_key.clone(),
                direction: self.direction,
            }
            .encode(),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorToken {
    #[serde(rename = "o")]
    offset: u64,
    #[serde(rename = "k")]
    sort_key: String,
    #[serde(rename = "d")]
    direction: SortDirection,
}

impl CursorToken {
    fn encode(&self) -> String {
        // Serializing a plain struct to JSON cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    fn decode(token: &str) -> Result<Self, PaginationError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| PaginationError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| PaginationError::InvalidCursor(e.to_string()))
    }
}

/// Turns client paging parameters into plans.
#[derive(Debug, Clone, Copy)]
pub struct Paginator<'a> {
    schema: &'a Schema,
    limits: PageLimits,
}

impl<'a> Paginator<'a> {
    pub fn new(schema: &'a Schema, limits: PageLimits) -> Self {
        Self { schema, limits }
    }

    pub fn plan(&self, spec: &PaginationSpec) -> Result<PagePlan, PaginationError> {
        let sort_key = spec.sort_key.as_deref().unwrap_or(DEFAULT_SORT_KEY);
        let sort_path = self
            .schema
            .field(sort_key)
            .filter(|def| def.sortable)
            .map(|def| def.path.clone())
            .ok_or_else(|| PaginationError::InvalidSortKey(sort_key.to_string()))?;

        let limit = match spec.page_size {
            None => self.limits.default_page_size,
            Some(size) if size <= 0 => return Err(PaginationError::InvalidPageSize(size)),
            Some(size) => u32::try_from(size)
                .unwrap_or(u32::MAX)
                .min(self.limits.max_page_size),
        };

        let offset = match (&spec.cursor, spec.offset) {
            (Some(token), _) => {
                let cursor = CursorToken::decode(token)?;
                if cursor.sort_key != sort_key || cursor.direction != spec.sort_direction {
                    return Err(PaginationError::InvalidCursor(format!(
                        "issued for sort {} {}",
                        cursor.sort_key, cursor.direction
                    )));
                }
                cursor.offset
            }
            (None, Some(offset)) if offset < 0 => {
                return Err(PaginationError::InvalidOffset(offset));
            }
            (None, Some(offset)) => offset as u64,
            (None, None) => 0,
        };

        Ok(PagePlan {
            sort_key: sort_key.to_string(),
            sort_path,
            direction: spec.sort_direction,
            offset,
            limit,
            include_total: spec.include_total,
        })
    }
}

// =============================================================================
// Result
// =============================================================================

/// One page of matching records.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage {
    pub records: Vec<CatalogRecord>,
    /// Page size actually applied, after clamping.
    pub page_size: u32,
    pub offset: u64,
    pub next_cursor: Option<String>,
    /// Count of all matching records, when requested.
    pub total: Option<u64>,
}
