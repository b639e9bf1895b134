//! Cursor pagination over ordered, append-only sequences.

use serde::{Deserialize, Serialize};

use super::LogId;

/// Maximum page size accepted by list operations.
pub const MAX_PAGE_SIZE: u64 = 1_000;

/// Position in a ledger log: everything strictly after `after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    /// Last ID already consumed; `None` starts at the beginning.
    #[serde(default)]
    pub after: Option<LogId>,
    /// Number of items per page.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

fn default_page_size() -> u64 {
    100
}

impl Default for LogCursor {
    fn default() -> Self {
        Self {
            after: None,
            page_size: default_page_size(),
        }
    }
}

impl LogCursor {
    /// Cursor positioned after `id`.
    #[must_use]
    pub fn after(id: LogId) -> Self {
        Self {
            after: Some(id),
            ..Self::default()
        }
    }

    /// Page size clamped into `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of results plus the cursor of the next page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items in the current page.
    pub data: Vec<T>,
    /// Cursor for the following page, absent on the last one.
    pub next: Option<LogCursor>,
}

impl<T> Page<T> {
    /// Builds a page; `last_id` extracts the cursor position of an item.
    ///
    /// A page shorter than the requested limit is the last one.
    #[must_use]
    pub fn new(data: Vec<T>, cursor: &LogCursor, last_id: impl Fn(&T) -> LogId) -> Self {
        let full = data.len() as u64 >= cursor.limit();
        let next = if full {
            data.last().map(|item| LogCursor {
                after: Some(last_id(item)),
                page_size: cursor.page_size,
            })
        } else {
            None
        };
        Self { data, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_clamped() {
        let mut cursor = LogCursor::default();
        assert_eq!(cursor.limit(), 100);
        cursor.page_size = 0;
        assert_eq!(cursor.limit(), 1);
        cursor.page_size = 50_000;
        assert_eq!(cursor.limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_full_page_has_next_cursor() {
        let cursor = LogCursor {
            after: None,
            page_size: 2,
        };
        let page = Page::new(vec![LogId(1), LogId(2)], &cursor, |id| *id);
        assert_eq!(page.next.unwrap().after, Some(LogId(2)));
    }

    #[test]
    fn test_short_page_is_last() {
        let cursor = LogCursor::after(LogId(10));
        let page = Page::new(vec![LogId(11)], &cursor, |id| *id);
        assert!(page.next.is_none());
    }
}
