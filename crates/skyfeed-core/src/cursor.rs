//! Feed pagination cursor.
//!
//! A cursor encodes the sort key of the last item on a page:
//! `(indexed_at_millis, id)`. On the wire it is the opaque string
//! `"<indexed_at_millis>::<id>"`.

use std::fmt;
use std::str::FromStr;

use crate::{ContentItem, Error};

/// Separator between the timestamp and the tie-break id.
pub const CURSOR_SEPARATOR: &str = "::";

/// Composite, order-preserving pagination token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    /// `indexed_at` of the last item returned, in Unix milliseconds.
    pub indexed_at_millis: i64,
    /// Content id of the last item returned.
    pub id: String,
}

impl Cursor {
    pub fn new(indexed_at_millis: i64, id: impl Into<String>) -> Self {
        Self {
            indexed_at_millis,
            id: id.into(),
        }
    }

    /// Cursor pointing just past the given item.
    pub fn after(item: &ContentItem) -> Self {
        Self::new(item.indexed_at, item.id.clone())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.indexed_at_millis, CURSOR_SEPARATOR, self.id)
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| Error::MalformedCursor {
            cursor: s.to_string(),
            reason,
        };

        let (millis, id) = s
            .split_once(CURSOR_SEPARATOR)
            .ok_or_else(|| malformed("missing '::' separator"))?;

        let indexed_at_millis: i64 = millis
            .parse()
            .map_err(|_| malformed("timestamp is not an integer"))?;
        if indexed_at_millis < 0 {
            return Err(malformed("timestamp is negative"));
        }

        if id.is_empty() {
            return Err(malformed("empty id"));
        }
        if id.contains(CURSOR_SEPARATOR) {
            return Err(malformed("id contains separator"));
        }

        Ok(Self::new(indexed_at_millis, id))
    }
}
