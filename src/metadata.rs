/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! A lightweight metadata batch.
//!
//! The call path only needs insertion-ordered string entries with byte-size
//! accounting (the per-RPC retry buffer cap counts buffered metadata), so
//! this is deliberately far smaller than a full HPACK-aware metadata table.

use crate::byte_str::ByteStr;

// Per-entry overhead charged in addition to key and value lengths, matching
// the accounting used for metadata in dynamic header tables.
const ENTRY_OVERHEAD: usize = 32;

/// An ordered multimap of metadata entries.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Metadata {
    entries: Vec<(ByteStr, ByteStr)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Appends an entry, keeping any existing entries with the same key.
    pub fn insert(&mut self, key: impl Into<ByteStr>, value: impl Into<ByteStr>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replaces all entries with the given key by a single entry.
    pub fn replace(&mut self, key: impl Into<ByteStr>, value: impl Into<ByteStr>) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| &**k != key);
    }

    /// Returns the first value for the key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| &**v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (&**k, &**v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The accounting size of this batch: key and value lengths plus a fixed
    /// per-entry overhead.  Used by the retry buffer cap.
    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD)
            .sum()
    }
}

impl FromIterator<(ByteStr, ByteStr)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (ByteStr, ByteStr)>>(iter: T) -> Self {
        Metadata {
            entries: iter.into_iter().collect(),
        }
    }
}
