// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deduplicated string pool.

Strings are stored as NUL terminated UTF-8 and referenced by the byte offset
of their first byte. Offset 0 always holds the empty string.
*/

use {
    crate::{Error, ImageResult},
    std::collections::HashMap,
};

/// Read-only view of a string pool region.
#[derive(Clone, Copy, Debug)]
pub struct StringPool<'a> {
    data: &'a [u8],
}

impl<'a> StringPool<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Size in bytes of the pool.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Resolve the raw bytes of the string starting at `offset`.
    ///
    /// The terminating NUL is not part of the returned slice.
    pub fn get(&self, offset: u64) -> ImageResult<&'a [u8]> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|start| *start < self.data.len())
            .ok_or(Error::Corrupt("string offset out of bounds"))?;

        let remaining = &self.data[start..];
        let end = remaining
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::Corrupt("string is not terminated"))?;

        Ok(&remaining[..end])
    }

    /// Resolve the string starting at `offset` as UTF-8.
    pub fn get_str(&self, offset: u64) -> ImageResult<&'a str> {
        std::str::from_utf8(self.get(offset)?)
            .map_err(|_| Error::Corrupt("string is not valid UTF-8"))
    }
}

/// Accumulates strings into a pool, storing each distinct string once.
#[derive(Debug)]
pub struct StringPoolBuilder {
    data: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl Default for StringPoolBuilder {
    fn default() -> Self {
        let mut offsets = HashMap::new();
        offsets.insert(String::new(), 0);

        Self {
            data: vec![0],
            offsets,
        }
    }
}

impl StringPoolBuilder {
    /// Add a string, returning its offset.
    ///
    /// Adding a string already in the pool returns the existing offset.
    pub fn add(&mut self, s: &str) -> ImageResult<u32> {
        if let Some(offset) = self.offsets.get(s) {
            return Ok(*offset);
        }

        if s.as_bytes().contains(&0) {
            return Err(Error::InvalidName(s.to_string()));
        }

        let offset =
            u32::try_from(self.data.len()).map_err(|_| Error::TooLarge("string pool"))?;

        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.offsets.insert(s.to_string(), offset);

        Ok(offset)
    }

    /// Size in bytes of the pool data.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Obtain the pool data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
