// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Location records.

A location record describes a single resource: the components of its name
and where its bytes live in the content region. Records are a sequence of
`(tag, varint)` attributes terminated by a 0 tag. Attributes holding their
default value (0 or the empty string) are omitted.
*/

use crate::{strings::StringPool, Error, ImageResult};

/// Describes an attribute in a location record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttributeKind {
    End = 0x00,
    Module = 0x01,
    Parent = 0x02,
    Base = 0x03,
    Extension = 0x04,
    Offset = 0x05,
    Compressed = 0x06,
    Uncompressed = 0x07,
}

impl From<AttributeKind> for u8 {
    fn from(kind: AttributeKind) -> Self {
        match kind {
            AttributeKind::End => 0x00,
            AttributeKind::Module => 0x01,
            AttributeKind::Parent => 0x02,
            AttributeKind::Base => 0x03,
            AttributeKind::Extension => 0x04,
            AttributeKind::Offset => 0x05,
            AttributeKind::Compressed => 0x06,
            AttributeKind::Uncompressed => 0x07,
        }
    }
}

impl TryFrom<u8> for AttributeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AttributeKind::End),
            0x01 => Ok(AttributeKind::Module),
            0x02 => Ok(AttributeKind::Parent),
            0x03 => Ok(AttributeKind::Base),
            0x04 => Ok(AttributeKind::Extension),
            0x05 => Ok(AttributeKind::Offset),
            0x06 => Ok(AttributeKind::Compressed),
            0x07 => Ok(AttributeKind::Uncompressed),
            _ => Err(Error::UnknownAttribute(value)),
        }
    }
}

/// Append an unsigned LEB128 varint.
pub fn write_varint(dest: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            dest.push(byte);
            return;
        }

        dest.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint at `pos`, advancing `pos` past it.
pub fn read_varint(data: &[u8], pos: &mut usize) -> ImageResult<u64> {
    let mut value = 0u64;

    for shift in (0..64).step_by(7) {
        let byte = *data
            .get(*pos)
            .ok_or(Error::Corrupt("location record is truncated"))?;
        *pos += 1;

        if shift == 63 && byte > 1 {
            return Err(Error::Corrupt("varint overflows 64 bits"));
        }

        value |= ((byte & 0x7f) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(Error::Corrupt("varint overflows 64 bits"))
}

/// The raw attributes of a location record.
///
/// String attributes are string pool offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocationRecord {
    pub module: u64,
    pub parent: u64,
    pub base: u64,
    pub extension: u64,
    pub content_offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl LocationRecord {
    fn attributes(&self) -> [(AttributeKind, u64); 7] {
        [
            (AttributeKind::Module, self.module),
            (AttributeKind::Parent, self.parent),
            (AttributeKind::Base, self.base),
            (AttributeKind::Extension, self.extension),
            (AttributeKind::Offset, self.content_offset),
            (AttributeKind::Compressed, self.compressed_size),
            (AttributeKind::Uncompressed, self.uncompressed_size),
        ]
    }

    /// Append the encoded record.
    pub fn encode_to(&self, dest: &mut Vec<u8>) {
        for (kind, value) in self.attributes() {
            if value != 0 {
                dest.push(kind.into());
                write_varint(dest, value);
            }
        }

        dest.push(AttributeKind::End.into());
    }

    /// Encode the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(16);
        self.encode_to(&mut data);
        data
    }

    /// Decode a record from the start of `data`.
    ///
    /// Returns the record and the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> ImageResult<(Self, usize)> {
        let mut record = Self::default();
        let mut pos = 0;

        loop {
            let tag = *data
                .get(pos)
                .ok_or(Error::Corrupt("location record is truncated"))?;
            pos += 1;

            let kind = AttributeKind::try_from(tag)?;
            if kind == AttributeKind::End {
                return Ok((record, pos));
            }

            let value = read_varint(data, &mut pos)?;

            match kind {
                AttributeKind::End => {}
                AttributeKind::Module => record.module = value,
                AttributeKind::Parent => record.parent = value,
                AttributeKind::Base => record.base = value,
                AttributeKind::Extension => record.extension = value,
                AttributeKind::Offset => record.content_offset = value,
                AttributeKind::Compressed => record.compressed_size = value,
                AttributeKind::Uncompressed => record.uncompressed_size = value,
            }
        }
    }
}

/// The components of a full resource name.
///
/// A full name has the form `/module/parent/base.extension`, where any
/// component may be empty along with its separator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NameParts<'a> {
    pub module: &'a str,
    pub parent: &'a str,
    pub base: &'a str,
    pub extension: &'a str,
}

impl<'a> NameParts<'a> {
    /// Split a full name into its components.
    ///
    /// Names which don't reconstruct to themselves (e.g. `/foo`), empty
    /// names and names containing NUL can't be stored.
    pub fn split(name: &'a str) -> ImageResult<Self> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let (module, rest) = match name.strip_prefix('/') {
            Some(stripped) => match stripped.find('/') {
                Some(i) => (&stripped[..i], &stripped[i + 1..]),
                None => ("", name),
            },
            None => ("", name),
        };

        let (parent, file) = match rest.rfind('/') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => ("", rest),
        };

        let (base, extension) = match file.rfind('.') {
            Some(i) if i > 0 && i + 1 < file.len() => (&file[..i], &file[i + 1..]),
            _ => (file, ""),
        };

        let parts = Self {
            module,
            parent,
            base,
            extension,
        };

        if parts.matches(name.as_bytes()) {
            Ok(parts)
        } else {
            Err(Error::InvalidName(name.to_string()))
        }
    }

    /// Whether these components reconstruct exactly to `name`.
    pub fn matches(&self, name: &[u8]) -> bool {
        let mut rest = name;

        if !self.module.is_empty() {
            rest = match rest
                .strip_prefix(b"/")
                .and_then(|r| r.strip_prefix(self.module.as_bytes()))
                .and_then(|r| r.strip_prefix(b"/"))
            {
                Some(r) => r,
                None => return false,
            };
        }

        if !self.parent.is_empty() {
            rest = match rest
                .strip_prefix(self.parent.as_bytes())
                .and_then(|r| r.strip_prefix(b"/"))
            {
                Some(r) => r,
                None => return false,
            };
        }

        rest = match rest.strip_prefix(self.base.as_bytes()) {
            Some(r) => r,
            None => return false,
        };

        if !self.extension.is_empty() {
            rest = match rest
                .strip_prefix(b".")
                .and_then(|r| r.strip_prefix(self.extension.as_bytes()))
            {
                Some(r) => r,
                None => return false,
            };
        }

        rest.is_empty()
    }

    /// Reconstruct the full name.
    pub fn full_name(&self) -> String {
        let mut name = String::with_capacity(
            self.module.len() + self.parent.len() + self.base.len() + self.extension.len() + 4,
        );

        if !self.module.is_empty() {
            name.push('/');
            name.push_str(self.module);
            name.push('/');
        }
        if !self.parent.is_empty() {
            name.push_str(self.parent);
            name.push('/');
        }
        name.push_str(self.base);
        if !self.extension.is_empty() {
            name.push('.');
            name.push_str(self.extension);
        }

        name
    }
}

/// A decoded location record with its strings resolved.
///
/// Instances borrow from the [crate::ModuleImage] they were found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location<'a> {
    /// Components of the resource name.
    pub name: NameParts<'a>,

    /// Offset of the resource bytes, relative to the end of the index.
    pub content_offset: u64,

    /// Size of the stored bytes when compressed. 0 when stored uncompressed.
    pub compressed_size: u64,

    /// Size of the resource bytes once uncompressed.
    pub uncompressed_size: u64,
}

impl<'a> Location<'a> {
    /// Decode the record at the start of `data`, resolving strings in `pool`.
    pub fn decode(data: &[u8], pool: &StringPool<'a>) -> ImageResult<Self> {
        let (record, _) = LocationRecord::decode(data)?;

        Self::resolve(&record, pool)
    }

    /// Resolve the strings of a raw record.
    pub fn resolve(record: &LocationRecord, pool: &StringPool<'a>) -> ImageResult<Self> {
        Ok(Self {
            name: NameParts {
                module: pool.get_str(record.module)?,
                parent: pool.get_str(record.parent)?,
                base: pool.get_str(record.base)?,
                extension: pool.get_str(record.extension)?,
            },
            content_offset: record.content_offset,
            compressed_size: record.compressed_size,
            uncompressed_size: record.uncompressed_size,
        })
    }

    pub fn module(&self) -> &'a str {
        self.name.module
    }

    pub fn parent(&self) -> &'a str {
        self.name.parent
    }

    pub fn base(&self) -> &'a str {
        self.name.base
    }

    pub fn extension(&self) -> &'a str {
        self.name.extension
    }

    /// The full resource name.
    pub fn full_name(&self) -> String {
        self.name.full_name()
    }

    /// Whether this record is for the resource named `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.name.matches(name.as_bytes())
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_size != 0
    }

    /// Number of bytes this resource occupies in the content region.
    pub fn stored_size(&self) -> u64 {
        if self.is_compressed() {
            self.compressed_size
        } else {
            self.uncompressed_size
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::strings::StringPoolBuilder};

    #[test]
    fn varint_boundaries() -> ImageResult<()> {
        for value in [0, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut data = vec![];
            write_varint(&mut data, value);

            let mut pos = 0;
            assert_eq!(read_varint(&data, &mut pos)?, value);
            assert_eq!(pos, data.len());
        }

        let mut data = vec![];
        write_varint(&mut data, 300);
        assert_eq!(data, vec![0xac, 0x02]);

        Ok(())
    }

    #[test]
    fn varint_corrupt() {
        let mut pos = 0;
        assert!(matches!(
            read_varint(&[0x80, 0x80], &mut pos),
            Err(Error::Corrupt(_))
        ));

        let mut pos = 0;
        assert!(matches!(
            read_varint(&[0xff; 11], &mut pos),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn empty_record() -> ImageResult<()> {
        let record = LocationRecord::default();
        assert_eq!(record.encode(), vec![0]);
        assert_eq!(LocationRecord::decode(&[0])?, (record, 1));

        Ok(())
    }

    #[test]
    fn omits_defaults() -> ImageResult<()> {
        let record = LocationRecord {
            base: 1,
            uncompressed_size: 200,
            ..Default::default()
        };

        let data = record.encode();
        assert_eq!(data, vec![0x03, 0x01, 0x07, 0xc8, 0x01, 0x00]);
        assert_eq!(LocationRecord::decode(&data)?, (record, data.len()));

        Ok(())
    }

    #[test]
    fn all_attributes() -> ImageResult<()> {
        let record = LocationRecord {
            module: 1,
            parent: 2,
            base: 3,
            extension: 4,
            content_offset: 1 << 40,
            compressed_size: 17,
            uncompressed_size: 90,
        };

        let mut data = record.encode();
        let encoded_len = data.len();
        data.extend_from_slice(b"trailing");

        assert_eq!(LocationRecord::decode(&data)?, (record, encoded_len));

        Ok(())
    }

    #[test]
    fn unknown_tag() {
        assert!(matches!(
            LocationRecord::decode(&[0x08, 0x01, 0x00]),
            Err(Error::UnknownAttribute(0x08))
        ));
    }

    #[test]
    fn truncated_record() {
        assert!(matches!(
            LocationRecord::decode(&[0x05, 0x01]),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn split_names() -> ImageResult<()> {
        assert_eq!(
            NameParts::split("/java.base/java/lang/Object.class")?,
            NameParts {
                module: "java.base",
                parent: "java/lang",
                base: "Object",
                extension: "class",
            }
        );
        assert_eq!(
            NameParts::split("/m/foo")?,
            NameParts {
                module: "m",
                base: "foo",
                ..Default::default()
            }
        );
        assert_eq!(
            NameParts::split("x.tar.gz")?,
            NameParts {
                base: "x.tar",
                extension: "gz",
                ..Default::default()
            }
        );
        assert_eq!(
            NameParts::split("a/.hidden")?,
            NameParts {
                parent: "a",
                base: ".hidden",
                ..Default::default()
            }
        );
        assert_eq!(NameParts::split("trailing.")?.base, "trailing.");
        assert_eq!(NameParts::split("dir/")?.parent, "dir");

        Ok(())
    }

    #[test]
    fn split_rejects() {
        for name in ["", "/foo", "//x", "/m//a", "a\0b"] {
            assert!(
                matches!(NameParts::split(name), Err(Error::InvalidName(_))),
                "{}",
                name
            );
        }
    }

    #[test]
    fn full_name_reconstructs() -> ImageResult<()> {
        for name in [
            "/java.base/java/lang/Object.class",
            "/m/",
            "a//b",
            "plain",
            "/mod/a/b/c/d.e.f",
        ] {
            let parts = NameParts::split(name)?;
            assert_eq!(parts.full_name(), name);
            assert!(parts.matches(name.as_bytes()));
        }

        Ok(())
    }

    #[test]
    fn matches_rejects_near_misses() -> ImageResult<()> {
        let parts = NameParts::split("/m/p/base.ext")?;

        for other in [
            "/m/p/base.ex",
            "/m/p/base.extx",
            "/m/p/base",
            "/m/pbase.ext",
            "m/p/base.ext",
            "/n/p/base.ext",
            "",
        ] {
            assert!(!parts.matches(other.as_bytes()), "{}", other);
        }

        Ok(())
    }

    #[test]
    fn decode_resolves_strings() -> ImageResult<()> {
        let mut strings = StringPoolBuilder::default();
        let record = LocationRecord {
            module: strings.add("m")? as u64,
            base: strings.add("foo")? as u64,
            extension: strings.add("txt")? as u64,
            content_offset: 10,
            uncompressed_size: 5,
            ..Default::default()
        };

        let pool = StringPool::new(strings.as_bytes());
        let location = Location::decode(&record.encode(), &pool)?;

        assert_eq!(location.full_name(), "/m/foo.txt");
        assert!(location.matches("/m/foo.txt"));
        assert_eq!(location.parent(), "");
        assert_eq!(location.stored_size(), 5);
        assert!(!location.is_compressed());

        Ok(())
    }
}
