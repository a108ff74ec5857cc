// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Container header and region layout. */

use {
    crate::{Error, ImageResult},
    scroll::{Endian, IOread, IOwrite, Pread, Pwrite, SizeWith},
    std::io::Write,
};

/// File magic.
pub const MAGIC: u32 = 0xcafe_dada;

/// Highest major version this crate reads and the version it writes.
pub const MAJOR_VERSION: u16 = 1;

/// Highest minor version this crate reads and the version it writes.
pub const MINOR_VERSION: u16 = 0;

/// Size in bytes of the header.
pub const HEADER_SIZE: usize = 32;

/// A module image header.
///
/// The header describes the sizes of every index region, which allows each
/// region to be located without scanning.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IOread, IOwrite, Pread, Pwrite, SizeWith)]
pub struct Header {
    /// File magic. [MAGIC].
    pub magic: u32,

    /// Format major version.
    pub major_version: u16,

    /// Format minor version.
    pub minor_version: u16,

    /// Reserved flags. Always 0.
    pub flags: u32,

    /// Number of location records.
    pub resource_count: u32,

    /// Number of buckets in the redirect and offset tables.
    pub location_count: u32,

    /// Size in bytes of the location records region.
    pub locations_size: u32,

    /// Size in bytes of the string pool.
    pub strings_size: u32,

    /// Reserved. Always 0.
    pub reserved: u32,
}

impl Header {
    /// Construct a header for the current format version.
    pub fn new(
        resource_count: u32,
        location_count: u32,
        locations_size: u32,
        strings_size: u32,
    ) -> Self {
        Self {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            flags: 0,
            resource_count,
            location_count,
            locations_size,
            strings_size,
            reserved: 0,
        }
    }

    /// Parse and validate a header from the start of container data.
    ///
    /// `endian` is the byte order the caller expects the container to use.
    /// A container written in the opposite byte order is reported as
    /// [Error::WrongEndianness].
    pub fn parse(data: &[u8], endian: Endian) -> ImageResult<Self> {
        if data.len() < 4 {
            return Err(Error::BadMagic);
        }

        let magic = data.pread_with::<u32>(0, endian)?;

        if magic != MAGIC {
            return Err(if magic.swap_bytes() == MAGIC {
                Error::WrongEndianness
            } else {
                Error::BadMagic
            });
        }

        if data.len() < HEADER_SIZE {
            return Err(Error::Corrupt("header is truncated"));
        }

        let header = data.pread_with::<Header>(0, endian)?;
        header.validate()?;

        Ok(header)
    }

    /// Validate version and internal consistency.
    pub fn validate(&self) -> ImageResult<()> {
        if self.major_version > MAJOR_VERSION
            || (self.major_version == MAJOR_VERSION && self.minor_version > MINOR_VERSION)
        {
            return Err(Error::UnsupportedVersion {
                major: self.major_version,
                minor: self.minor_version,
            });
        }

        if self.resource_count > self.location_count {
            return Err(Error::Corrupt("more resources than index buckets"));
        }

        Ok(())
    }

    /// Write this header.
    pub fn write_to<W: Write>(&self, dest: &mut W, endian: Endian) -> std::io::Result<()> {
        dest.iowrite_with(*self, endian)
    }

    /// Offset of the redirect table.
    pub fn redirect_offset(&self) -> u64 {
        HEADER_SIZE as u64
    }

    /// Offset of the offset table.
    pub fn offsets_offset(&self) -> u64 {
        self.redirect_offset() + self.table_size()
    }

    /// Offset of the location records.
    pub fn locations_offset(&self) -> u64 {
        self.offsets_offset() + self.table_size()
    }

    /// Offset of the string pool.
    pub fn strings_offset(&self) -> u64 {
        self.locations_offset() + self.locations_size as u64
    }

    /// Total size of the header and all index regions.
    ///
    /// Content offsets are relative to this value.
    pub fn index_size(&self) -> u64 {
        self.strings_offset() + self.strings_size as u64
    }

    /// Size in bytes of each of the redirect and offset tables.
    pub fn table_size(&self) -> u64 {
        self.location_count as u64 * 4
    }
}

#[cfg(test)]
mod tests {
    use {super::*, scroll::ctx::SizeWith};

    fn header_bytes(header: &Header, endian: Endian) -> Vec<u8> {
        let mut data = vec![];
        header.write_to(&mut data, endian).unwrap();
        data
    }

    #[test]
    fn header_size() {
        assert_eq!(Header::size_with(&scroll::LE), HEADER_SIZE);
        assert_eq!(header_bytes(&Header::new(0, 0, 0, 0), scroll::BE).len(), HEADER_SIZE);
    }

    #[test]
    fn parse_written() -> ImageResult<()> {
        let header = Header::new(3, 4, 20, 30);

        for endian in [scroll::LE, scroll::BE] {
            assert_eq!(Header::parse(&header_bytes(&header, endian), endian)?, header);
        }

        Ok(())
    }

    #[test]
    fn layout() {
        let header = Header::new(3, 4, 20, 30);

        assert_eq!(header.redirect_offset(), 32);
        assert_eq!(header.offsets_offset(), 48);
        assert_eq!(header.locations_offset(), 64);
        assert_eq!(header.strings_offset(), 84);
        assert_eq!(header.index_size(), 114);
    }

    #[test]
    fn bad_magic() {
        let mut data = header_bytes(&Header::new(0, 0, 0, 0), scroll::LE);
        data[0] ^= 0xff;

        assert!(matches!(Header::parse(&data, scroll::LE), Err(Error::BadMagic)));
        assert!(matches!(Header::parse(b"ab", scroll::LE), Err(Error::BadMagic)));
    }

    #[test]
    fn wrong_endianness() {
        let data = header_bytes(&Header::new(0, 0, 0, 0), scroll::BE);

        assert!(matches!(
            Header::parse(&data, scroll::LE),
            Err(Error::WrongEndianness)
        ));
    }

    #[test]
    fn versions() {
        let mut header = Header::new(0, 0, 0, 0);

        header.major_version = MAJOR_VERSION + 1;
        header.minor_version = 0;
        assert!(matches!(
            Header::parse(&header_bytes(&header, scroll::LE), scroll::LE),
            Err(Error::UnsupportedVersion { .. })
        ));

        header.major_version = MAJOR_VERSION;
        header.minor_version = MINOR_VERSION + 1;
        assert!(matches!(
            Header::parse(&header_bytes(&header, scroll::LE), scroll::LE),
            Err(Error::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn truncated() {
        let data = header_bytes(&Header::new(0, 0, 0, 0), scroll::LE);

        assert!(matches!(
            Header::parse(&data[0..10], scroll::LE),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn more_resources_than_buckets() {
        let data = header_bytes(&Header::new(5, 4, 0, 0), scroll::LE);

        assert!(matches!(
            Header::parse(&data, scroll::LE),
            Err(Error::Corrupt(_))
        ));
    }
}
