// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading module image containers. */

use {
    crate::{
        header::Header,
        index::IndexTables,
        location::{Location, LocationRecord},
        strings::StringPool,
        Error, ImageResult,
    },
    log::debug,
    scroll::Endian,
    std::{
        collections::BTreeSet,
        fs::File,
        io::Read,
        path::{Path, PathBuf},
    },
};

#[cfg(not(unix))]
use std::{
    io::{Seek, SeekFrom},
    sync::Mutex,
};

/// Memory holding the index regions.
#[derive(Debug)]
enum Backing {
    /// Index regions mapped from a file.
    Mapped(memmap2::Mmap),

    /// The entire container in memory.
    Owned(Vec<u8>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => &map[..],
            Self::Owned(data) => &data[..],
        }
    }
}

/// A file that content is read from at explicit offsets.
#[derive(Debug)]
struct ContentFile {
    #[cfg(unix)]
    file: File,

    // Without pread, seek + read must not interleave between threads.
    #[cfg(not(unix))]
    file: Mutex<File>,
}

impl ContentFile {
    #[cfg(unix)]
    fn new(file: File) -> Self {
        Self { file }
    }

    #[cfg(not(unix))]
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "content lock poisoned"))?;

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

/// Read-only interface to a single module image.
///
/// Index regions are immutable after opening, so an instance can serve
/// lookups and reads from any number of threads concurrently.
#[derive(Debug)]
pub struct ModuleImage {
    /// Filesystem path the container was opened from.
    path: Option<PathBuf>,

    /// Parsed file header.
    header: Header,

    /// Byte order of the container.
    endian: Endian,

    /// Holds at least the header and index regions.
    backing: Backing,

    /// Source of content bytes when not held in `backing`.
    content_file: Option<ContentFile>,

    /// Total length of the container in bytes.
    length: u64,
}

impl ModuleImage {
    /// Open a container file in native byte order.
    pub fn open(path: impl AsRef<Path>) -> ImageResult<Self> {
        Self::open_with_endian(path, scroll::NATIVE)
    }

    /// Open a container file written in a specific byte order.
    ///
    /// The index regions are memory mapped. Content is read on demand.
    pub fn open_with_endian(path: impl AsRef<Path>, endian: Endian) -> ImageResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let length = file.metadata()?.len();

        let mut header_data = Vec::with_capacity(crate::HEADER_SIZE);
        (&file)
            .take(crate::HEADER_SIZE as u64)
            .read_to_end(&mut header_data)?;

        let header = Header::parse(&header_data, endian)?;
        let index_size = header.index_size();

        if index_size > length {
            return Err(Error::Corrupt("container is shorter than its index"));
        }

        let index_len =
            usize::try_from(index_size).map_err(|_| Error::TooLarge("index regions"))?;
        let map = unsafe { memmap2::MmapOptions::new().len(index_len).map(&file) }?;

        debug!(
            "opened module image {} ({} resources, {} buckets, {} index bytes)",
            path.display(),
            header.resource_count,
            header.location_count,
            index_size
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            header,
            endian,
            backing: Backing::Mapped(map),
            content_file: Some(ContentFile::new(file)),
            length,
        })
    }

    /// Construct an instance from an in-memory container in native byte order.
    pub fn from_bytes(data: Vec<u8>) -> ImageResult<Self> {
        Self::from_bytes_with_endian(data, scroll::NATIVE)
    }

    /// Construct an instance from an in-memory container.
    pub fn from_bytes_with_endian(data: Vec<u8>, endian: Endian) -> ImageResult<Self> {
        let header = Header::parse(&data, endian)?;
        let length = data.len() as u64;

        if header.index_size() > length {
            return Err(Error::Corrupt("container is shorter than its index"));
        }

        Ok(Self {
            path: None,
            header,
            endian,
            backing: Backing::Owned(data),
            content_file: None,
            length,
        })
    }

    /// The path this container was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Obtain the parsed [Header].
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Byte order of the container.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Offset at which the content region begins.
    pub fn index_size(&self) -> u64 {
        self.header.index_size()
    }

    /// Total length of the container file in bytes.
    pub fn file_len(&self) -> u64 {
        self.length
    }

    /// Whether the container holds no resources.
    pub fn is_empty(&self) -> bool {
        self.header.resource_count == 0
    }

    /// Number of resources in the container.
    pub fn resource_count(&self) -> u32 {
        self.header.resource_count
    }

    fn region(&self, offset: u64, size: u64) -> &[u8] {
        // Bounds were validated against index_size() when opening.
        &self.backing.as_slice()[offset as usize..(offset + size) as usize]
    }

    fn tables(&self) -> ImageResult<IndexTables<'_>> {
        IndexTables::new(
            self.region(self.header.redirect_offset(), self.header.table_size()),
            self.region(self.header.offsets_offset(), self.header.table_size()),
            self.header.location_count,
            self.endian,
        )
    }

    fn locations_data(&self) -> &[u8] {
        self.region(
            self.header.locations_offset(),
            self.header.locations_size as u64,
        )
    }

    fn strings(&self) -> StringPool<'_> {
        StringPool::new(self.region(
            self.header.strings_offset(),
            self.header.strings_size as u64,
        ))
    }

    /// Decode the location record at an offset within the location records.
    pub fn location_at(&self, offset: u32) -> ImageResult<Location<'_>> {
        let data = self
            .locations_data()
            .get(offset as usize..)
            .filter(|data| !data.is_empty())
            .ok_or(Error::Corrupt("location offset out of bounds"))?;

        Location::decode(data, &self.strings())
    }

    /// Find the location of a resource by its full name.
    ///
    /// `None` means the container has no resource with this name.
    pub fn find(&self, name: &str) -> ImageResult<Option<Location<'_>>> {
        let offset = match self.tables()?.candidate_offset(name.as_bytes())? {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let location = self.location_at(offset)?;

        Ok(if location.matches(name) {
            Some(location)
        } else {
            None
        })
    }

    /// Find a resource given its module and its path within the module.
    pub fn find_in_module(&self, module: &str, path: &str) -> ImageResult<Option<Location<'_>>> {
        self.find(&format!("/{}/{}", module, path))
    }

    /// Read the bytes of a range of the content region.
    ///
    /// `offset` is relative to the start of the content region.
    pub fn read_content(&self, offset: u64, size: u64) -> ImageResult<Vec<u8>> {
        let start = self
            .index_size()
            .checked_add(offset)
            .filter(|start| start.checked_add(size).map_or(false, |end| end <= self.length))
            .ok_or(Error::TruncatedContainer {
                offset,
                size,
                length: self.length,
            })?;

        let mut buf = vec![0; usize::try_from(size).map_err(|_| Error::TooLarge("resource"))?];

        match &self.content_file {
            Some(file) => file.read_exact_at(&mut buf, start)?,
            None => buf.copy_from_slice(self.region(start, size)),
        }

        Ok(buf)
    }

    /// Read the stored bytes of a resource.
    ///
    /// Compressed resources are returned as stored.
    pub fn read(&self, location: &Location) -> ImageResult<Vec<u8>> {
        self.read_content(location.content_offset, location.stored_size())
    }

    /// Find and read a resource by name.
    pub fn read_by_name(&self, name: &str) -> ImageResult<Vec<u8>> {
        let location = self
            .find(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        self.read(&location)
    }

    /// Iterate over every location record, in storage order.
    ///
    /// This walks the records directly and does not use the index.
    pub fn locations(&self) -> LocationIterator<'_> {
        LocationIterator {
            data: self.locations_data(),
            pos: 0,
            remaining: self.header.resource_count,
            pool: self.strings(),
        }
    }

    /// Full names of every resource, in storage order.
    pub fn entry_names(&self) -> ImageResult<Vec<String>> {
        self.locations()
            .map(|location| location.map(|l| l.full_name()))
            .collect()
    }

    /// Distinct non-empty module names, sorted.
    pub fn module_names(&self) -> ImageResult<Vec<String>> {
        let mut modules = BTreeSet::new();

        for location in self.locations() {
            let module = location?.module();

            if !module.is_empty() {
                modules.insert(module);
            }
        }

        Ok(modules.into_iter().map(String::from).collect())
    }

    /// Check that every record is reachable through the index and that its
    /// content lies within the container.
    ///
    /// Returns the number of records checked.
    pub fn verify(&self) -> ImageResult<usize> {
        let mut count = 0;

        for location in self.locations() {
            let location = location?;
            let name = location.full_name();

            match self.find(&name)? {
                Some(found) if found == location => {}
                _ => return Err(Error::Corrupt("record is not reachable through the index")),
            }

            let end = self
                .index_size()
                .checked_add(location.content_offset)
                .and_then(|start| start.checked_add(location.stored_size()));

            if end.map_or(true, |end| end > self.length) {
                return Err(Error::TruncatedContainer {
                    offset: location.content_offset,
                    size: location.stored_size(),
                    length: self.length,
                });
            }

            count += 1;
        }

        Ok(count)
    }
}

/// Iterator over the location records of a [ModuleImage].
pub struct LocationIterator<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: u32,
    pool: StringPool<'a>,
}

impl<'a> Iterator for LocationIterator<'a> {
    type Item = ImageResult<Location<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;

        let res = LocationRecord::decode(&self.data[self.pos.min(self.data.len())..])
            .and_then(|(record, consumed)| {
                self.pos += consumed;
                Location::resolve(&record, &self.pool)
            });

        if res.is_err() {
            self.remaining = 0;
        }

        Some(res)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}
