// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Module image containers.

A *module image* packs many named binary resources (class files, data
files, etc) into a single file and allows any one of them to be located by
name in constant time, without scanning.

A container has the following layout:

```text
Header | Redirect[location_count] | Offsets[location_count] | Locations | Strings | Content
```

The redirect and offset tables form a hash-and-displace perfect hash. Every
resource name hashes to a bucket in the redirect table. A bucket is either
empty, points directly at a slot in the offset table, or holds a seed to
rehash the name with. The offset table slot locates a variable length
*location* record, which references its name components in a deduplicated
string pool and its bytes in the content region.

Lookups are pure computation over immutable memory. The full name of the
resolved record is always compared against the queried name, so names that
were never indexed can never produce a false positive.

Containers are produced by [ImageBuilder] and consumed by [ModuleImage].
[ImageRegistry] shares open containers between consumers.
*/

pub mod hash;
pub mod header;
pub mod index;
pub mod location;
pub mod reader;
pub mod registry;
pub mod strings;
pub mod writer;

pub use {
    crate::{
        header::{Header, HEADER_SIZE, MAGIC, MAJOR_VERSION, MINOR_VERSION},
        location::Location,
        reader::ModuleImage,
        registry::ImageRegistry,
        writer::{build, BuildOptions, ImageBuilder},
    },
    scroll::Endian,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad magic value encountered")]
    BadMagic,

    #[error("container byte order does not match the reader's byte order")]
    WrongEndianness,

    #[error("unsupported container version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("content range {offset}+{size} exceeds container length {length}")]
    TruncatedContainer { offset: u64, size: u64, length: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("container is corrupted: {0}")]
    Corrupt(&'static str),

    #[error("unknown location attribute tag: {0:#x}")]
    UnknownAttribute(u8),

    #[error("resource name cannot be stored: {0}")]
    InvalidName(String),

    #[error("invalid resource: {0}")]
    InvalidResource(&'static str),

    #[error("resource name added more than once: {0}")]
    DuplicateName(String),

    #[error("container region too large: {0}")]
    TooLarge(&'static str),

    #[error("no seed resolves the {group_size} names colliding in bucket {bucket}")]
    IndexConstructionFailed { bucket: u32, group_size: usize },

    #[error("resource not found: {0}")]
    NotFound(String),
}

/// Result type for this crate.
pub type ImageResult<T> = std::result::Result<T, Error>;
