// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Module image construction. */

use {
    crate::{
        header::Header,
        index::{PerfectHash, DEFAULT_MAX_SEED},
        location::{LocationRecord, NameParts},
        strings::StringPoolBuilder,
        Error, ImageResult,
    },
    log::info,
    scroll::Endian,
    std::{collections::BTreeMap, io::Write},
};

/// Settings influencing how a container is written.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildOptions {
    /// Byte order of every multi-byte integer in the container.
    pub byte_order: Endian,

    /// Ratio of index buckets to resources.
    ///
    /// Values below 1.0 are treated as 1.0. Higher values make seed searches
    /// cheaper at the cost of larger tables.
    pub bucket_density: f64,

    /// Highest seed tried when resolving a collision group.
    pub max_seed: i32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            byte_order: scroll::NATIVE,
            bucket_density: 1.0,
            max_seed: DEFAULT_MAX_SEED,
        }
    }
}

impl BuildOptions {
    /// Number of index buckets to use for `resource_count` resources.
    pub fn location_count(&self, resource_count: usize) -> ImageResult<u32> {
        if resource_count == 0 {
            return Ok(0);
        }

        let count = (resource_count as f64 * self.bucket_density.max(1.0)).ceil();

        if count > i32::MAX as f64 {
            return Err(Error::TooLarge("index bucket count"));
        }

        Ok((count as u32).max(resource_count as u32))
    }
}

#[derive(Clone, Debug)]
struct PendingResource {
    data: Vec<u8>,
    compressed_size: u64,
    uncompressed_size: u64,
}

/// Collects resources and writes them out as a module image.
///
/// Resources are written in byte order of their names, so the output only
/// depends on the set of resources and the [BuildOptions].
#[derive(Clone, Debug, Default)]
pub struct ImageBuilder {
    options: BuildOptions,
    resources: BTreeMap<String, PendingResource>,
}

impl ImageBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self {
            options,
            resources: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Number of resources added so far.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Whether a resource with the given name has been added.
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    fn insert(&mut self, name: String, resource: PendingResource) -> ImageResult<()> {
        NameParts::split(&name)?;

        if self.resources.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }

        self.resources.insert(name, resource);

        Ok(())
    }

    /// Add an uncompressed resource.
    pub fn add_resource(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> ImageResult<()> {
        let data = data.into();

        self.insert(
            name.into(),
            PendingResource {
                compressed_size: 0,
                uncompressed_size: data.len() as u64,
                data,
            },
        )
    }

    /// Add a resource whose payload was already compressed.
    ///
    /// `stored` is written as-is. Readers see its length as the compressed
    /// size and `uncompressed_size` as the size of the decompressed bytes.
    pub fn add_compressed_resource(
        &mut self,
        name: impl Into<String>,
        stored: impl Into<Vec<u8>>,
        uncompressed_size: u64,
    ) -> ImageResult<()> {
        let data = stored.into();

        if data.is_empty() {
            return Err(Error::InvalidResource("compressed payload is empty"));
        }

        self.insert(
            name.into(),
            PendingResource {
                compressed_size: data.len() as u64,
                uncompressed_size,
                data,
            },
        )
    }

    /// Write the container.
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, dest: &mut W) -> ImageResult<u64> {
        let endian = self.options.byte_order;
        let names = self.resources.keys().map(String::as_str).collect::<Vec<_>>();

        let location_count = self.options.location_count(names.len())?;
        let hash = PerfectHash::build(&names, location_count, self.options.max_seed)?;

        let mut strings = StringPoolBuilder::default();
        let mut locations = Vec::new();
        let mut record_offsets = Vec::with_capacity(names.len());
        let mut content_size = 0u64;

        for (name, resource) in &self.resources {
            let parts = NameParts::split(name)?;

            let record = LocationRecord {
                module: strings.add(parts.module)? as u64,
                parent: strings.add(parts.parent)? as u64,
                base: strings.add(parts.base)? as u64,
                extension: strings.add(parts.extension)? as u64,
                content_offset: content_size,
                compressed_size: resource.compressed_size,
                uncompressed_size: resource.uncompressed_size,
            };

            record_offsets.push(
                u32::try_from(locations.len())
                    .map_err(|_| Error::TooLarge("location records"))?,
            );
            record.encode_to(&mut locations);

            content_size += resource.data.len() as u64;
        }

        let header = Header::new(
            names.len() as u32,
            location_count,
            u32::try_from(locations.len()).map_err(|_| Error::TooLarge("location records"))?,
            u32::try_from(strings.len()).map_err(|_| Error::TooLarge("string pool"))?,
        );

        header.write_to(dest, endian)?;
        hash.write_redirect(dest, endian)?;
        hash.write_offsets(&record_offsets, dest, endian)?;
        dest.write_all(&locations)?;
        dest.write_all(strings.as_bytes())?;

        for resource in self.resources.values() {
            dest.write_all(&resource.data)?;
        }

        info!(
            "wrote module image with {} resources ({} buckets, {} index bytes, {} content bytes)",
            names.len(),
            location_count,
            header.index_size(),
            content_size
        );

        Ok(header.index_size() + content_size)
    }

    /// Write the container to a new buffer.
    pub fn to_bytes(&self) -> ImageResult<Vec<u8>> {
        let mut data = Vec::new();
        self.write_to(&mut data)?;

        Ok(data)
    }
}

/// Build a container from a mapping of resource names to their bytes.
pub fn build<I, N, D>(names_to_bytes: I, options: &BuildOptions) -> ImageResult<Vec<u8>>
where
    I: IntoIterator<Item = (N, D)>,
    N: Into<String>,
    D: Into<Vec<u8>>,
{
    let mut builder = ImageBuilder::new(*options);

    for (name, data) in names_to_bytes {
        builder.add_resource(name, data)?;
    }

    builder.to_bytes()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::header::{HEADER_SIZE, MAGIC},
        scroll::Pread,
    };

    #[test]
    fn write_empty() -> ImageResult<()> {
        let options = BuildOptions {
            byte_order: scroll::LE,
            ..Default::default()
        };
        let data = ImageBuilder::new(options).to_bytes()?;

        // Header followed by a pool holding the empty string.
        assert_eq!(data.len(), HEADER_SIZE + 1);
        assert_eq!(data.pread_with::<u32>(0, scroll::LE)?, MAGIC);

        let header = Header::parse(&data, scroll::LE)?;
        assert_eq!(header.resource_count, 0);
        assert_eq!(header.location_count, 0);
        assert_eq!(header.locations_size, 0);
        assert_eq!(header.strings_size, 1);

        Ok(())
    }

    #[test]
    fn write_single() -> ImageResult<()> {
        let options = BuildOptions {
            byte_order: scroll::BE,
            ..Default::default()
        };
        let mut builder = ImageBuilder::new(options);
        builder.add_resource("/m/foo.txt", b"hello".to_vec())?;
        let data = builder.to_bytes()?;

        let header = Header::parse(&data, scroll::BE)?;
        assert_eq!(header.resource_count, 1);
        assert_eq!(header.location_count, 1);

        // The only bucket points directly at slot 0, which holds record 0.
        assert_eq!(data.pread_with::<i32>(HEADER_SIZE, scroll::BE)?, -1);
        assert_eq!(data.pread_with::<u32>(HEADER_SIZE + 4, scroll::BE)?, 0);

        let mut expected_locations = vec![];
        LocationRecord {
            module: 1,
            base: 3,
            extension: 7,
            uncompressed_size: 5,
            ..Default::default()
        }
        .encode_to(&mut expected_locations);

        let locations_start = header.locations_offset() as usize;
        let strings_start = header.strings_offset() as usize;
        let index_size = header.index_size() as usize;

        assert_eq!(&data[locations_start..strings_start], &expected_locations);
        assert_eq!(&data[strings_start..index_size], b"\0m\0foo\0txt\0");
        assert_eq!(&data[index_size..], b"hello");

        Ok(())
    }

    #[test]
    fn location_count_policy() -> ImageResult<()> {
        let mut options = BuildOptions::default();
        assert_eq!(options.location_count(0)?, 0);
        assert_eq!(options.location_count(10)?, 10);

        options.bucket_density = 1.5;
        assert_eq!(options.location_count(10)?, 15);
        assert_eq!(options.location_count(3)?, 5);

        options.bucket_density = 0.5;
        assert_eq!(options.location_count(10)?, 10);

        options.bucket_density = f64::NAN;
        assert_eq!(options.location_count(10)?, 10);

        Ok(())
    }

    #[test]
    fn rejects_duplicates_and_bad_names() -> ImageResult<()> {
        let mut builder = ImageBuilder::default();
        builder.add_resource("/m/a", vec![1])?;

        assert!(matches!(
            builder.add_resource("/m/a", vec![2]),
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(
            builder.add_resource("/a", vec![2]),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            builder.add_compressed_resource("/m/b", vec![], 10),
            Err(Error::InvalidResource(_))
        ));
        assert_eq!(builder.len(), 1);
        assert!(builder.contains("/m/a"));

        Ok(())
    }

    #[test]
    fn deterministic_regardless_of_insertion_order() -> ImageResult<()> {
        let names = (0..200)
            .map(|i| (format!("/mod{}/p/r{}.bin", i % 3, i), vec![i as u8; i % 17]))
            .collect::<Vec<_>>();

        let options = BuildOptions::default();
        let forward = build(names.clone(), &options)?;
        let reverse = build(names.into_iter().rev(), &options)?;

        assert_eq!(forward, reverse);

        Ok(())
    }

    #[test]
    fn write_to_reports_size() -> ImageResult<()> {
        let mut builder = ImageBuilder::default();
        builder.add_resource("a.txt", b"abc".to_vec())?;
        builder.add_compressed_resource("/m/b.z", vec![9, 9], 100)?;

        let mut data = vec![];
        let written = builder.write_to(&mut data)?;
        assert_eq!(written, data.len() as u64);

        Ok(())
    }
}
