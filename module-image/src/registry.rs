// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Sharing open containers between consumers. */

use {
    crate::{reader::ModuleImage, ImageResult},
    log::debug,
    scroll::Endian,
    std::{
        collections::{BTreeSet, HashMap},
        path::{Path, PathBuf},
        sync::{Arc, Mutex, MutexGuard},
    },
};

#[derive(Debug)]
struct RegistryEntry {
    image: Arc<ModuleImage>,
    opens: usize,

    /// Absolute paths the container was requested under.
    aliases: BTreeSet<PathBuf>,
}

/// Make a path absolute without touching the filesystem.
fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Tracks open containers so each file is opened once.
///
/// Every [Self::open] of a path must be paired with a [Self::close]. The
/// registry drops its handle once the last consumer closes the path.
/// Handles already given out remain valid until they are dropped.
#[derive(Debug)]
pub struct ImageRegistry {
    endian: Endian,
    images: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new(scroll::NATIVE)
    }
}

impl ImageRegistry {
    /// Construct an empty registry opening containers in a given byte order.
    pub fn new(endian: Endian) -> Self {
        Self {
            endian,
            images: Mutex::new(HashMap::new()),
        }
    }

    fn images(&self) -> MutexGuard<'_, HashMap<PathBuf, RegistryEntry>> {
        // Entries are only mutated after fallible work completes.
        self.images
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve the key of a registered container.
    ///
    /// Falls back to the paths containers were opened under, so entries can
    /// be found after their file was removed or renamed.
    fn registered_key(
        images: &HashMap<PathBuf, RegistryEntry>,
        path: &Path,
    ) -> ImageResult<Option<PathBuf>> {
        if let Ok(key) = path.canonicalize() {
            if images.contains_key(&key) {
                return Ok(Some(key));
            }
        }

        let alias = absolute_path(path)?;

        Ok(images
            .iter()
            .find(|(_, entry)| entry.aliases.contains(&alias))
            .map(|(key, _)| key.clone()))
    }

    /// Obtain a shared handle to the container at `path`, opening it if needed.
    pub fn open(&self, path: impl AsRef<Path>) -> ImageResult<Arc<ModuleImage>> {
        let path = path.as_ref();
        let key = path.canonicalize()?;
        let alias = absolute_path(path)?;
        let mut images = self.images();

        if let Some(entry) = images.get_mut(&key) {
            entry.opens += 1;
            entry.aliases.insert(alias);
            return Ok(entry.image.clone());
        }

        let image = Arc::new(ModuleImage::open_with_endian(&key, self.endian)?);
        debug!("registered module image {}", key.display());

        images.insert(
            key,
            RegistryEntry {
                image: image.clone(),
                opens: 1,
                aliases: BTreeSet::from([alias]),
            },
        );

        Ok(image)
    }

    /// Release one open of the container at `path`.
    ///
    /// The file does not need to exist anymore. Returns whether the registry
    /// no longer holds the container.
    pub fn close(&self, path: impl AsRef<Path>) -> ImageResult<bool> {
        let mut images = self.images();

        let key = match Self::registered_key(&images, path.as_ref())? {
            Some(key) => key,
            None => return Ok(true),
        };

        let released = match images.get_mut(&key) {
            Some(entry) if entry.opens > 1 => {
                entry.opens -= 1;
                false
            }
            Some(_) => {
                images.remove(&key);
                debug!("released module image {}", key.display());
                true
            }
            None => true,
        };

        Ok(released)
    }

    /// Number of outstanding opens of the container at `path`.
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        let images = self.images();

        Self::registered_key(&images, path.as_ref())
            .ok()
            .flatten()
            .and_then(|key| images.get(&key).map(|entry| entry.opens))
            .unwrap_or(0)
    }

    /// Number of distinct containers held.
    pub fn len(&self) -> usize {
        self.images().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images().is_empty()
    }

    /// Drop every held container regardless of outstanding opens.
    pub fn clear(&self) {
        self.images().clear();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::writer::ImageBuilder, anyhow::Result};

    fn write_image(dir: &Path, name: &str) -> Result<PathBuf> {
        let mut builder = ImageBuilder::default();
        builder.add_resource("/m/hello.txt", name.as_bytes().to_vec())?;

        let path = dir.join(name);
        std::fs::write(&path, builder.to_bytes()?)?;

        Ok(path)
    }

    #[test]
    fn shares_handles() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = write_image(temp_dir.path(), "a.image")?;

        let registry = ImageRegistry::default();
        let first = registry.open(&path)?;
        let second = registry.open(&path)?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.open_count(&path), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(second.read_by_name("/m/hello.txt")?, b"a.image");

        assert!(!registry.close(&path)?);
        assert_eq!(registry.open_count(&path), 1);
        assert!(registry.close(&path)?);
        assert_eq!(registry.open_count(&path), 0);
        assert!(registry.is_empty());

        // Handles outlive the registry entry.
        assert_eq!(first.read_by_name("/m/hello.txt")?, b"a.image");

        Ok(())
    }

    #[test]
    fn distinct_paths() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let a = write_image(temp_dir.path(), "a.image")?;
        let b = write_image(temp_dir.path(), "b.image")?;

        let registry = ImageRegistry::default();
        let image_a = registry.open(&a)?;
        let image_b = registry.open(&b)?;

        assert!(!Arc::ptr_eq(&image_a, &image_b));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn close_after_file_removed() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = write_image(temp_dir.path(), "a.image")?;

        let registry = ImageRegistry::default();
        let image = registry.open(&path)?;
        registry.open(&path)?;

        std::fs::remove_file(&path)?;

        assert_eq!(registry.open_count(&path), 2);
        assert!(!registry.close(&path)?);
        assert!(registry.close(&path)?);
        assert!(registry.is_empty());

        // The mapping outlives the directory entry.
        assert_eq!(image.read_by_name("/m/hello.txt")?, b"a.image");

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn close_after_file_renamed() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = write_image(temp_dir.path(), "a.image")?;

        let registry = ImageRegistry::default();
        registry.open(&path)?;

        std::fs::rename(&path, temp_dir.path().join("b.image"))?;

        assert!(registry.close(&path)?);
        assert!(registry.is_empty());

        Ok(())
    }

    #[test]
    fn open_failure_not_registered() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("bogus.image");
        std::fs::write(&path, b"not a module image")?;

        let registry = ImageRegistry::default();
        assert!(registry.open(&path).is_err());
        assert!(registry.is_empty());

        Ok(())
    }
}
