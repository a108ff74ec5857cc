// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Redirect and offset tables.

The tables form a hash-and-displace perfect hash over resource names. The
redirect table has one `i32` per bucket:

* `0` - no name hashes to this bucket.
* `< 0` - exactly one name hashes here. Its slot is `-value - 1`.
* `> 0` - several names hash here. `value` is the seed to rehash them with.

The offset table has one `u32` per slot: the offset of a location record
within the location records region.
*/

use {
    crate::{
        hash::{bucket, seeded_slot},
        Error, ImageResult,
    },
    log::debug,
    scroll::{Endian, IOwrite, Pread},
    std::io::Write,
};

/// Default upper bound of the seed search for a collision group.
pub const DEFAULT_MAX_SEED: i32 = 0x00ff_ffff;

/// Read-only view of the redirect and offset tables of a container.
#[derive(Clone, Copy, Debug)]
pub struct IndexTables<'a> {
    redirect: &'a [u8],
    offsets: &'a [u8],
    length: u32,
    endian: Endian,
}

impl<'a> IndexTables<'a> {
    /// Construct an instance from raw table data.
    ///
    /// Both tables must hold exactly `length` 4 byte entries.
    pub fn new(
        redirect: &'a [u8],
        offsets: &'a [u8],
        length: u32,
        endian: Endian,
    ) -> ImageResult<Self> {
        let expected = length as usize * 4;

        if redirect.len() != expected || offsets.len() != expected {
            return Err(Error::Corrupt("index table size mismatch"));
        }

        Ok(Self {
            redirect,
            offsets,
            length,
            endian,
        })
    }

    /// Number of buckets.
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The redirect value of a bucket.
    pub fn redirect(&self, bucket: u32) -> ImageResult<i32> {
        Ok(self
            .redirect
            .pread_with::<i32>(bucket as usize * 4, self.endian)?)
    }

    /// The location record offset stored in a slot.
    pub fn offset(&self, slot: u32) -> ImageResult<u32> {
        Ok(self
            .offsets
            .pread_with::<u32>(slot as usize * 4, self.endian)?)
    }

    /// Resolve the slot a name would occupy, if its bucket is in use.
    ///
    /// The returned slot is only a candidate: the record it locates may be
    /// for a different name and callers must verify it.
    pub fn candidate_slot(&self, name: &[u8]) -> ImageResult<Option<u32>> {
        if self.length == 0 {
            return Ok(None);
        }

        let value = self.redirect(bucket(name, self.length))?;

        let slot = match value {
            0 => return Ok(None),
            v if v < 0 => (-(v as i64) - 1) as u64,
            seed => seeded_slot(name, seed, self.length) as u64,
        };

        if slot >= self.length as u64 {
            return Err(Error::Corrupt("redirect points outside of index"));
        }

        Ok(Some(slot as u32))
    }

    /// Resolve the candidate location record offset for a name.
    pub fn candidate_offset(&self, name: &[u8]) -> ImageResult<Option<u32>> {
        match self.candidate_slot(name)? {
            Some(slot) => Ok(Some(self.offset(slot)?)),
            None => Ok(None),
        }
    }
}

/// A perfect hash assignment for a set of names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerfectHash {
    /// Redirect table values, one per bucket.
    pub redirect: Vec<i32>,

    /// The slot assigned to each input name, by input position.
    pub slots: Vec<u32>,
}

impl PerfectHash {
    /// Assign every name a distinct slot in a table of `length` buckets.
    ///
    /// Collision groups are resolved first, largest first, by searching
    /// seeds `1..=max_seed`. Names alone in their bucket then take the
    /// remaining free slots in ascending order. The result only depends on
    /// the order of `names`.
    pub fn build<S: AsRef<[u8]>>(names: &[S], length: u32, max_seed: i32) -> ImageResult<Self> {
        if names.len() > length as usize {
            return Err(Error::TooLarge("more names than index buckets"));
        }
        if length > i32::MAX as u32 {
            return Err(Error::TooLarge("index bucket count"));
        }

        let mut redirect = vec![0i32; length as usize];
        let mut slots = vec![u32::MAX; names.len()];

        if names.is_empty() {
            return Ok(Self { redirect, slots });
        }

        let mut buckets = vec![vec![]; length as usize];
        for (i, name) in names.iter().enumerate() {
            buckets[bucket(name.as_ref(), length) as usize].push(i);
        }

        let mut groups = (0..length as usize)
            .filter(|b| buckets[*b].len() > 1)
            .collect::<Vec<_>>();
        groups.sort_by(|a, b| buckets[*b].len().cmp(&buckets[*a].len()).then(a.cmp(b)));

        let mut occupied = vec![false; length as usize];

        for b in groups {
            let group = &buckets[b];
            let (seed, group_slots) =
                find_seed(names, group, &occupied, length, max_seed).ok_or(
                    Error::IndexConstructionFailed {
                        bucket: b as u32,
                        group_size: group.len(),
                    },
                )?;

            redirect[b] = seed;
            for (entry, slot) in group.iter().zip(group_slots) {
                occupied[slot as usize] = true;
                slots[*entry] = slot;
            }
        }

        let mut free = (0..length).filter(|slot| !occupied[*slot as usize]);

        for (b, group) in buckets.iter().enumerate() {
            if let [entry] = group.as_slice() {
                let slot = free.next().ok_or(Error::IndexConstructionFailed {
                    bucket: b as u32,
                    group_size: 1,
                })?;

                redirect[b] = -(slot as i32) - 1;
                slots[*entry] = slot;
            }
        }

        Ok(Self { redirect, slots })
    }

    /// Number of buckets.
    pub fn len(&self) -> u32 {
        self.redirect.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.redirect.is_empty()
    }

    /// Write the redirect table.
    pub fn write_redirect<W: Write>(&self, dest: &mut W, endian: Endian) -> std::io::Result<()> {
        for value in &self.redirect {
            dest.iowrite_with(*value, endian)?;
        }

        Ok(())
    }

    /// Write the offset table given the record offset of each input name.
    pub fn write_offsets<W: Write>(
        &self,
        record_offsets: &[u32],
        dest: &mut W,
        endian: Endian,
    ) -> std::io::Result<()> {
        let mut table = vec![0u32; self.redirect.len()];
        for (slot, offset) in self.slots.iter().zip(record_offsets) {
            table[*slot as usize] = *offset;
        }

        for value in table {
            dest.iowrite_with(value, endian)?;
        }

        Ok(())
    }
}

fn find_seed<S: AsRef<[u8]>>(
    names: &[S],
    group: &[usize],
    occupied: &[bool],
    length: u32,
    max_seed: i32,
) -> Option<(i32, Vec<u32>)> {
    let mut claimed = Vec::with_capacity(group.len());

    'seeds: for seed in 1..=max_seed {
        claimed.clear();

        for entry in group {
            let slot = seeded_slot(names[*entry].as_ref(), seed, length);

            if occupied[slot as usize] || claimed.contains(&slot) {
                continue 'seeds;
            }

            claimed.push(slot);
        }

        if seed > 10_000 {
            debug!(
                "resolved {} colliding names after {} seeds",
                group.len(),
                seed
            );
        }

        return Some((seed, claimed));
    }

    None
}
