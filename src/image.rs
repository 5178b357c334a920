use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use sha2::{Digest, Sha256};

use crate::block_set::BlockSet;
use crate::error::{BuildError, InputError, InvariantViolation};

/// Zero block is always `__ZERO`; every other distinguished key is prefixed
/// or exact as named here.
pub const ZERO_KEY: &str = "__ZERO";
pub const COPY_KEY: &str = "__COPY";
pub const NONZERO_PREFIX: &str = "__NONZERO-";

/// How far `extend()` grows the care set when computing the read-safety
/// margin (`Image::extended`).
pub const EXTEND_BLOCKS: u64 = 16;

/// Upper bound on the number of blocks collapsed into one synthetic
/// `__NONZERO-i` file-map group, mirroring the source tool's group cap so a
/// single unnamed extent doesn't balloon into one unbounded action.
pub const MAX_BLOCKS_PER_GROUP: u64 = 1024;

const SPARSE_MAGIC: u32 = 0xED26_FF3A;
const SPARSE_HEADER_LEN: usize = 28;

/// A read-only, random-access view of a block image plus its file-to-blocks
/// map.
///
/// `care` is the full addressable block range of the image: every block a
/// raw image exposes is something the builder must account for with some
/// action, whether that block is zero, named by the map file, or an
/// unnamed non-zero extent. The zero/non-zero scan performed at
/// construction is used only to bucket the *unnamed* remainder into the
/// `__ZERO` / `__NONZERO-i` groups, not to shrink `care` itself — shrinking
/// it would leave some target blocks with no action at all.
pub struct Image {
    image_path: PathBuf,
    block_size: u64,
    total_blocks: u64,
    care: BlockSet,
    extended: BlockSet,
    file_map: BTreeMap<String, BlockSet>,
}

impl Image {
    pub fn open(
        image_path: impl AsRef<Path>,
        map_path: Option<impl AsRef<Path>>,
        block_size: u64,
    ) -> Result<Self, BuildError> {
        let image_path = image_path.as_ref().to_path_buf();
        let file =
            File::open(&image_path).map_err(|e| BuildError::io(image_path.clone(), e))?;
        let file_len = file
            .metadata()
            .map_err(|e| BuildError::io(image_path.clone(), e))?
            .len();
        let total_blocks = file_len / block_size;

        // SAFETY: read-only mapping; the image file is not written to while
        // the builder holds this Image (no other writer shares the path).
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| BuildError::io(image_path.clone(), e))?;

        if is_sparse_header(&mmap) {
            return Err(InputError::SparseUnsupported(image_path).into());
        }

        let full_range = BlockSet::single_range(0, total_blocks);
        let care = full_range.clone();
        let extended = care
            .extend(EXTEND_BLOCKS)
            .intersect(&full_range)
            .subtract(&care);

        let mut remain = full_range.clone();
        let mut file_map = BTreeMap::new();

        if let Some(map_path) = map_path {
            let map_path = map_path.as_ref().to_path_buf();
            let map_file =
                File::open(&map_path).map_err(|_| InputError::UnreadableMap(map_path.clone()))?;
            for line in BufReader::new(map_file).lines() {
                let line = line.map_err(|_| InputError::UnreadableMap(map_path.clone()))?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let mut parts = line.splitn(2, char::is_whitespace);
                let key = parts
                    .next()
                    .ok_or_else(|| InputError::UnreadableMap(map_path.clone()))?
                    .to_string();
                let range_spec = parts
                    .next()
                    .ok_or_else(|| InputError::UnreadableMap(map_path.clone()))?
                    .trim();
                let range = BlockSet::parse_compact(range_spec)?;
                if range.intersect(&care).size() != range.size() {
                    return Err(InvariantViolation::MapInconsistent {
                        partition: image_path.display().to_string(),
                        key,
                    }
                    .into());
                }
                remain = remain.subtract(&range);
                file_map.insert(key, range);
            }
        }

        let reserved = if total_blocks > 0 {
            BlockSet::single_range(0, 1)
        } else {
            BlockSet::empty()
        };
        remain = remain.subtract(&reserved);

        let (zero_blocks, nonzero_groups) = classify_remainder(&mmap, block_size, &remain);

        if !zero_blocks.is_empty() {
            file_map.insert(ZERO_KEY.to_string(), zero_blocks);
        }
        for (i, group) in nonzero_groups.into_iter().enumerate() {
            file_map.insert(format!("{NONZERO_PREFIX}{i}"), group);
        }
        if !reserved.is_empty() {
            file_map.insert(COPY_KEY.to_string(), reserved);
        }

        Ok(Image {
            image_path,
            block_size,
            total_blocks,
            care,
            extended,
            file_map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.image_path
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn care(&self) -> &BlockSet {
        &self.care
    }

    pub fn extended(&self) -> &BlockSet {
        &self.extended
    }

    pub fn file_map(&self) -> &BTreeMap<String, BlockSet> {
        &self.file_map
    }

    pub fn get(&self, key: &str) -> Option<&BlockSet> {
        self.file_map.get(key)
    }

    /// SHA-256 of the bytes covered by `ranges`, as uppercase hex — the
    /// digest format the on-device updater expects in `bsdiff`/`pkgdiff`
    /// and `move` command lines.
    pub fn range_sha256(&self, ranges: &BlockSet) -> Result<String, BuildError> {
        let mut hasher = Sha256::new();
        self.for_each_block_range(ranges, |chunk| {
            hasher.update(chunk);
            Ok(())
        })?;
        Ok(hex::encode_upper(hasher.finalize()))
    }

    /// Read the full byte contents of `ranges` into one buffer. Used by
    /// callers (e.g. `PatchEngine`) that must materialize a slice to hand to
    /// an external process; prefer `write_range_to` when a destination
    /// writer is available instead, since it streams.
    pub fn read_range(&self, ranges: &BlockSet) -> Result<Vec<u8>, BuildError> {
        let mut buf = Vec::with_capacity((ranges.size() * self.block_size) as usize);
        self.for_each_block_range(ranges, |chunk| {
            buf.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(buf)
    }

    /// Stream the bytes covered by `ranges` directly into `dest`, one block
    /// range at a time, without materializing the whole selection.
    pub fn write_range_to<W: Write>(&self, ranges: &BlockSet, dest: &mut W) -> Result<(), BuildError> {
        self.for_each_block_range(ranges, |chunk| {
            dest.write_all(chunk)
                .map_err(|e| BuildError::io(self.image_path.clone(), e))
        })
    }

    fn for_each_block_range(
        &self,
        ranges: &BlockSet,
        mut f: impl FnMut(&[u8]) -> Result<(), BuildError>,
    ) -> Result<(), BuildError> {
        let mut file =
            File::open(&self.image_path).map_err(|e| BuildError::io(self.image_path.clone(), e))?;
        for (a, b) in ranges.iter_pairs() {
            let offset = a * self.block_size;
            let len = (b - a) * self.block_size;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| BuildError::io(self.image_path.clone(), e))?;
            let mut remaining = len;
            let mut chunk = vec![0u8; self.block_size as usize];
            while remaining > 0 {
                let take = remaining.min(self.block_size);
                let slice = &mut chunk[..take as usize];
                file.read_exact(slice)
                    .map_err(|e| BuildError::io(self.image_path.clone(), e))?;
                f(slice)?;
                remaining -= take;
            }
        }
        Ok(())
    }
}

/// Lightweight sparse-header check that reads only the first 28 bytes,
/// for callers (e.g. `FullImageBuilder`) that don't need the full
/// zero/non-zero scan `Image::open` performs.
pub fn reject_sparse(path: impl AsRef<Path>) -> Result<(), BuildError> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| BuildError::io(path.to_path_buf(), e))?;
    let mut header = [0u8; SPARSE_HEADER_LEN];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(BuildError::io(path.to_path_buf(), e)),
    }
    if is_sparse_header_bytes(&header) {
        return Err(InputError::SparseUnsupported(path.to_path_buf()).into());
    }
    Ok(())
}

fn is_sparse_header(mmap: &Mmap) -> bool {
    mmap.len() >= SPARSE_HEADER_LEN && is_sparse_header_bytes(&mmap[..SPARSE_HEADER_LEN])
}

fn is_sparse_header_bytes(header: &[u8]) -> bool {
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let major = u16::from_le_bytes(header[4..6].try_into().unwrap());
    let minor = u16::from_le_bytes(header[6..8].try_into().unwrap());
    let hdr_size = u16::from_le_bytes(header[8..10].try_into().unwrap());
    let chunk_hdr_size = u16::from_le_bytes(header[10..12].try_into().unwrap());
    magic == SPARSE_MAGIC && major == 1 && minor == 0 && hdr_size == 28 && chunk_hdr_size == 12
}

/// Read every block in `remain` and bucket it into the zero set or a series
/// of `__NONZERO-i` groups capped at `MAX_BLOCKS_PER_GROUP` blocks each.
fn classify_remainder(mmap: &Mmap, block_size: u64, remain: &BlockSet) -> (BlockSet, Vec<BlockSet>) {
    let zero_block = vec![0u8; block_size as usize];
    let mut zero_blocks = Vec::new();
    let mut nonzero_groups: Vec<Vec<u64>> = Vec::new();
    let mut current_group: Vec<u64> = Vec::new();

    for (a, b) in remain.iter_pairs() {
        for blk in a..b {
            let start = (blk * block_size) as usize;
            let end = start + block_size as usize;
            let data = mmap.get(start..end).unwrap_or(&[]);
            if data == zero_block.as_slice() {
                zero_blocks.push(blk);
            } else {
                current_group.push(blk);
                if current_group.len() as u64 >= MAX_BLOCKS_PER_GROUP {
                    nonzero_groups.push(std::mem::take(&mut current_group));
                }
            }
        }
    }
    if !current_group.is_empty() {
        nonzero_groups.push(current_group);
    }

    (
        BlockSet::from_blocks(zero_blocks),
        nonzero_groups
            .into_iter()
            .map(BlockSet::from_blocks)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_image(path: &Path, blocks: &[&[u8]]) {
        let mut f = File::create(path).unwrap();
        for b in blocks {
            f.write_all(b).unwrap();
        }
    }

    #[test]
    fn all_zero_image_maps_entirely_to_zero_key() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("all_zero.img");
        let zero = vec![0u8; 4096];
        write_image(&img_path, &[&zero, &zero, &zero, &zero]);

        let image = Image::open(&img_path, None::<&Path>, 4096).unwrap();
        assert_eq!(image.total_blocks(), 4);
        let zero_set = image.get(ZERO_KEY).expect("zero key present");
        assert_eq!(zero_set.size(), 4);
        assert!(image.get(NONZERO_PREFIX).is_none());
    }

    #[test]
    fn nonzero_blocks_land_in_a_nonzero_group() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("data.img");
        let zero = vec![0u8; 4096];
        let data = vec![0xAAu8; 4096];
        write_image(&img_path, &[&zero, &data, &data, &zero]);

        let image = Image::open(&img_path, None::<&Path>, 4096).unwrap();
        let nonzero = image.get(&format!("{NONZERO_PREFIX}0")).unwrap();
        assert_eq!(nonzero.size(), 2);
    }

    #[test]
    fn rejects_sparse_header() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("sparse.img");
        let mut header = vec![0u8; 4096];
        header[0..4].copy_from_slice(&SPARSE_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&1u16.to_le_bytes());
        header[6..8].copy_from_slice(&0u16.to_le_bytes());
        header[8..10].copy_from_slice(&28u16.to_le_bytes());
        header[10..12].copy_from_slice(&12u16.to_le_bytes());
        write_image(&img_path, &[&header]);

        let err = Image::open(&img_path, None::<&Path>, 4096).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Input(InputError::SparseUnsupported(_))
        ));
    }

    #[test]
    fn map_file_entries_are_honored_and_remainder_classified() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("fs.img");
        let zero = vec![0u8; 4096];
        let data = vec![0x11u8; 4096];
        // blocks: 0 reserved/copy, 1 named file, 2 zero, 3 unnamed nonzero
        write_image(&img_path, &[&zero, &data, &zero, &data]);

        let map_path = dir.path().join("fs.map");
        std::fs::write(&map_path, "system/bin/app 2,1,2\n").unwrap();

        let image = Image::open(&img_path, Some(&map_path), 4096).unwrap();
        assert_eq!(image.get("system/bin/app").unwrap().size(), 1);
        assert_eq!(image.get(ZERO_KEY).unwrap().size(), 1);
        assert_eq!(image.get(&format!("{NONZERO_PREFIX}0")).unwrap().size(), 1);
        assert_eq!(image.get(COPY_KEY).unwrap().size(), 1);
    }

    #[test]
    fn range_sha256_matches_manual_digest() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("hash.img");
        let data = vec![0x42u8; 4096 * 2];
        write_image(&img_path, &[&data]);

        let image = Image::open(&img_path, None::<&Path>, 4096).unwrap();
        let ranges = BlockSet::single_range(0, 2);
        let digest = image.range_sha256(&ranges).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let expected = hex::encode_upper(hasher.finalize());
        assert_eq!(digest, expected);
    }
}
