use crate::storage::{ReadableStorageExt, StorageError, VirtualFile};
use binrw::{BinRead, BinWrite};
use num_integer::Integer;
use std::io::Cursor;

/// The on-disk B+-tree-like index shared by the indirect, sparse,
/// AES-CTR-Ex and compressed storages.
///
/// Layout: a 16-byte header, then `1 + L2_count` interior nodes of
/// `node_size` bytes (node 0 is L1), then one entry-set node of `node_size`
/// bytes per entry set. Interior nodes hold sorted virtual offsets; entry
/// sets hold the client storage's fixed-size entries, each of which leads
/// with its virtual offset.
#[derive(Debug)]
pub struct BucketTree {
    node_storage: VirtualFile,
    entry_storage: VirtualFile,
    node_l1: Vec<u8>,
    node_size: usize,
    entry_size: usize,
    entry_count: i32,
    offset_count: i32,
    entry_set_count: i32,
    offsets: Offsets,
}

pub const NODE_SIZE_MIN: usize = 1024;
pub const NODE_SIZE_MAX: usize = 512 * 1024;

const NODE_HEADER_SIZE: usize = 0x10;
const OFFSET_SIZE: usize = 8;

pub const BUCKET_TREE_MAGIC: [u8; 4] = *b"BKTR";
pub const BUCKET_TREE_VERSION: u32 = 1;

/// The 16-byte header stored in front of a bucket-tree table region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct BucketTreeHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: i32,
    pub reserved: u32,
}

impl BucketTreeHeader {
    pub fn verify(&self) -> Result<(), StorageError> {
        if self.magic != BUCKET_TREE_MAGIC {
            return Err(StorageError::InvalidBucketTreeSignature {});
        }
        if self.version > BUCKET_TREE_VERSION {
            return Err(StorageError::InvalidBucketTreeVersion {});
        }
        if self.entry_count < 0 {
            return Err(StorageError::InvalidBucketTreeEntryCount {});
        }
        Ok(())
    }

    /// Parses and verifies a header from raw bytes (the FS header carries
    /// tree headers inline).
    pub fn parse(data: &[u8]) -> Result<Self, StorageError> {
        let header = Self::read(&mut Cursor::new(data))
            .map_err(|_| StorageError::InvalidBucketTreeSignature {})?;
        header.verify()?;
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeHeader {
    index: i32,
    count: i32,
    offset: u64,
}

impl NodeHeader {
    fn parse(buf: &[u8]) -> Self {
        Self {
            index: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            count: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }

    fn verify(&self, node_index: i32, node_size: usize, entry_size: usize) -> Result<(), StorageError> {
        if self.index != node_index {
            return Err(StorageError::InvalidBucketTreeNodeIndex {});
        }
        let max_entries = ((node_size - NODE_HEADER_SIZE) / entry_size) as i32;
        if self.count <= 0 || self.count > max_entries {
            return Err(StorageError::InvalidBucketTreeNodeEntryCount {});
        }
        Ok(())
    }
}

/// The virtual extent covered by a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub start_offset: u64,
    pub end_offset: u64,
}

impl Offsets {
    pub fn is_include(&self, offset: u64) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }

    pub fn is_include_range(&self, offset: u64, size: u64) -> bool {
        size > 0
            && self.start_offset <= offset
            && offset <= self.end_offset
            && size <= self.end_offset - offset
    }
}

/// Result of a continuous-reading scan: how much the caller can read in one
/// merged access and how many entries it may skip.
#[derive(Debug, Default)]
pub struct ContinuousReadingInfo {
    read_size: u64,
    skip_count: i32,
    done: bool,
}

impl ContinuousReadingInfo {
    pub fn reset(&mut self) {
        self.read_size = 0;
        self.skip_count = 0;
        self.done = false;
    }

    pub fn check_need_scan(&mut self) -> bool {
        self.skip_count -= 1;
        self.skip_count <= 0
    }

    pub fn done(&mut self) {
        self.read_size = 0;
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn can_do(&self) -> bool {
        self.read_size > 0
    }

    pub fn read_size(&self) -> u64 {
        self.read_size
    }
}

/// Adapter the continuous-reading scan uses to interpret a client entry.
pub trait ContinuousReadingEntry: for<'a> BinRead<Args<'a> = ()> {
    /// Fragment runs shorter than this may be merged over.
    const FRAGMENT_SIZE_MAX: u64;

    fn virtual_offset(&self) -> u64;
    fn physical_offset(&self) -> u64;
    fn is_fragment(&self) -> bool;
}

fn read_offset_at(buf: &[u8], index: usize) -> u64 {
    let at = NODE_HEADER_SIZE + index * OFFSET_SIZE;
    u64::from_le_bytes(buf[at..at + OFFSET_SIZE].try_into().unwrap())
}

/// First index in `[0, count)` whose stored offset exceeds `value`.
fn upper_bound(buf: &[u8], base_index: usize, count: usize, value: u64) -> usize {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if read_offset_at(buf, base_index + mid) <= value {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

fn entry_offset_in_set(entry_size: usize, entry_index: i32) -> usize {
    NODE_HEADER_SIZE + entry_index as usize * entry_size
}

fn entry_virtual_offset(set_buf: &[u8], entry_size: usize, entry_index: i32) -> u64 {
    let at = entry_offset_in_set(entry_size, entry_index);
    u64::from_le_bytes(set_buf[at..at + OFFSET_SIZE].try_into().unwrap())
}

impl BucketTree {
    fn entry_count_per_node(node_size: usize, entry_size: usize) -> i32 {
        ((node_size - NODE_HEADER_SIZE) / entry_size) as i32
    }

    fn offset_count_per_node(node_size: usize) -> i32 {
        ((node_size - NODE_HEADER_SIZE) / OFFSET_SIZE) as i32
    }

    fn entry_set_count(node_size: usize, entry_size: usize, entry_count: i32) -> i32 {
        Integer::div_ceil(&entry_count, &Self::entry_count_per_node(node_size, entry_size))
    }

    fn node_l2_count(node_size: usize, entry_size: usize, entry_count: i32) -> i32 {
        let offset_count = Self::offset_count_per_node(node_size);
        let entry_set_count = Self::entry_set_count(node_size, entry_size, entry_count);

        if entry_set_count <= offset_count {
            return 0;
        }

        let node_l2_count = Integer::div_ceil(&entry_set_count, &offset_count);
        debug_assert!(node_l2_count <= offset_count);

        // Spare L1 slots inline the offsets of the first entry sets, so the
        // L2 nodes only carry the remainder.
        Integer::div_ceil(
            &(entry_set_count - (offset_count - (node_l2_count - 1))),
            &offset_count,
        )
    }

    pub fn query_header_storage_size() -> u64 {
        NODE_HEADER_SIZE as u64
    }

    pub fn query_node_storage_size(node_size: usize, entry_size: usize, entry_count: i32) -> u64 {
        debug_assert!(entry_size >= OFFSET_SIZE);
        debug_assert!(node_size >= entry_size + NODE_HEADER_SIZE);
        debug_assert!((NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size));
        debug_assert!(node_size.is_power_of_two());

        if entry_count <= 0 {
            return 0;
        }
        (1 + Self::node_l2_count(node_size, entry_size, entry_count)) as u64 * node_size as u64
    }

    pub fn query_entry_storage_size(node_size: usize, entry_size: usize, entry_count: i32) -> u64 {
        debug_assert!(entry_size >= OFFSET_SIZE);
        debug_assert!(node_size >= entry_size + NODE_HEADER_SIZE);
        debug_assert!((NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size));
        debug_assert!(node_size.is_power_of_two());

        if entry_count <= 0 {
            return 0;
        }
        Self::entry_set_count(node_size, entry_size, entry_count) as u64 * node_size as u64
    }

    /// Initializes a tree over separate node and entry storages.
    pub fn new(
        node_storage: VirtualFile,
        entry_storage: VirtualFile,
        node_size: usize,
        entry_size: usize,
        entry_count: i32,
    ) -> Result<Self, StorageError> {
        if entry_size < OFFSET_SIZE
            || node_size < entry_size + NODE_HEADER_SIZE
            || !(NODE_SIZE_MIN..=NODE_SIZE_MAX).contains(&node_size)
            || !node_size.is_power_of_two()
        {
            return Err(StorageError::InvalidBucketTreeNodeEntryCount {});
        }
        if entry_count <= 0 {
            return Err(StorageError::InvalidBucketTreeEntryCount {});
        }

        let offset_count = Self::offset_count_per_node(node_size);
        let entry_set_count = Self::entry_set_count(node_size, entry_size, entry_count);

        // Load and verify L1.
        let mut node_l1 = vec![0; node_size];
        node_storage.read_exact(0, &mut node_l1)?;

        let l1_header = NodeHeader::parse(&node_l1);
        l1_header.verify(0, node_size, OFFSET_SIZE)?;

        // Derive the covered extent. When L1 slots inline leading entry-set
        // offsets, the true start is the first inlined offset.
        let start_offset = if offset_count < entry_set_count && l1_header.count < offset_count {
            read_offset_at(&node_l1, l1_header.count as usize)
        } else {
            read_offset_at(&node_l1, 0)
        };
        let end_offset = l1_header.offset;

        if start_offset > read_offset_at(&node_l1, 0) || start_offset >= end_offset {
            return Err(StorageError::InvalidBucketTreeEntryOffset {});
        }

        Ok(Self {
            node_storage,
            entry_storage,
            node_l1,
            node_size,
            entry_size,
            entry_count,
            offset_count,
            entry_set_count,
            offsets: Offsets {
                start_offset,
                end_offset,
            },
        })
    }

    /// Initializes a logically empty tree that still reports an extent.
    pub fn new_empty(end_offset: u64) -> Self {
        Self {
            node_storage: std::sync::Arc::new(crate::storage::VecStorage::new(Vec::new())),
            entry_storage: std::sync::Arc::new(crate::storage::VecStorage::new(Vec::new())),
            node_l1: Vec::new(),
            node_size: 0,
            entry_size: 0,
            entry_count: 0,
            offset_count: 0,
            entry_set_count: 0,
            offsets: Offsets {
                start_offset: 0,
                end_offset,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_size == 0
    }

    pub fn entry_count(&self) -> i32 {
        self.entry_count
    }

    pub fn get_offsets(&self) -> Offsets {
        self.offsets
    }

    fn is_exist_l2(&self) -> bool {
        self.offset_count < self.entry_set_count
    }

    fn is_exist_offset_l2_on_l1(&self) -> bool {
        self.is_exist_l2() && NodeHeader::parse(&self.node_l1).count < self.offset_count
    }

    fn entry_set_index(&self, l1_count: i32, node_index: i32, offset_index: i32) -> i32 {
        (self.offset_count - l1_count) + (self.offset_count * node_index) + offset_index
    }

    /// Positions a visitor at the entry covering `virtual_offset`.
    pub fn find(&self, virtual_offset: u64) -> Result<Visitor<'_>, StorageError> {
        if self.is_empty() {
            return Err(StorageError::OutOfRange {});
        }

        let l1_header = NodeHeader::parse(&self.node_l1);
        if virtual_offset >= l1_header.offset {
            return Err(StorageError::OutOfRange {});
        }

        let entry_set_index = if self.is_exist_offset_l2_on_l1()
            && virtual_offset < read_offset_at(&self.node_l1, 0)
        {
            // The target is covered by the entry-set offsets inlined on L1.
            let inlined_count = (self.offset_count - l1_header.count) as usize;
            let pos = upper_bound(
                &self.node_l1,
                l1_header.count as usize,
                inlined_count,
                virtual_offset,
            );
            if pos == 0 {
                return Err(StorageError::OutOfRange {});
            }
            (pos - 1) as i32
        } else {
            let pos = upper_bound(&self.node_l1, 0, l1_header.count as usize, virtual_offset);
            if pos == 0 {
                return Err(StorageError::OutOfRange {});
            }
            let pos = (pos - 1) as i32;

            if self.is_exist_l2() {
                if pos >= self.offset_count {
                    return Err(StorageError::InvalidBucketTreeNodeIndex {});
                }
                self.find_entry_set(virtual_offset, pos, l1_header.count)?
            } else {
                pos
            }
        };

        if entry_set_index < 0 || entry_set_index >= self.entry_set_count {
            return Err(StorageError::InvalidBucketTreeNodeIndex {});
        }

        self.find_entry(virtual_offset, entry_set_index)
    }

    /// Descends into the L2 node at `node_index` and resolves the entry-set
    /// index covering `virtual_offset`.
    fn find_entry_set(
        &self,
        virtual_offset: u64,
        node_index: i32,
        l1_count: i32,
    ) -> Result<i32, StorageError> {
        let mut node = vec![0; self.node_size];
        let node_offset = (node_index as u64 + 1) * self.node_size as u64;
        self.node_storage.read_exact(node_offset, &mut node)?;

        let header = NodeHeader::parse(&node);
        header.verify(node_index + 1, self.node_size, OFFSET_SIZE)?;

        let pos = upper_bound(&node, 0, header.count as usize, virtual_offset);
        if pos == 0 {
            return Err(StorageError::InvalidBucketTreeVirtualOffset {});
        }

        Ok(self.entry_set_index(l1_count, node_index, (pos - 1) as i32))
    }

    fn read_entry_set(&self, entry_set_index: i32) -> Result<(Vec<u8>, EntrySetHeader), StorageError> {
        let mut set_buf = vec![0; self.node_size];
        let set_offset = entry_set_index as u64 * self.node_size as u64;
        self.entry_storage.read_exact(set_offset, &mut set_buf)?;

        let header = NodeHeader::parse(&set_buf);
        header.verify(entry_set_index, self.node_size, self.entry_size)?;

        let entry_set = EntrySetHeader {
            index: header.index,
            count: header.count,
            end: header.offset,
            start: entry_virtual_offset(&set_buf, self.entry_size, 0),
        };
        Ok((set_buf, entry_set))
    }

    fn find_entry(&self, virtual_offset: u64, entry_set_index: i32) -> Result<Visitor<'_>, StorageError> {
        let (set_buf, entry_set) = self.read_entry_set(entry_set_index)?;

        let mut lo = 0i32;
        let mut hi = entry_set.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if entry_virtual_offset(&set_buf, self.entry_size, mid) <= virtual_offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Err(StorageError::OutOfRange {});
        }
        let entry_index = lo - 1;

        let at = entry_offset_in_set(self.entry_size, entry_index);
        let entry = set_buf[at..at + self.entry_size].to_vec();

        Ok(Visitor {
            tree: self,
            offsets: self.offsets,
            entry,
            entry_index,
            entry_set,
            entry_set_count: self.entry_set_count,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct EntrySetHeader {
    index: i32,
    count: i32,
    /// Virtual end offset of this entry set.
    end: u64,
    /// Virtual offset of the set's first entry.
    #[allow(dead_code)]
    start: u64,
}

/// A cursor over the entries of a [`BucketTree`], produced by
/// [`BucketTree::find`]. Owns a copy of the current entry's payload.
#[derive(Debug)]
pub struct Visitor<'a> {
    tree: &'a BucketTree,
    offsets: Offsets,
    entry: Vec<u8>,
    entry_index: i32,
    entry_set: EntrySetHeader,
    entry_set_count: i32,
}

impl<'a> Visitor<'a> {
    /// Parses the current entry as the client storage's entry type.
    pub fn get<T: for<'b> BinRead<Args<'b> = ()>>(&self) -> T {
        T::read_le(&mut Cursor::new(&self.entry)).expect("BUG: entry size mismatch")
    }

    pub fn tree_offsets(&self) -> Offsets {
        self.offsets
    }

    pub fn can_move_next(&self) -> bool {
        self.entry_index + 1 < self.entry_set.count || self.entry_set.index + 1 < self.entry_set_count
    }

    pub fn can_move_previous(&self) -> bool {
        self.entry_index > 0 || self.entry_set.index > 0
    }

    pub fn move_next(&mut self) -> Result<(), StorageError> {
        if self.entry_index + 1 < self.entry_set.count {
            self.entry_index += 1;
        } else {
            let next_set = self.entry_set.index + 1;
            if next_set >= self.entry_set_count {
                return Err(StorageError::OutOfRange {});
            }
            let (_, entry_set) = self.tree.read_entry_set(next_set)?;
            self.entry_set = entry_set;
            self.entry_index = 0;
        }
        self.reload_entry()
    }

    pub fn move_previous(&mut self) -> Result<(), StorageError> {
        if self.entry_index > 0 {
            self.entry_index -= 1;
        } else {
            if self.entry_set.index == 0 {
                return Err(StorageError::OutOfRange {});
            }
            let (_, entry_set) = self.tree.read_entry_set(self.entry_set.index - 1)?;
            self.entry_set = entry_set;
            self.entry_index = entry_set.count - 1;
        }
        self.reload_entry()
    }

    fn reload_entry(&mut self) -> Result<(), StorageError> {
        let at = self.entry_set.index as u64 * self.tree.node_size as u64
            + entry_offset_in_set(self.tree.entry_size, self.entry_index) as u64;
        self.tree.entry_storage.read_exact(at, &mut self.entry)
    }

    /// Scans forward from the current entry, merging adjacent entries whose
    /// physical placement is contiguous, and reports how much the caller can
    /// read in one access.
    pub fn scan_continuous_reading<E: ContinuousReadingEntry>(
        &self,
        offset: u64,
        size: u64,
    ) -> Result<ContinuousReadingInfo, StorageError> {
        let mut info = ContinuousReadingInfo::default();

        if size == 0 {
            return Ok(info);
        }

        let entry: E = self.get();
        if entry.is_fragment() {
            return Ok(info);
        }
        if entry.virtual_offset() > offset {
            return Err(StorageError::OutOfRange {});
        }

        // Read the containing entry set so the scan doesn't re-touch the
        // entry storage per step.
        let set_offset = self.entry_set.index as u64 * self.tree.node_size as u64;
        let mut set_buf = vec![0; self.tree.node_size];
        self.tree.entry_storage.read_exact(set_offset, &mut set_buf)?;

        let end_offset = offset + size;
        let mut cur_offset = offset;
        let mut phys_offset = entry.physical_offset();

        let mut merge_size: u64 = 0;
        let mut readable_size: u64 = 0;
        let mut merged = false;

        let mut entry = entry;
        let mut entry_index = self.entry_index;
        let entry_count = self.entry_set.count;
        while entry_index < entry_count {
            if end_offset <= cur_offset {
                break;
            }

            let entry_offset = entry.virtual_offset();
            if entry_offset > cur_offset {
                return Err(StorageError::InvalidIndirectEntryOffset {});
            }

            // Find where the next entry starts.
            let (next_entry, next_entry_offset) = if entry_index + 1 < entry_count {
                let at = entry_offset_in_set(self.tree.entry_size, entry_index + 1);
                let next: E = E::read_le(&mut Cursor::new(&set_buf[at..at + self.tree.entry_size]))
                    .expect("BUG: entry size mismatch");
                let next_offset = next.virtual_offset();
                if !self.offsets.is_include(next_offset) {
                    return Err(StorageError::InvalidIndirectEntryOffset {});
                }
                (Some(next), next_offset)
            } else {
                (None, self.entry_set.end)
            };

            if cur_offset >= next_entry_offset {
                return Err(StorageError::InvalidIndirectEntryOffset {});
            }

            let data_size = next_entry_offset - cur_offset;
            let remaining_size = end_offset - cur_offset;
            let read_size = std::cmp::min(data_size, remaining_size);

            if entry.is_fragment() {
                // Only merge over a fragment that the request fully crosses.
                if E::FRAGMENT_SIZE_MAX <= read_size || remaining_size <= data_size {
                    break;
                }
                merge_size += read_size;
            } else {
                if phys_offset != entry.physical_offset() {
                    break;
                }
                readable_size += merge_size + read_size;
                merged |= merge_size > 0;
                merge_size = 0;
            }

            cur_offset += read_size;
            phys_offset += next_entry_offset - entry_offset;

            entry_index += 1;
            match next_entry {
                Some(next) => entry = next,
                None => break,
            }
        }

        if merged {
            info.read_size = readable_size;
        }
        info.skip_count = entry_index - self.entry_index;
        Ok(info)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixture::build_tree_storages;
    use super::*;

    fn simple_entry(virt: u64, payload: u64) -> Vec<u8> {
        let mut entry = Vec::with_capacity(16);
        entry.extend_from_slice(&virt.to_le_bytes());
        entry.extend_from_slice(&payload.to_le_bytes());
        entry
    }

    fn make_tree(virt_offsets: &[u64], end_offset: u64, node_size: usize) -> BucketTree {
        let entries: Vec<Vec<u8>> = virt_offsets
            .iter()
            .enumerate()
            .map(|(i, &v)| simple_entry(v, i as u64))
            .collect();
        let (node_storage, entry_storage) =
            build_tree_storages(&entries, 16, node_size, end_offset);
        BucketTree::new(node_storage, entry_storage, node_size, 16, entries.len() as i32).unwrap()
    }

    #[derive(BinRead, Debug)]
    struct SimpleEntry {
        virt_offset: u64,
        payload: u64,
    }

    #[test]
    fn find_selects_the_covering_entry() {
        let tree = make_tree(&[0, 0x1000, 0x3000], 0x5000, 1024);

        assert_eq!(
            tree.get_offsets(),
            Offsets {
                start_offset: 0,
                end_offset: 0x5000
            }
        );

        let visitor = tree.find(0x2FFF).unwrap();
        assert_eq!(visitor.get::<SimpleEntry>().virt_offset, 0x1000);
        assert_eq!(visitor.get::<SimpleEntry>().payload, 1);

        let visitor = tree.find(0x3000).unwrap();
        assert_eq!(visitor.get::<SimpleEntry>().virt_offset, 0x3000);

        let visitor = tree.find(0).unwrap();
        assert_eq!(visitor.get::<SimpleEntry>().virt_offset, 0);

        assert!(matches!(
            tree.find(0x5000),
            Err(StorageError::OutOfRange {})
        ));
    }

    #[test]
    fn visitor_walks_across_entry_sets() {
        // 63 entries per 1 KiB node with a 16-byte entry; 100 entries spans
        // two entry sets
        let offsets: Vec<u64> = (0..100).map(|i| i as u64 * 0x100).collect();
        let tree = make_tree(&offsets, 100 * 0x100, 1024);

        let mut visitor = tree.find(0).unwrap();
        for expected in &offsets[1..] {
            assert!(visitor.can_move_next());
            visitor.move_next().unwrap();
            assert_eq!(visitor.get::<SimpleEntry>().virt_offset, *expected);
        }
        assert!(!visitor.can_move_next());

        for expected in offsets[..99].iter().rev() {
            assert!(visitor.can_move_previous());
            visitor.move_previous().unwrap();
            assert_eq!(visitor.get::<SimpleEntry>().virt_offset, *expected);
        }
        assert!(!visitor.can_move_previous());
    }

    #[test]
    fn move_next_then_refind_is_stable() {
        let offsets: Vec<u64> = (0..100).map(|i| i as u64 * 0x100).collect();
        let tree = make_tree(&offsets, 100 * 0x100, 1024);

        let mut visitor = tree.find(0x120).unwrap();
        visitor.move_next().unwrap();
        let next_offset = visitor.get::<SimpleEntry>().virt_offset;

        let refound = tree.find(next_offset).unwrap();
        assert_eq!(refound.get::<SimpleEntry>().virt_offset, next_offset);
        assert_eq!(
            refound.get::<SimpleEntry>().payload,
            visitor.get::<SimpleEntry>().payload
        );
    }

    #[test]
    fn find_descends_through_l2_nodes() {
        // 1 KiB nodes hold 126 offsets and 63 16-byte entries, so 8000
        // entries need 127 entry sets and an L2 node
        let offsets: Vec<u64> = (0..8000).map(|i| i as u64 * 0x10).collect();
        let end_offset = 8000 * 0x10;
        let tree = make_tree(&offsets, end_offset, 1024);

        for &probe in &[0u64, 0xF, 0x10, 0x1234, 8000 * 0x10 - 1, 7937 * 0x10, 7938 * 0x10] {
            let visitor = tree.find(probe).unwrap();
            let entry = visitor.get::<SimpleEntry>();
            assert_eq!(entry.virt_offset, probe & !0xF, "probe {probe:#x}");
            assert_eq!(entry.payload, (probe >> 4) as u64);
        }

        assert!(tree.find(end_offset).is_err());
    }

    #[test]
    fn empty_tree_reports_its_extent() {
        let tree = BucketTree::new_empty(0x4000);
        assert!(tree.is_empty());
        assert_eq!(tree.get_offsets().end_offset, 0x4000);
        assert!(matches!(tree.find(0), Err(StorageError::OutOfRange {})));
    }

    #[test]
    fn header_verification() {
        let mut header_bytes = Vec::new();
        BucketTreeHeader {
            magic: BUCKET_TREE_MAGIC,
            version: 1,
            entry_count: 3,
            reserved: 0,
        }
        .write_le(&mut Cursor::new(&mut header_bytes))
        .unwrap();
        assert_eq!(header_bytes.len(), 0x10);
        assert_eq!(BucketTreeHeader::parse(&header_bytes).unwrap().entry_count, 3);

        let mut bad_magic = header_bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            BucketTreeHeader::parse(&bad_magic),
            Err(StorageError::InvalidBucketTreeSignature {})
        ));

        let mut bad_version = header_bytes.clone();
        bad_version[4] = 9;
        assert!(matches!(
            BucketTreeHeader::parse(&bad_version),
            Err(StorageError::InvalidBucketTreeVersion {})
        ));

        let mut bad_count = header_bytes;
        bad_count[8..12].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            BucketTreeHeader::parse(&bad_count),
            Err(StorageError::InvalidBucketTreeEntryCount {})
        ));
    }

    #[test]
    fn storage_size_queries() {
        // single node trees
        assert_eq!(BucketTree::query_node_storage_size(1024, 16, 10), 1024);
        assert_eq!(BucketTree::query_entry_storage_size(1024, 16, 10), 1024);
        // 100 entries at 63 per set = 2 sets, still one L1 node
        assert_eq!(BucketTree::query_node_storage_size(1024, 16, 100), 1024);
        assert_eq!(BucketTree::query_entry_storage_size(1024, 16, 100), 2048);
        // 8000 entries = 127 sets, needs one L2 node
        assert_eq!(BucketTree::query_node_storage_size(1024, 16, 8000), 2048);
        assert_eq!(
            BucketTree::query_entry_storage_size(1024, 16, 8000),
            127 * 1024
        );
        // empty
        assert_eq!(BucketTree::query_node_storage_size(1024, 16, 0), 0);
    }
}
