use crate::fssystem::bucket_tree::BucketTree;
use crate::fssystem::compression::{
    CompressionType, GetDecompressorFunction, COMPRESSION_BLOCK_ALIGNMENT,
};
use crate::storage::{
    PooledBuffer, ReadableStorage, ReadableStorageExt, StorageError, VirtualFile,
};
use binrw::BinRead;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// One bucket-tree entry of a compressed storage.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct CompressedEntry {
    pub virt_offset: u64,
    pub phys_offset: u64,
    pub compression_type_raw: u8,
    pub reserved: [u8; 3],
    pub phys_size: u32,
}

impl CompressedEntry {
    pub fn compression_type(&self) -> CompressionType {
        CompressionType::from_raw(self.compression_type_raw)
    }
}

/// Callback that fills a destination slice with decoded bytes.
pub type ReadImplFn<'a> = dyn FnMut(&mut [u8]) -> Result<(), StorageError> + 'a;

/// Callback handed the decoded size of the next span; it chooses the
/// destination and invokes the filler on it.
pub type ReadFn<'a> = dyn FnMut(usize, &mut ReadImplFn<'_>) -> Result<(), StorageError> + 'a;

/// A pending physical access accumulated by the read coalescer.
#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    compression_type: CompressionType,
    gap_from_prev: u32,
    physical_size: u32,
    virtual_size: u32,
}

const ENTRIES_COUNT_MAX: usize = 0x80;

/// The entry walk and coalesced decompression engine.
#[derive(Debug)]
struct CompressedStorageCore {
    block_size_max: usize,
    continuous_reading_size_max: usize,
    table: BucketTree,
    data_storage: VirtualFile,
    get_decompressor_function: GetDecompressorFunction,
}

impl CompressedStorageCore {
    fn get_size(&self) -> u64 {
        self.table.get_offsets().end_offset
    }

    /// Walks entries covering `[offset, offset + size)`, invoking
    /// `f(entry, virtual_data_size, data_offset, read_size)`. `f` returns
    /// whether the walk should continue.
    fn operate_per_entry<F>(&self, offset: u64, size: u64, f: &mut F) -> Result<(), StorageError>
    where
        F: FnMut(&CompressedEntry, u64, u64, u64) -> Result<bool, StorageError>,
    {
        if size == 0 {
            return Ok(());
        }

        let table_offsets = self.table.get_offsets();
        if !table_offsets.is_include_range(offset, size) {
            return Err(StorageError::OutOfRange {});
        }

        let mut visitor = self.table.find(offset)?;
        {
            let entry: CompressedEntry = visitor.get();
            if !table_offsets.is_include(entry.virt_offset) {
                return Err(StorageError::InvalidCompressedEntryOffset {});
            }
        }

        let mut cur_offset = offset;
        let end_offset = offset + size;

        while cur_offset < end_offset {
            let cur_entry: CompressedEntry = visitor.get();

            if cur_entry.virt_offset > cur_offset {
                return Err(StorageError::InvalidCompressedEntryOffset {});
            }

            let next_entry_offset = if visitor.can_move_next() {
                visitor.move_next()?;
                let next: CompressedEntry = visitor.get();
                if !table_offsets.is_include(next.virt_offset) {
                    return Err(StorageError::InvalidCompressedEntryOffset {});
                }
                next.virt_offset
            } else {
                table_offsets.end_offset
            };
            if cur_offset >= next_entry_offset {
                return Err(StorageError::InvalidCompressedEntryOffset {});
            }

            let data_offset = cur_offset - cur_entry.virt_offset;
            let data_size = next_entry_offset - cur_entry.virt_offset;
            let remaining_size = end_offset - cur_offset;
            let cur_size = std::cmp::min(remaining_size, data_size - data_offset);

            // Check that the access stays physically in bounds.
            let storage_size = self.data_storage.get_size();
            if cur_entry.phys_offset > storage_size {
                return Err(StorageError::CompressedStorageCorrupted {});
            }
            if cur_entry.compression_type() != CompressionType::None
                && cur_entry.phys_offset + cur_entry.phys_size as u64 > storage_size
            {
                return Err(StorageError::CompressedStorageCorrupted {});
            }
            if cur_entry.compression_type().is_block_alignment_required()
                && cur_entry.phys_offset % COMPRESSION_BLOCK_ALIGNMENT != 0
            {
                return Err(StorageError::InvalidCompressedEntryOffset {});
            }

            if !f(&cur_entry, data_size, data_offset, cur_size)? {
                break;
            }

            cur_offset += cur_size;
        }

        Ok(())
    }

    fn get_decompressor(
        &self,
        compression_type: CompressionType,
    ) -> Result<crate::fssystem::compression::DecompressorFunction, StorageError> {
        if compression_type.is_unknown() {
            return Err(StorageError::MissingDecompressor {
                type_value: compression_type.raw(),
            });
        }
        (self.get_decompressor_function)(compression_type).ok_or(StorageError::MissingDecompressor {
            type_value: compression_type.raw(),
        })
    }

    /// Performs one coalesced physical read and decodes the pending
    /// entries into the destinations `read_func` provides.
    fn perform_required_read(
        &self,
        pending: &mut Vec<PendingEntry>,
        required_offset: &mut u64,
        required_size: &mut u64,
        use_buffer: &mut bool,
        read_func: &mut ReadFn<'_>,
    ) -> Result<(), StorageError> {
        if pending.is_empty() {
            return Ok(());
        }

        let total_required_size = *required_size as usize;

        if *use_buffer {
            let mut pooled_buffer = PooledBuffer::default();
            if PooledBuffer::allocatable_size_max() >= total_required_size {
                pooled_buffer.allocate(total_required_size, self.block_size_max);
            } else {
                pooled_buffer.allocate_particularly_large(
                    std::cmp::min(
                        total_required_size,
                        PooledBuffer::allocatable_particularly_large_size_max(),
                    ),
                    self.block_size_max,
                );
            }

            let mut entry_idx = 0;
            while entry_idx < pending.len() {
                let first = pending[entry_idx];
                let first_span = (first.physical_size + first.gap_from_prev) as usize;

                if first_span <= pooled_buffer.get_size() {
                    // Batch as many entries as fit in the pooled buffer.
                    let max_size =
                        std::cmp::min(*required_size as usize, pooled_buffer.get_size());
                    let mut batch_read = 0usize;
                    let mut batch_end = entry_idx;
                    while batch_end < pending.len() {
                        let span = (pending[batch_end].physical_size
                            + pending[batch_end].gap_from_prev)
                            as usize;
                        if batch_read + span > max_size {
                            break;
                        }
                        batch_read += span;
                        batch_end += 1;
                    }

                    {
                        let buffer = &mut pooled_buffer.get_buffer()[..batch_read];
                        self.data_storage.read_exact(*required_offset, buffer)?;
                    }

                    let mut buffer_offset = 0usize;
                    while entry_idx < batch_end {
                        let entry = pending[entry_idx];
                        buffer_offset += entry.gap_from_prev as usize;

                        let virtual_size = entry.virtual_size as usize;
                        match entry.compression_type {
                            CompressionType::None => {
                                read_func(virtual_size, &mut |dst: &mut [u8]| {
                                    debug_assert_eq!(dst.len(), virtual_size);
                                    let src = &pooled_buffer.get_buffer()
                                        [buffer_offset..buffer_offset + virtual_size];
                                    dst.copy_from_slice(src);
                                    Ok(())
                                })?;
                            }
                            CompressionType::Zeros => {
                                read_func(virtual_size, &mut |dst: &mut [u8]| {
                                    dst.fill(0);
                                    Ok(())
                                })?;
                            }
                            compression_type => {
                                let decompressor = self.get_decompressor(compression_type)?;
                                let physical_size = entry.physical_size as usize;
                                read_func(virtual_size, &mut |dst: &mut [u8]| {
                                    let src = &pooled_buffer.get_buffer()
                                        [buffer_offset..buffer_offset + physical_size];
                                    decompressor(dst, src)
                                })?;
                            }
                        }

                        buffer_offset += entry.physical_size as usize;
                        entry_idx += 1;
                    }
                    debug_assert_eq!(buffer_offset, batch_read);

                    *required_offset += batch_read as u64;
                    *required_size -= batch_read as u64;
                } else {
                    // An uncompressed span larger than the pool streams
                    // directly into the destination.
                    debug_assert_eq!(first.compression_type, CompressionType::None);

                    *required_offset += first.gap_from_prev as u64;
                    *required_size -= first.gap_from_prev as u64;

                    let cur_read_size = first.virtual_size as usize;
                    let read_offset = *required_offset;
                    read_func(cur_read_size, &mut |dst: &mut [u8]| {
                        self.data_storage.read_exact(read_offset, dst)
                    })?;

                    *required_offset += cur_read_size as u64;
                    *required_size -= cur_read_size as u64;
                    entry_idx += 1;
                }
            }
        } else {
            let read_offset = *required_offset;
            read_func(total_required_size, &mut |dst: &mut [u8]| {
                self.data_storage.read_exact(read_offset, dst)
            })?;
            *required_offset += total_required_size as u64;
            *required_size -= total_required_size as u64;
        }

        pending.clear();
        *use_buffer = false;
        Ok(())
    }

    /// Reads `[offset, offset + size)`, accumulating physically contiguous
    /// entries into single data-storage accesses and handing decoded spans
    /// to `read_func` in virtual order.
    fn read_with(
        &self,
        offset: u64,
        size: u64,
        read_func: &mut ReadFn<'_>,
    ) -> Result<(), StorageError> {
        if size == 0 {
            return Ok(());
        }

        let mut pending: Vec<PendingEntry> = Vec::new();
        let mut required_offset: u64 = 0;
        let mut required_size: u64 = 0;
        let mut use_buffer = false;
        let mut prev_entry: Option<CompressedEntry> = None;

        self.operate_per_entry(offset, size, &mut |entry,
                                                   virtual_data_size,
                                                   data_offset,
                                                   read_size| {
            // Determine the physical extents of this access.
            let (physical_offset, physical_size) =
                if entry.compression_type().is_random_accessible() {
                    (entry.phys_offset + data_offset, read_size)
                } else {
                    (entry.phys_offset, entry.phys_size as u64)
                };

            // Flush the pending access if this entry cannot be coalesced
            // onto it.
            if required_size > 0 {
                let required_end = required_offset + required_size;
                let required_by_gap = !(required_end <= physical_offset
                    && physical_offset <= align_up(required_end, COMPRESSION_BLOCK_ALIGNMENT));
                let required_by_continuous_size = (physical_size as i64 + physical_offset as i64
                    - required_end as i64)
                    + required_size as i64
                    > self.continuous_reading_size_max as i64;
                let required_by_entry_count = pending.len() == ENTRIES_COUNT_MAX;

                if required_by_gap || required_by_continuous_size || required_by_entry_count {
                    self.perform_required_read(
                        &mut pending,
                        &mut required_offset,
                        &mut required_size,
                        &mut use_buffer,
                        read_func,
                    )?;
                    prev_entry = None;
                }
            }

            // Decide whether decoding will need a staging buffer.
            if entry.compression_type() != CompressionType::None
                || prev_entry.is_some_and(|prev| {
                    entry.virt_offset.wrapping_sub(prev.virt_offset)
                        != entry.phys_offset.wrapping_sub(prev.phys_offset)
                })
            {
                use_buffer = true;
            }

            if entry.compression_type().is_data_storage_access_required() {
                if entry.compression_type() != CompressionType::None {
                    if data_offset != 0 {
                        return Err(StorageError::InvalidOffset {});
                    }
                    if virtual_data_size != read_size {
                        return Err(StorageError::InvalidSize {});
                    }
                    if entry.phys_size as usize > self.block_size_max {
                        return Err(StorageError::InvalidCompressedEntrySize {});
                    }
                }

                let gap_from_prev = if required_size > 0 {
                    physical_offset - (required_offset + required_size)
                } else {
                    required_offset = physical_offset;
                    0
                };
                required_size += physical_size + gap_from_prev;

                pending.push(PendingEntry {
                    compression_type: entry.compression_type(),
                    gap_from_prev: gap_from_prev as u32,
                    physical_size: physical_size as u32,
                    virtual_size: read_size as u32,
                });
            } else {
                if entry.compression_type() != CompressionType::Zeros {
                    return Err(StorageError::MissingDecompressor {
                        type_value: entry.compression_type_raw,
                    });
                }

                if !pending.is_empty() {
                    // Keep the zero span ordered among the pending decodes.
                    if entry.phys_size == 0 {
                        return Err(StorageError::InvalidCompressedEntrySize {});
                    }
                    pending.push(PendingEntry {
                        compression_type: CompressionType::Zeros,
                        gap_from_prev: 0,
                        physical_size: 0,
                        virtual_size: read_size as u32,
                    });
                } else {
                    read_func(read_size as usize, &mut |dst: &mut [u8]| {
                        dst.fill(0);
                        Ok(())
                    })?;
                }
            }

            prev_entry = Some(*entry);
            Ok(true)
        })?;

        if required_size != 0 {
            self.perform_required_read(
                &mut pending,
                &mut required_offset,
                &mut required_size,
                &mut use_buffer,
                read_func,
            )?;
        }

        Ok(())
    }
}

/// Decides per caller request which parts must be staged through a pooled
/// buffer (block-aligned head/tail entries) and which may be burst-read
/// straight into the caller's buffer.
///
/// The cache sizing parameters are accepted but unused; the manager keeps
/// only the storage size.
#[derive(Debug)]
struct CacheManager {
    storage_size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct AccessRange {
    virtual_offset: u64,
    virtual_size: u64,
    is_block_alignment_required: bool,
}

impl AccessRange {
    fn end_virtual_offset(&self) -> u64 {
        self.virtual_offset + self.virtual_size
    }
}

impl CacheManager {
    fn new(storage_size: u64, _cache_size_0: usize, _cache_size_1: usize, _max_cache_entries: usize) -> Self {
        Self { storage_size }
    }

    fn read(
        &self,
        core: &CompressedStorageCore,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), StorageError> {
        if buffer.is_empty() {
            return Ok(());
        }
        if offset > self.storage_size {
            return Err(StorageError::InvalidOffset {});
        }
        let read_size = std::cmp::min(buffer.len() as u64, self.storage_size - offset) as usize;
        let buffer = &mut buffer[..read_size];

        // Determine the head (and maybe tail) entry ranges.
        let mut head_range = AccessRange::default();
        let mut tail_range = AccessRange::default();
        let mut is_tail_set = false;

        core.operate_per_entry(offset, 1, &mut |entry, virtual_data_size, _, _| {
            head_range = AccessRange {
                virtual_offset: entry.virt_offset,
                virtual_size: virtual_data_size,
                is_block_alignment_required: entry
                    .compression_type()
                    .is_block_alignment_required(),
            };

            if offset + read_size as u64 <= entry.virt_offset + virtual_data_size {
                tail_range = head_range;
                is_tail_set = true;
            }

            Ok(false)
        })?;

        if !is_tail_set {
            core.operate_per_entry(
                offset + read_size as u64 - 1,
                1,
                &mut |entry, virtual_data_size, _, _| {
                    tail_range = AccessRange {
                        virtual_offset: entry.virt_offset,
                        virtual_size: virtual_data_size,
                        is_block_alignment_required: entry
                            .compression_type()
                            .is_block_alignment_required(),
                    };
                    Ok(false)
                },
            )?;
        }

        let mut cur_offset = offset;
        let mut cur_size = read_size;
        let mut cur_dst = 0usize;

        // Work out which ends need staging.
        let head_unaligned = head_range.is_block_alignment_required
            && (cur_offset != head_range.virtual_offset
                || (cur_size as u64) < head_range.virtual_size);
        let tail_unaligned = if tail_range.is_block_alignment_required {
            if cur_size as u64 + cur_offset == tail_range.end_virtual_offset() {
                false
            } else if !head_unaligned {
                true
            } else {
                head_range.end_virtual_offset() < cur_size as u64 + cur_offset
            }
        } else {
            false
        };

        let start_offset = if head_range.is_block_alignment_required {
            head_range.virtual_offset
        } else {
            cur_offset
        };
        let end_offset = if tail_range.is_block_alignment_required {
            tail_range.end_virtual_offset()
        } else {
            cur_offset + cur_size as u64
        };

        let mut is_burst_reading = false;
        core.read_with(
            start_offset,
            end_offset - start_offset,
            &mut |size_required: usize, read_impl: &mut ReadImplFn<'_>| {
                // Decide whether this span is staged or burst.
                let mut unaligned_range: Option<AccessRange> = None;
                if !is_burst_reading {
                    if head_unaligned
                        && head_range.virtual_offset <= cur_offset
                        && cur_offset < head_range.end_virtual_offset()
                    {
                        unaligned_range = Some(head_range);
                    } else if tail_unaligned
                        && tail_range.virtual_offset <= cur_offset
                        && cur_offset < tail_range.end_virtual_offset()
                    {
                        unaligned_range = Some(tail_range);
                    } else {
                        is_burst_reading = true;
                    }
                }

                if is_burst_reading {
                    debug_assert!(size_required <= cur_size);

                    read_impl(&mut buffer[cur_dst..cur_dst + size_required])?;

                    cur_dst += size_required;
                    cur_offset += size_required as u64;
                    cur_size -= size_required;

                    // Fall back out of burst mode at the tail boundary.
                    let offset_aligned = if tail_unaligned {
                        tail_range.virtual_offset
                    } else {
                        end_offset
                    };
                    if offset_aligned <= cur_offset {
                        is_burst_reading = false;
                    }
                } else {
                    let unaligned_range =
                        unaligned_range.expect("BUG: neither burst nor staged");
                    debug_assert_eq!(size_required as u64, unaligned_range.virtual_size);

                    // Stage the whole entry, then copy out the covered part.
                    let mut pooled_buffer = PooledBuffer::new(size_required, size_required);
                    read_impl(&mut pooled_buffer.get_buffer()[..size_required])?;

                    let skip_size = (cur_offset - unaligned_range.virtual_offset) as usize;
                    let copy_size = std::cmp::min(
                        cur_size as u64,
                        unaligned_range.end_virtual_offset() - cur_offset,
                    ) as usize;

                    buffer[cur_dst..cur_dst + copy_size].copy_from_slice(
                        &pooled_buffer.get_buffer()[skip_size..skip_size + copy_size],
                    );

                    cur_dst += copy_size;
                    cur_offset += copy_size as u64;
                    cur_size -= copy_size;
                }

                Ok(())
            },
        )
    }
}

/// Per-entry compressed storage (§ compressed sections): None / Zeros / LZ4
/// entries indexed by a bucket tree, with read coalescing.
#[derive(Debug)]
pub struct CompressedStorage {
    core: CompressedStorageCore,
    cache_manager: CacheManager,
}

impl CompressedStorage {
    pub const NODE_SIZE: usize = 16 * 1024;
    pub const ENTRY_SIZE: usize = 0x18;

    pub fn query_node_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_node_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    pub fn query_entry_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_entry_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_storage: VirtualFile,
        node_storage: VirtualFile,
        entry_storage: VirtualFile,
        entry_count: i32,
        block_size_max: usize,
        continuous_reading_size_max: usize,
        get_decompressor: GetDecompressorFunction,
        cache_size_0: usize,
        cache_size_1: usize,
        max_cache_entries: usize,
    ) -> Result<Self, StorageError> {
        assert!(block_size_max > 0);
        assert!(block_size_max <= continuous_reading_size_max);

        let table = BucketTree::new(
            node_storage,
            entry_storage,
            Self::NODE_SIZE,
            Self::ENTRY_SIZE,
            entry_count,
        )?;
        let core = CompressedStorageCore {
            block_size_max,
            continuous_reading_size_max,
            table,
            data_storage,
            get_decompressor_function: get_decompressor,
        };
        let cache_manager = CacheManager::new(
            core.get_size(),
            cache_size_0,
            cache_size_1,
            max_cache_entries,
        );

        Ok(Self {
            core,
            cache_manager,
        })
    }
}

impl ReadableStorage for CompressedStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let size = self.get_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;

        self.cache_manager
            .read(&self.core, offset, &mut buf[..len])?;
        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.core.get_size()
    }
}
