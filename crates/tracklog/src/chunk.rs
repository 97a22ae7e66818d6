//! Fixed-capacity chunk files and their mmap-backed offset table.
//!
//! A chunk stores up to `capacity` variable-length messages in a single
//! file. The file opens with a header region that is memory-mapped for
//! the life of the writable chunk:
//!
//! ```text
//! [0, 8)              capacity, little-endian u64
//! [8, 8 + 8*(cap+1))  offset table: entry i is the absolute byte offset
//!                     of the start of message i; entry cap is one past
//!                     the last message; unused entries are zero
//! thereafter          message payloads, slot order, no separators
//! ```
//!
//! Entry 0 doubles as the end of the header and the start of message 0,
//! so an empty table is never all-zero and the first zero entry at index
//! >= 1 recovers the message count after reopen. Random access to any
//! written message costs two table loads and one seek.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{TrackError, TrackResult};
use crate::fs as layout;

/// Bytes per header slot (one little-endian u64).
pub(crate) const SLOT_BYTES: u64 = 8;

/// Bytes occupied by the header region of a chunk with the given
/// capacity: the capacity word plus `capacity + 1` offset-table entries.
pub fn header_len(capacity: u64) -> TrackResult<u64> {
    capacity
        .checked_add(2)
        .and_then(|slots| slots.checked_mul(SLOT_BYTES))
        .ok_or_else(|| {
            TrackError::corruption(format!("chunk capacity {capacity} overflows header size"))
        })
}

/// Backing storage for the header region.
///
/// A writable chunk keeps the header mapped. Sealing copies the offset
/// table into a plain vector and releases the mapping, so a long track
/// holds at most one live map. A closed chunk keeps neither.
#[derive(Debug)]
enum HeaderBacking {
    Mapped(MmapMut),
    Detached(Vec<u64>),
    Closed,
}

#[derive(Debug)]
struct ChunkHeader {
    capacity: u64,
    backing: Mutex<HeaderBacking>,
}

impl ChunkHeader {
    #[inline]
    fn slot_at(index: u64) -> usize {
        ((index + 1) * SLOT_BYTES) as usize
    }

    /// Offset-table entry `index` (0..=capacity).
    fn entry(&self, index: u64) -> TrackResult<u64> {
        debug_assert!(index <= self.capacity);
        match &*self.backing.lock() {
            HeaderBacking::Mapped(map) => {
                let at = Self::slot_at(index);
                Ok(LittleEndian::read_u64(&map[at..at + SLOT_BYTES as usize]))
            }
            HeaderBacking::Detached(table) => Ok(table[index as usize]),
            HeaderBacking::Closed => Err(TrackError::invalid_state("chunk is closed")),
        }
    }

    fn set_entry(&self, index: u64, value: u64) -> TrackResult<()> {
        debug_assert!(index <= self.capacity);
        match &mut *self.backing.lock() {
            HeaderBacking::Mapped(map) => {
                let at = Self::slot_at(index);
                LittleEndian::write_u64(&mut map[at..at + SLOT_BYTES as usize], value);
                Ok(())
            }
            HeaderBacking::Detached(_) => {
                Err(TrackError::invalid_state("chunk header is read-only"))
            }
            HeaderBacking::Closed => Err(TrackError::invalid_state("chunk is closed")),
        }
    }

    fn flush(&self) -> TrackResult<()> {
        if let HeaderBacking::Mapped(map) = &*self.backing.lock() {
            map.flush()?;
        }
        Ok(())
    }

    /// Copy the offset table out of the mapping and release it.
    fn detach(&self) -> TrackResult<()> {
        let mut backing = self.backing.lock();
        match &*backing {
            HeaderBacking::Mapped(map) => {
                map.flush()?;
                let mut table = Vec::with_capacity(self.capacity as usize + 1);
                for index in 0..=self.capacity {
                    let at = Self::slot_at(index);
                    table.push(LittleEndian::read_u64(&map[at..at + SLOT_BYTES as usize]));
                }
                *backing = HeaderBacking::Detached(table);
                Ok(())
            }
            HeaderBacking::Detached(_) => Ok(()),
            HeaderBacking::Closed => Err(TrackError::invalid_state("chunk is closed")),
        }
    }

    fn close(&self) -> TrackResult<()> {
        let mut backing = self.backing.lock();
        if let HeaderBacking::Mapped(map) = &*backing {
            map.flush()?;
        }
        *backing = HeaderBacking::Closed;
        Ok(())
    }

    fn is_detached(&self) -> bool {
        matches!(&*self.backing.lock(), HeaderBacking::Detached(_))
    }
}

/// One fixed-capacity message file.
///
/// A chunk is single-writer: exactly one task may call [`append`], which
/// must supply slots in strictly sequential order. Any number of
/// concurrent readers may hold [`ChunkReader`]s; each owns an
/// independent read-only file descriptor.
///
/// [`append`]: Chunk::append
#[derive(Debug)]
pub struct Chunk {
    id: String,
    path: PathBuf,
    capacity: u64,
    size: AtomicU64,
    header: ChunkHeader,
    appender: Mutex<Option<File>>,
}

impl Chunk {
    /// Create an empty chunk file at `{root}/{id}` (system temp directory
    /// when `root` is `None`).
    ///
    /// The file is extended to at least one OS page and to at least the
    /// header length, the capacity word and the table origin are written,
    /// and the rest of the offset table is zeroed.
    pub fn create(root: Option<&Path>, id: &str, capacity: u64) -> TrackResult<Self> {
        if capacity == 0 {
            return Err(TrackError::invalid_config("chunk capacity must be at least 1"));
        }
        let header_len = header_len(capacity)?;
        let path = layout::resolve_path(root, id);
        let mut file = layout::open_chunk_file(&path, header_len.max(layout::page_size()))?;

        let mut map = unsafe { MmapOptions::new().len(header_len as usize).map_mut(&file)? };
        LittleEndian::write_u64(&mut map[..SLOT_BYTES as usize], capacity);
        LittleEndian::write_u64(
            &mut map[SLOT_BYTES as usize..2 * SLOT_BYTES as usize],
            header_len,
        );
        map[2 * SLOT_BYTES as usize..].fill(0);

        file.seek(SeekFrom::Start(header_len))?;
        debug!(chunk = id, capacity, "created chunk file");

        Ok(Self {
            id: id.to_string(),
            path,
            capacity,
            size: AtomicU64::new(0),
            header: ChunkHeader {
                capacity,
                backing: Mutex::new(HeaderBacking::Mapped(map)),
            },
            appender: Mutex::new(Some(file)),
        })
    }

    /// Reopen an existing chunk file, recovering its logical size from
    /// the offset table.
    ///
    /// The scan looks for the first zero entry at index >= 1; a fully
    /// written table means the chunk is full. Reopening rejects a file
    /// whose capacity word is zero, whose table is not strictly
    /// increasing over the written prefix, or whose length falls short of
    /// the recovered tail offset.
    pub fn open(root: Option<&Path>, id: &str) -> TrackResult<Self> {
        let path = layout::resolve_path(root, id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let disk_len = file.metadata()?.len();
        if disk_len < SLOT_BYTES {
            return Err(TrackError::corruption(format!(
                "chunk {} too short for its capacity word",
                path.display()
            )));
        }

        let mut word = [0u8; SLOT_BYTES as usize];
        file.read_exact(&mut word)?;
        let capacity = LittleEndian::read_u64(&word);
        if capacity == 0 {
            return Err(TrackError::corruption(format!(
                "chunk {} declares zero capacity",
                path.display()
            )));
        }
        let header_len = header_len(capacity)?;
        if disk_len < header_len {
            return Err(TrackError::corruption(format!(
                "chunk {} is shorter than its {header_len}-byte header",
                path.display()
            )));
        }

        let map = unsafe { MmapOptions::new().len(header_len as usize).map_mut(&file)? };
        let entry = |index: u64| {
            let at = ChunkHeader::slot_at(index);
            LittleEndian::read_u64(&map[at..at + SLOT_BYTES as usize])
        };
        if entry(0) != header_len {
            return Err(TrackError::corruption(format!(
                "chunk {} offset table does not begin at the header boundary",
                path.display()
            )));
        }

        let mut size = capacity;
        for index in 1..=capacity {
            let value = entry(index);
            if value == 0 {
                size = index - 1;
                break;
            }
            if value <= entry(index - 1) {
                return Err(TrackError::corruption(format!(
                    "chunk {} offset table is not strictly increasing at entry {index}",
                    path.display()
                )));
            }
        }

        let tail = entry(size);
        if disk_len < tail {
            return Err(TrackError::corruption(format!(
                "chunk {} holds {disk_len} bytes but its offset table ends at {tail}",
                path.display()
            )));
        }
        file.seek(SeekFrom::Start(tail))?;
        debug!(chunk = id, capacity, size, "opened chunk file");

        Ok(Self {
            id: id.to_string(),
            path,
            capacity,
            size: AtomicU64::new(size),
            header: ChunkHeader {
                capacity,
                backing: Mutex::new(HeaderBacking::Mapped(map)),
            },
            appender: Mutex::new(Some(file)),
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Messages currently stored.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// True once the chunk has gone through its read-only transition.
    pub fn is_sealed(&self) -> bool {
        self.header.is_detached()
    }

    /// Append `payload` as the message in `slot`.
    ///
    /// Slots must be written in order: `slot` has to equal the current
    /// size. The payload bytes go to the appender position and the
    /// offset-table entry for the next slot is published afterwards, so
    /// a torn write never exposes a half-written message.
    pub fn append(&self, slot: u64, payload: &[u8]) -> TrackResult<()> {
        let size = self.size.load(Ordering::Acquire);
        if slot != size {
            return Err(TrackError::OutOfOrder {
                expected: size,
                actual: slot,
            });
        }
        if slot >= self.capacity {
            return Err(TrackError::OutOfBounds {
                index: slot,
                capacity: self.capacity,
            });
        }

        let mut appender = self.appender.lock();
        let Some(file) = appender.as_mut() else {
            return Err(TrackError::invalid_state("append on sealed or closed chunk"));
        };
        file.write_all(payload)?;

        let start = self.header.entry(slot)?;
        self.header.set_entry(slot + 1, start + payload.len() as u64)?;
        self.size.store(slot + 1, Ordering::Release);
        Ok(())
    }

    /// Open a fresh read-only handle positioned at the start of the
    /// message in `slot`. The returned reader is independent of the
    /// appender and of every other reader.
    pub fn reader_at(&self, slot: u64) -> TrackResult<ChunkReader> {
        self.check_readable(slot)?;
        let start = self.header.entry(slot)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(ChunkReader { file })
    }

    /// Size in bytes of the message in `slot`.
    pub fn size_of(&self, slot: u64) -> TrackResult<u64> {
        self.check_readable(slot)?;
        Ok(self.header.entry(slot + 1)? - self.header.entry(slot)?)
    }

    fn check_readable(&self, slot: u64) -> TrackResult<()> {
        let size = self.size.load(Ordering::Acquire);
        if slot >= size {
            return Err(TrackError::NotWritten { index: slot, size });
        }
        if slot >= self.capacity {
            return Err(TrackError::OutOfBounds {
                index: slot,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Force payload bytes and the mapped header to disk.
    pub fn flush(&self) -> TrackResult<()> {
        if let Some(file) = self.appender.lock().as_ref() {
            file.sync_data()?;
        }
        self.header.flush()
    }

    /// Read-only transition: flush, copy the offset table into a plain
    /// vector, release the mapping, and close the appender.
    ///
    /// Reads keep working; further appends fail. Sealing an already
    /// sealed chunk is a no-op.
    pub fn seal(&self) -> TrackResult<()> {
        let mut appender = self.appender.lock();
        if let Some(file) = appender.as_ref() {
            file.sync_data()?;
        }
        self.header.detach()?;
        if appender.take().is_some() {
            debug!(chunk = %self.id, size = self.len(), "sealed chunk");
        }
        Ok(())
    }

    /// Flush and release every resource. The chunk is unusable afterwards;
    /// reopen it with [`Chunk::open`]. Idempotent.
    pub fn close(&self) -> TrackResult<()> {
        let mut appender = self.appender.lock();
        if let Some(file) = appender.as_ref() {
            file.sync_data()?;
        }
        *appender = None;
        self.header.close()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Err(err) = self.header.flush() {
            warn!(chunk = %self.id, error = %err, "failed to flush chunk header on drop");
        }
    }
}

/// Read-only cursor over one chunk's payload region.
///
/// Obtained from [`Chunk::reader_at`]; owns its file descriptor and is
/// positioned at a message boundary. Reading advances through payloads
/// with no separators, so callers are expected to consume whole
/// messages using sizes from [`Chunk::size_of`].
pub struct ChunkReader {
    file: File,
}

impl ChunkReader {
    /// Release the underlying descriptor. Equivalent to dropping.
    pub fn close(self) {}
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}
