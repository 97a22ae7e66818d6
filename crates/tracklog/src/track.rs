//! Track composition: a logical append-only stream over a growing
//! sequence of chunks.
//!
//! A track funnels every producer through a bounded queue into one
//! writer thread. The writer owns all mutation: it appends to the active
//! chunk, rolls over to a fresh chunk when the active one fills (sealing
//! the predecessor so its mapping is released), and publishes the count
//! of committed messages under a condvar that tailing readers wait on.
//! Readers never mutate; each [`TrackReader`](crate::TrackReader) holds
//! its own per-chunk file descriptors.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::chunk::Chunk;
use crate::config::TrackConfig;
use crate::error::{TrackError, TrackResult};
use crate::fs as layout;
use crate::reader::TrackReader;

const META_MAGIC: u64 = 0x544c_4f47_4d45_5441; // "TLOGMETA"
const META_VERSION: u32 = 1;
const META_LEN: usize = 24;

/// State shared between the track handle, its writer thread, and every
/// reader. Only the writer thread mutates `stores` or any chunk.
#[derive(Debug)]
pub(crate) struct TrackShared {
    pub(crate) id: String,
    pub(crate) root: Option<PathBuf>,
    pub(crate) config: TrackConfig,
    pub(crate) stores: RwLock<Vec<Arc<Chunk>>>,
    /// Count of committed messages; the writer bumps it under this mutex
    /// after each append and broadcasts on `data_available`. Checking it
    /// under the mutex is what makes the offset-table writes visible to
    /// readers.
    pub(crate) published: Mutex<u64>,
    pub(crate) data_available: Condvar,
    pub(crate) alive: AtomicBool,
    pub(crate) fatal: Mutex<Option<String>>,
}

impl TrackShared {
    pub(crate) fn root_path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn meta_path(&self) -> PathBuf {
        layout::resolve_path(self.root_path(), &layout::meta_file_id(&self.id))
    }
}

/// A persistent, append-only message log.
///
/// Messages are opaque byte sequences, numbered from zero with no gaps.
/// Writes are accepted from any number of threads and serialized by a
/// single writer; reads start from any past offset and can tail the log,
/// blocking until new messages arrive.
#[derive(Debug)]
pub struct Track {
    shared: Arc<TrackShared>,
    sender: Mutex<Option<Sender<Vec<u8>>>>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Track {
    /// Create a new, empty track named `id` under `root` (system temp
    /// directory when `root` is `None`).
    ///
    /// Fails with `InvalidState` when a chunk file for this id already
    /// exists; reopen those with [`Track::open`] instead.
    pub fn create(root: Option<&Path>, id: &str, config: TrackConfig) -> TrackResult<Track> {
        config.validate()?;
        let first_chunk = layout::resolve_path(root, &layout::chunk_file_id(id, 0));
        if first_chunk.exists() {
            return Err(TrackError::invalid_state(format!(
                "track {id} already has chunk files; open it instead"
            )));
        }
        let shared = Arc::new(TrackShared {
            id: id.to_string(),
            root: root.map(Path::to_path_buf),
            config,
            stores: RwLock::new(Vec::new()),
            published: Mutex::new(0),
            data_available: Condvar::new(),
            alive: AtomicBool::new(true),
            fatal: Mutex::new(None),
        });
        Self::start(shared, 0)
    }

    /// Reopen a track by enumerating its chunk files `{id}0`, `{id}1`, …
    /// until the first missing index.
    ///
    /// Enumeration is the source of truth for recovery; the `{id}_meta`
    /// fast-path file written at close is only cross-checked and logged
    /// when it disagrees. Every recovered chunk must carry the configured
    /// capacity, and every chunk but the last must be full.
    pub fn open(root: Option<&Path>, id: &str, config: TrackConfig) -> TrackResult<Track> {
        config.validate()?;
        let mut stores: Vec<Arc<Chunk>> = Vec::new();
        loop {
            let chunk_id = layout::chunk_file_id(id, stores.len() as u64);
            if !layout::resolve_path(root, &chunk_id).exists() {
                break;
            }
            let chunk = Chunk::open(root, &chunk_id)?;
            if chunk.capacity() != config.chunk_capacity {
                return Err(TrackError::invalid_config(format!(
                    "chunk {chunk_id} has capacity {}, expected {}",
                    chunk.capacity(),
                    config.chunk_capacity
                )));
            }
            stores.push(Arc::new(chunk));
        }

        // Everything before the active chunk must be full; seal it so the
        // track keeps at most one live header mapping.
        if stores.len() > 1 {
            for chunk in &stores[..stores.len() - 1] {
                if !chunk.is_full() {
                    return Err(TrackError::corruption(format!(
                        "chunk {} holds {} of {} messages but is not the last chunk",
                        chunk.id(),
                        chunk.len(),
                        chunk.capacity()
                    )));
                }
                chunk.seal()?;
            }
        }

        let next_ordinal = match stores.last() {
            Some(last) => (stores.len() as u64 - 1) * config.chunk_capacity + last.len(),
            None => 0,
        };

        let meta_path = layout::resolve_path(root, &layout::meta_file_id(id));
        match read_meta(&meta_path) {
            Ok(Some(recorded)) if recorded != next_ordinal => warn!(
                track = id,
                recorded,
                recovered = next_ordinal,
                "metadata file disagrees with chunk files; trusting chunk files"
            ),
            Ok(_) => {}
            Err(err) => {
                debug!(track = id, error = %err, "ignoring unreadable track metadata")
            }
        }
        debug!(track = id, chunks = stores.len(), next = next_ordinal, "opened track");

        let shared = Arc::new(TrackShared {
            id: id.to_string(),
            root: root.map(Path::to_path_buf),
            config,
            stores: RwLock::new(stores),
            published: Mutex::new(next_ordinal),
            data_available: Condvar::new(),
            alive: AtomicBool::new(true),
            fatal: Mutex::new(None),
        });
        Self::start(shared, next_ordinal)
    }

    fn start(shared: Arc<TrackShared>, next_ordinal: u64) -> TrackResult<Track> {
        let (sender, receiver) = bounded(shared.config.queue_depth);
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("tracklog-writer-{}", shared.id))
            .spawn(move || writer_loop(receiver, worker, next_ordinal))?;
        Ok(Track {
            shared,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Count of messages committed so far.
    pub fn len(&self) -> u64 {
        *self.shared.published.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunk files backing the track.
    pub fn chunk_count(&self) -> usize {
        self.shared.stores.read().len()
    }

    /// True until the writer thread has drained and exited.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Enqueue one message for appending.
    ///
    /// Returns as soon as the payload is admitted to the bounded queue,
    /// blocking while the queue is full. Ordering among concurrent
    /// producers is queue admission order. Fails with `Closed` once the
    /// track has been closed and with `WriterFailed` after a fatal
    /// writer error.
    pub fn write_message(&self, payload: Vec<u8>) -> TrackResult<()> {
        if let Some(reason) = self.shared.fatal.lock().clone() {
            return Err(TrackError::WriterFailed(reason));
        }
        let sender = match &*self.sender.lock() {
            Some(sender) => sender.clone(),
            None => return Err(TrackError::Closed),
        };
        sender.send(payload).map_err(|_| {
            match self.shared.fatal.lock().clone() {
                Some(reason) => TrackError::WriterFailed(reason),
                None => TrackError::Closed,
            }
        })
    }

    /// Open a cursor positioned at the message with the given ordinal.
    ///
    /// The offset may point past the current end of the log, even into
    /// chunks that do not exist yet. In that case the first read blocks
    /// until the message has been written.
    pub fn reader_at(&self, offset: u64) -> TrackResult<TrackReader> {
        TrackReader::new(Arc::clone(&self.shared), offset)
    }

    /// Force all chunks to disk.
    pub fn flush(&self) -> TrackResult<()> {
        for chunk in self.shared.stores.read().iter() {
            chunk.flush()?;
        }
        Ok(())
    }

    /// Close the inbound queue.
    ///
    /// The writer drains messages already admitted, flushes the active
    /// chunk, persists the metadata fast-path file, and exits; tailing
    /// readers are woken and observe end-of-track. Idempotent.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            debug!(track = %self.shared.id, "track close requested");
        }
    }

    /// Block until the writer thread has finished draining and exited.
    pub fn wait_for_shutdown(&self) {
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!(track = %self.shared.id, "writer thread panicked");
            }
            return;
        }
        while self.is_alive() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.close();
    }
}

/// The single writer: drains the queue, appends, publishes, broadcasts.
fn writer_loop(receiver: Receiver<Vec<u8>>, shared: Arc<TrackShared>, mut ordinal: u64) {
    debug!(track = %shared.id, start = ordinal, "writer thread started");
    while let Ok(payload) = receiver.recv() {
        let chunk = match write_one(&shared, ordinal, &payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                error!(track = %shared.id, ordinal, error = %err, "append failed; shutting down writer");
                *shared.fatal.lock() = Some(err.to_string());
                break;
            }
        };
        ordinal += 1;
        {
            let mut published = shared.published.lock();
            *published = ordinal;
            shared.data_available.notify_all();
        }
        if let Some(every) = shared.config.flush_every {
            if ordinal % every == 0 {
                if let Err(err) = chunk.flush() {
                    warn!(track = %shared.id, ordinal, error = %err, "periodic flush failed");
                }
            }
        }
    }

    if let Some(active) = shared.stores.read().last() {
        if let Err(err) = active.flush() {
            warn!(track = %shared.id, error = %err, "failed to flush active chunk at shutdown");
        }
    }
    if let Err(err) = write_meta(&shared.meta_path(), ordinal) {
        warn!(track = %shared.id, error = %err, "failed to persist track metadata");
    }

    shared.alive.store(false, Ordering::Release);
    // Pair the final broadcast with the mutex so no reader can check the
    // alive flag and then sleep through it.
    let _published = shared.published.lock();
    shared.data_available.notify_all();
    debug!(track = %shared.id, next = ordinal, "writer thread exited");
}

/// Append the message with the given ordinal, rolling over to a new
/// chunk first when the previous one is full.
fn write_one(shared: &TrackShared, ordinal: u64, payload: &[u8]) -> TrackResult<Arc<Chunk>> {
    let (chunk_index, slot) = shared.config.locate(ordinal);

    if chunk_index == shared.stores.read().len() as u64 {
        if let Some(previous) = shared.stores.read().last() {
            if let Err(err) = previous.seal() {
                warn!(track = %shared.id, chunk = previous.id(), error = %err,
                    "failed to seal full chunk; leaving it writable");
            }
        }
        let chunk_id = layout::chunk_file_id(&shared.id, chunk_index);
        let chunk = Chunk::create(shared.root_path(), &chunk_id, shared.config.chunk_capacity)?;
        debug!(track = %shared.id, chunk = chunk_index, "rolled over to new chunk");
        shared.stores.write().push(Arc::new(chunk));
    }

    let stores = shared.stores.read();
    let chunk = stores
        .get(chunk_index as usize)
        .ok_or_else(|| TrackError::invalid_state("active chunk missing"))?;
    chunk.append(slot, payload)?;
    Ok(Arc::clone(chunk))
}

/// Write the metadata fast-path file: magic, version, next ordinal.
fn write_meta(path: &Path, next_ordinal: u64) -> TrackResult<()> {
    let mut buf = [0u8; META_LEN];
    LittleEndian::write_u64(&mut buf[0..8], META_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], META_VERSION);
    LittleEndian::write_u64(&mut buf[16..24], next_ordinal);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Read the metadata fast-path file; `None` when it does not exist.
fn read_meta(path: &Path) -> TrackResult<Option<u64>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut buf = [0u8; META_LEN];
    file.read_exact(&mut buf)?;
    if LittleEndian::read_u64(&buf[0..8]) != META_MAGIC {
        return Err(TrackError::corruption("bad track metadata magic"));
    }
    if LittleEndian::read_u32(&buf[8..12]) != META_VERSION {
        return Err(TrackError::corruption("unsupported track metadata version"));
    }
    Ok(Some(LittleEndian::read_u64(&buf[16..24])))
}
