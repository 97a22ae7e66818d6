//! Per-consumer cursors that stitch chunk readers into one stream and
//! block at the tail of the log.

use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::chunk::ChunkReader;
use crate::error::{TrackError, TrackResult};
use crate::track::TrackShared;

/// A seekable, blocking cursor over a track.
///
/// Each call to [`read_message`] delivers exactly one whole message:
/// this is a message-boundary contract, not a byte-stream contract. The
/// supplied buffer must be large enough for the next message; a short
/// buffer fails with `BufferTooSmall` and consumes nothing.
///
/// A reader that catches up with the writer blocks until the next
/// message is committed. Reading from a track that has shut down fails
/// with `Eof`.
///
/// Reads require `&mut self`, which makes each cursor single-entrant;
/// independent cursors over the same track never interfere.
///
/// [`read_message`]: TrackReader::read_message
pub struct TrackReader {
    shared: Arc<TrackShared>,
    offset: u64,
    current: Option<ChunkReader>,
}

impl TrackReader {
    /// Position a cursor at `offset`, pre-opening the per-chunk reader
    /// when that message already exists.
    pub(crate) fn new(shared: Arc<TrackShared>, offset: u64) -> TrackResult<Self> {
        let (chunk_index, slot) = shared.config.locate(offset);
        let current = {
            let stores = shared.stores.read();
            match stores.get(chunk_index as usize) {
                Some(chunk) if slot < chunk.len() => Some(chunk.reader_at(slot)?),
                _ => None,
            }
        };
        Ok(Self {
            shared,
            offset,
            current,
        })
    }

    /// Ordinal of the next message this cursor will deliver.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next message into `buf`, blocking while the cursor is at
    /// the tail of the log. Returns the message length on success.
    pub fn read_message(&mut self, buf: &mut [u8]) -> TrackResult<usize> {
        if !self.shared.alive.load(Ordering::Acquire) {
            return Err(TrackError::Eof);
        }
        let (chunk_index, slot) = self.shared.config.locate(self.offset);

        {
            let mut published = self.shared.published.lock();
            while *published <= self.offset {
                if !self.shared.alive.load(Ordering::Acquire) {
                    return Err(TrackError::Eof);
                }
                self.shared.data_available.wait(&mut published);
            }
        }

        let chunk = {
            let stores = self.shared.stores.read();
            stores.get(chunk_index as usize).map(Arc::clone)
        }
        .ok_or_else(|| TrackError::invalid_state("committed message missing its chunk"))?;

        // Waking from a tail wait can leave the cursor without a
        // per-chunk reader (the chunk may not even have existed when the
        // wait began); open one at the current position.
        if self.current.is_none() {
            self.current = Some(chunk.reader_at(slot)?);
        }

        let needed = chunk.size_of(slot)?;
        if needed > buf.len() as u64 {
            return Err(TrackError::BufferTooSmall {
                needed,
                provided: buf.len() as u64,
            });
        }
        let needed = needed as usize;
        let Some(sub) = self.current.as_mut() else {
            return Err(TrackError::invalid_state("chunk reader missing after open"));
        };
        sub.read_exact(&mut buf[..needed])?;

        self.offset += 1;
        if self.offset % self.shared.config.chunk_capacity == 0 {
            self.roll_over(chunk_index + 1)?;
        }
        Ok(needed)
    }

    /// Crossing a chunk boundary: drop the exhausted per-chunk reader
    /// and pre-open the successor when it already has data.
    fn roll_over(&mut self, next_index: u64) -> TrackResult<()> {
        self.current = None;
        let stores = self.shared.stores.read();
        if let Some(next) = stores.get(next_index as usize) {
            if !next.is_empty() {
                self.current = Some(next.reader_at(0)?);
            }
        }
        Ok(())
    }

    /// Release the per-chunk file handle. Equivalent to dropping.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackConfig;
    use crate::track::Track;
    use tempfile::TempDir;

    fn scratch() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    #[test]
    fn buffer_too_small_consumes_nothing() {
        let dir = scratch();
        let track =
            Track::create(Some(dir.path()), "shortbuf", TrackConfig::with_chunk_capacity(8))
                .expect("create");
        track
            .write_message(b"0123456789ABCDEF".to_vec())
            .expect("write");

        let mut reader = track.reader_at(0).expect("reader");
        let mut small = [0u8; 4];
        let err = reader.read_message(&mut small).expect_err("short buffer");
        assert!(matches!(
            err,
            TrackError::BufferTooSmall {
                needed: 16,
                provided: 4
            }
        ));
        assert_eq!(reader.offset(), 0);

        // The failed read left the stream intact.
        let mut buf = [0u8; 16];
        let n = reader.read_message(&mut buf).expect("retry");
        assert_eq!(&buf[..n], b"0123456789ABCDEF");
        assert_eq!(reader.offset(), 1);
    }

    #[test]
    fn read_on_dead_track_is_eof() {
        let dir = scratch();
        let track = Track::create(Some(dir.path()), "dead", TrackConfig::with_chunk_capacity(8))
            .expect("create");
        track.write_message(b"gone".to_vec()).expect("write");
        track.close();
        track.wait_for_shutdown();

        let mut reader = track.reader_at(0).expect("reader");
        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read_message(&mut buf),
            Err(TrackError::Eof)
        ));
    }

    #[test]
    fn reader_crosses_chunk_boundaries() {
        let dir = scratch();
        let track = Track::create(Some(dir.path()), "cross", TrackConfig::with_chunk_capacity(2))
            .expect("create");
        for i in 0..6u64 {
            track.write_message(format!("m{i}").into_bytes()).expect("write");
        }

        let mut reader = track.reader_at(0).expect("reader");
        let mut buf = [0u8; 8];
        for i in 0..6u64 {
            let n = reader.read_message(&mut buf).expect("read");
            assert_eq!(&buf[..n], format!("m{i}").as_bytes());
        }
        assert_eq!(reader.offset(), 6);
    }

    #[test]
    fn reader_at_mid_stream_offset_skips_earlier_messages() {
        let dir = scratch();
        let track = Track::create(Some(dir.path()), "seek", TrackConfig::with_chunk_capacity(4))
            .expect("create");
        for i in 0..6u64 {
            track.write_message(format!("m{i}").into_bytes()).expect("write");
        }
        // Make sure all six are committed before seeking.
        let mut tail = track.reader_at(5).expect("tail reader");
        let mut buf = [0u8; 8];
        tail.read_message(&mut buf).expect("tail read");

        let mut reader = track.reader_at(4).expect("reader");
        let n = reader.read_message(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"m4");
    }
}
