//! End-to-end coverage for track recovery, tailing reads, and the
//! producer/consumer path.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracklog::{Track, TrackConfig, TrackError};

const CHUNK_CAPACITY: u64 = 1_000;

fn config() -> TrackConfig {
    TrackConfig::with_chunk_capacity(CHUNK_CAPACITY)
}

fn payload(ordinal: u64) -> Vec<u8> {
    ordinal.to_string().into_bytes()
}

#[test]
fn multi_chunk_track_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "journeys", config()).expect("create");
    for ordinal in 0..3 * CHUNK_CAPACITY {
        track.write_message(payload(ordinal)).expect("write");
    }
    track.close();
    track.wait_for_shutdown();
    assert!(!track.is_alive());
    drop(track);

    for index in 0..3u64 {
        assert!(dir.path().join(format!("journeys{index}")).exists());
    }
    assert!(!dir.path().join("journeys3").exists());

    let reopened = Track::open(Some(dir.path()), "journeys", config()).expect("open");
    assert_eq!(reopened.chunk_count(), 3);
    assert_eq!(reopened.len(), 3 * CHUNK_CAPACITY);

    let mut reader = reopened.reader_at(0).expect("reader");
    let mut buf = vec![0u8; 32];
    for ordinal in 0..3 * CHUNK_CAPACITY {
        let n = reader.read_message(&mut buf).expect("read");
        assert_eq!(&buf[..n], payload(ordinal).as_slice());
    }

    reopened.close();
    reopened.wait_for_shutdown();
}

#[test]
fn reopened_track_keeps_appending_where_it_left_off() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "resume", config()).expect("create");
    for ordinal in 0..CHUNK_CAPACITY + 10 {
        track.write_message(payload(ordinal)).expect("write");
    }
    track.close();
    track.wait_for_shutdown();
    drop(track);

    let reopened = Track::open(Some(dir.path()), "resume", config()).expect("open");
    assert_eq!(reopened.len(), CHUNK_CAPACITY + 10);
    for ordinal in CHUNK_CAPACITY + 10..CHUNK_CAPACITY + 20 {
        reopened.write_message(payload(ordinal)).expect("write");
    }

    let mut reader = reopened.reader_at(0).expect("reader");
    let mut buf = vec![0u8; 32];
    for ordinal in 0..CHUNK_CAPACITY + 20 {
        let n = reader.read_message(&mut buf).expect("read");
        assert_eq!(&buf[..n], payload(ordinal).as_slice());
    }
}

#[test]
fn concurrent_producer_and_consumer_agree_on_the_sequence() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "firehose", config()).expect("create");

    thread::scope(|scope| {
        // The consumer starts before the producer and tails the log.
        let consumer = scope.spawn(|| {
            let mut reader = track.reader_at(0).expect("reader");
            let mut buf = vec![0u8; 32];
            let mut seen = Vec::with_capacity(CHUNK_CAPACITY as usize);
            for _ in 0..CHUNK_CAPACITY {
                let n = reader.read_message(&mut buf).expect("read");
                seen.push(buf[..n].to_vec());
            }
            seen
        });

        scope.spawn(|| {
            for ordinal in 0..CHUNK_CAPACITY {
                track.write_message(payload(ordinal)).expect("write");
            }
        });

        let seen = consumer.join().expect("consumer");
        assert_eq!(seen.len(), CHUNK_CAPACITY as usize);
        for (ordinal, message) in seen.iter().enumerate() {
            assert_eq!(message, &payload(ordinal as u64));
        }
    });
}

#[test]
fn reader_at_future_offset_blocks_until_written() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "future", config()).expect("create");

    // A reader far past the end of an empty track must be constructible.
    let mut reader = track.reader_at(100).expect("reader");

    let (result_tx, result_rx) = mpsc::channel();
    thread::scope(|scope| {
        scope.spawn(move || {
            let mut buf = vec![0u8; 32];
            let n = reader.read_message(&mut buf).expect("read");
            result_tx.send(buf[..n].to_vec()).expect("send");
        });

        // Nothing written yet: the read must stay parked.
        assert!(result_rx.recv_timeout(Duration::from_millis(200)).is_err());

        // The first hundred messages are not enough either.
        for ordinal in 0..100 {
            track.write_message(payload(ordinal)).expect("write");
        }
        assert!(result_rx.recv_timeout(Duration::from_millis(200)).is_err());

        // Message 100 unblocks it.
        track.write_message(payload(100)).expect("write");
        let message = result_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("read completed");
        assert_eq!(message, payload(100));
    });
}

#[test]
fn tailing_reader_wakes_on_the_next_append() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "tail", config()).expect("create");
    for ordinal in 0..5 {
        track.write_message(payload(ordinal)).expect("write");
    }

    let mut reader = track.reader_at(0).expect("reader");
    let mut buf = vec![0u8; 32];
    for _ in 0..5 {
        reader.read_message(&mut buf).expect("read");
    }

    let (result_tx, result_rx) = mpsc::channel();
    thread::scope(|scope| {
        scope.spawn(move || {
            let mut buf = vec![0u8; 32];
            let n = reader.read_message(&mut buf).expect("read");
            result_tx.send(buf[..n].to_vec()).expect("send");
        });

        assert!(result_rx.recv_timeout(Duration::from_millis(200)).is_err());
        track.write_message(payload(5)).expect("write");
        let message = result_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("read completed");
        assert_eq!(message, payload(5));
    });
}

#[test]
fn closing_the_track_wakes_tailing_readers_with_eof() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "drain", config()).expect("create");
    track.write_message(payload(0)).expect("write");

    let mut reader = track.reader_at(1).expect("reader");
    let (result_tx, result_rx) = mpsc::channel();
    thread::scope(|scope| {
        scope.spawn(move || {
            let mut buf = vec![0u8; 32];
            let outcome = reader.read_message(&mut buf);
            result_tx.send(outcome).expect("send");
        });

        assert!(result_rx.recv_timeout(Duration::from_millis(200)).is_err());
        track.close();
        let outcome = result_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("reader woke");
        assert!(matches!(outcome, Err(TrackError::Eof)));
    });

    assert!(matches!(
        track.write_message(payload(1)),
        Err(TrackError::Closed)
    ));
    track.wait_for_shutdown();
}

#[test]
fn close_drains_already_queued_messages() {
    let dir = TempDir::new().expect("tempdir");
    let track = Track::create(Some(dir.path()), "lastcall", config()).expect("create");
    for ordinal in 0..50 {
        track.write_message(payload(ordinal)).expect("write");
    }
    // Close immediately: everything admitted to the queue must still
    // reach disk before the writer exits.
    track.close();
    track.wait_for_shutdown();
    assert_eq!(track.len(), 50);
    drop(track);

    let reopened = Track::open(Some(dir.path()), "lastcall", config()).expect("open");
    assert_eq!(reopened.len(), 50);
    let mut reader = reopened.reader_at(0).expect("reader");
    let mut buf = vec![0u8; 32];
    for ordinal in 0..50 {
        let n = reader.read_message(&mut buf).expect("read");
        assert_eq!(&buf[..n], payload(ordinal).as_slice());
    }
}
