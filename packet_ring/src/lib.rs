// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use log::*;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Handle for a registered consumer of a [`RingBuffer`].
///
/// IDs are allocated monotonically and never reused within the lifetime of a
/// buffer, so a stale handle can never alias a newer reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "reader {}", self.0)
    }
}

/// The possible errors that can arise from using a ring buffer.
#[derive(Debug)]
pub enum Error {
    /// A buffer cannot be constructed with zero slots.
    InvalidCapacity,

    /// The given reader ID was never registered, or has been unregistered.
    /// Reads under an unknown ID are a programming bug in the caller.
    UnknownReader(ReaderId),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidCapacity => write!(f, "ring buffer capacity must be positive"),
            Self::UnknownReader(id) => write!(f, "{id} is not registered"),
        }
    }
}

/// A record stored in the buffer, tagged with the version assigned at write
/// time and the instant it was written.
struct Slot<T> {
    data: T,
    version: u64,
    written: Instant,
}

/// Per-reader cursor state. The cursor is a `(read_idx, last_version)` pair:
/// the slot index to inspect next, and the version of the last record this
/// reader consumed (-1 before the first read).
struct ReaderState {
    name: String,
    read_idx: usize,
    last_version: i64,
    read_count: u64,
    last_read_time: Option<Instant>,
    registered: Instant,
}

struct Registry {
    next_id: u64,
    readers: HashMap<ReaderId, ReaderState>,
}

impl Registry {
    fn get_mut(&mut self, id: ReaderId) -> Result<&mut ReaderState, Error> {
        self.readers.get_mut(&id).ok_or(Error::UnknownReader(id))
    }
}

/// Write-side counters, readable through [`RingBuffer::buffer_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub writes: u64,
    pub overwrites: u64,
    pub total_reads: u64,
}

struct Ring<T> {
    slots: Vec<Option<Slot<T>>>,
    write_idx: usize,
    write_version: u64,
    stats: Stats,
}

/// A record returned by [`RingBuffer::read_with_metadata`].
#[derive(Debug, Clone)]
pub struct ReadItem<T> {
    pub data: T,
    pub version: u64,
    pub written: Instant,
    pub reader: String,
}

/// A record visible to a reader but not yet consumed, as returned by
/// [`RingBuffer::pending`].
#[derive(Debug, Clone)]
pub struct PendingItem<T> {
    pub data: T,
    pub version: u64,
    pub written: Instant,
    pub position: usize,
}

/// A point-in-time snapshot of the buffer, see [`RingBuffer::buffer_status`].
#[derive(Debug, Clone)]
pub struct BufferStatus {
    pub capacity: usize,
    pub write_idx: usize,
    pub write_version: u64,
    pub valid_items: usize,
    /// Fraction of slots holding a record, in percent.
    pub usage: f64,
    pub readers: usize,
    pub stats: Stats,
}

/// A snapshot of one reader's state, see [`RingBuffer::reader_info`].
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    pub id: ReaderId,
    pub name: String,
    pub read_idx: usize,
    pub last_version: i64,
    pub read_count: u64,
    pub last_read_time: Option<Instant>,
    pub registered: Instant,
}

/// A bounded single-producer, multi-consumer FIFO over a fixed array of slots.
///
/// Every write is tagged with a strictly increasing version number. Each
/// registered reader owns an independent cursor and receives each record at
/// most once, in version order. The writer never blocks: a reader that falls
/// behind by more than the capacity is lapped, silently loses the overwritten
/// records, and resumes at the oldest record still present.
///
/// Slot state, the write cursor, and reader cursor motion are serialized by
/// one lock; the reader registry is guarded separately so registration never
/// contends with the writer. Lock order is always ring, then registry.
pub struct RingBuffer<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    registry: Mutex<Registry>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            capacity,
            ring: Mutex::new(Ring {
                slots,
                write_idx: 0,
                write_version: 0,
                stats: Stats::default(),
            }),
            registry: Mutex::new(Registry {
                next_id: 0,
                readers: HashMap::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new reader. The reader starts at the beginning of the
    /// buffer and will see every record still present. Never fails.
    pub fn register(&self, name: Option<&str>) -> ReaderId {
        let mut registry = self.registry.lock().unwrap();

        let id = ReaderId(registry.next_id);
        registry.next_id += 1;

        let name = match name {
            Some(name) => name.to_owned(),
            None => format!("reader_{}", id.0),
        };

        debug!("registered {id} ('{name}')");

        registry.readers.insert(
            id,
            ReaderState {
                name,
                read_idx: 0,
                last_version: -1,
                read_count: 0,
                last_read_time: None,
                registered: Instant::now(),
            },
        );

        id
    }

    /// Remove a reader. Returns false if the ID was not registered;
    /// unregistering twice is harmless.
    pub fn unregister(&self, id: ReaderId) -> bool {
        let mut registry = self.registry.lock().unwrap();
        registry.readers.remove(&id).is_some()
    }

    /// Append a record, overwriting the oldest slot if the buffer has
    /// wrapped. Returns the version assigned to the record.
    ///
    /// Overwriting a record that some reader has not consumed is permitted;
    /// it is counted in the stats and logged per lapped reader.
    pub fn write(&self, data: T) -> u64 {
        let mut ring = self.ring.lock().unwrap();

        let idx = ring.write_idx;
        let version = ring.write_version;

        if let Some(old) = ring.slots[idx].take() {
            ring.stats.overwrites += 1;
            self.warn_lapped_readers(old.version);
        }

        ring.slots[idx] = Some(Slot {
            data,
            version,
            written: Instant::now(),
        });

        ring.write_idx = (idx + 1) % self.capacity;
        ring.write_version += 1;
        ring.stats.writes += 1;

        version
    }

    /// Consume up to `max_items` records for the given reader, in version
    /// order. An empty result means no unread record is currently present.
    pub fn read(&self, id: ReaderId, max_items: usize) -> Result<Vec<T>, Error> {
        let mut ring = self.ring.lock().unwrap();
        let mut registry = self.registry.lock().unwrap();
        let reader = registry.get_mut(id)?;

        let items = consume(&mut ring, reader, max_items);

        Ok(items.into_iter().map(|(data, _, _)| data).collect())
    }

    /// Like [`RingBuffer::read`], but each record carries its version, write
    /// time, and the consuming reader's name.
    pub fn read_with_metadata(
        &self,
        id: ReaderId,
        max_items: usize,
    ) -> Result<Vec<ReadItem<T>>, Error> {
        let mut ring = self.ring.lock().unwrap();
        let mut registry = self.registry.lock().unwrap();
        let reader = registry.get_mut(id)?;
        let name = reader.name.clone();

        let items = consume(&mut ring, reader, max_items);

        Ok(items
            .into_iter()
            .map(|(data, version, written)| ReadItem {
                data,
                version,
                written,
                reader: name.clone(),
            })
            .collect())
    }

    /// List the records currently visible to a reader without consuming them
    /// or moving its cursor.
    pub fn pending(&self, id: ReaderId) -> Result<Vec<PendingItem<T>>, Error> {
        let ring = self.ring.lock().unwrap();
        let mut registry = self.registry.lock().unwrap();
        let reader = registry.get_mut(id)?;

        let start = resume_index(&ring, reader.read_idx, reader.last_version);
        let mut idx = start;
        let mut last_version = reader.last_version;
        let mut items = Vec::new();

        loop {
            let Some(slot) = &ring.slots[idx] else {
                break;
            };

            if (slot.version as i64) <= last_version {
                break;
            }

            items.push(PendingItem {
                data: slot.data.clone(),
                version: slot.version,
                written: slot.written,
                position: idx,
            });
            last_version = slot.version as i64;

            idx = (idx + 1) % self.capacity;
            if idx == start {
                break;
            }
        }

        Ok(items)
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let ring = self.ring.lock().unwrap();
        let registry = self.registry.lock().unwrap();

        let valid_items = ring.slots.iter().filter(|s| s.is_some()).count();

        BufferStatus {
            capacity: self.capacity,
            write_idx: ring.write_idx,
            write_version: ring.write_version,
            valid_items,
            usage: valid_items as f64 / self.capacity as f64 * 100.0,
            readers: registry.readers.len(),
            stats: ring.stats.clone(),
        }
    }

    /// Snapshot one reader's state, or every reader's if `id` is None.
    pub fn reader_info(&self, id: Option<ReaderId>) -> Result<Vec<ReaderInfo>, Error> {
        let registry = self.registry.lock().unwrap();

        let snapshot = |id: ReaderId, reader: &ReaderState| ReaderInfo {
            id,
            name: reader.name.clone(),
            read_idx: reader.read_idx,
            last_version: reader.last_version,
            read_count: reader.read_count,
            last_read_time: reader.last_read_time,
            registered: reader.registered,
        };

        match id {
            Some(id) => {
                let reader = registry.readers.get(&id).ok_or(Error::UnknownReader(id))?;
                Ok(vec![snapshot(id, reader)])
            }
            None => Ok(registry
                .readers
                .iter()
                .map(|(id, reader)| snapshot(*id, reader))
                .collect()),
        }
    }

    /// Drop readers that have neither read nor been registered within the
    /// given timeout. Returns how many were removed.
    pub fn cleanup_old_readers(&self, timeout: Duration) -> usize {
        let mut registry = self.registry.lock().unwrap();
        let now = Instant::now();

        let before = registry.readers.len();
        registry.readers.retain(|id, reader| {
            let last_activity = reader.last_read_time.unwrap_or(reader.registered);
            let keep = now.duration_since(last_activity) <= timeout;
            if !keep {
                info!("dropping inactive {id} ('{}')", reader.name);
            }
            keep
        });

        before - registry.readers.len()
    }

    /// Called with the ring lock held, immediately before a slot is reused.
    fn warn_lapped_readers(&self, overwritten: u64) {
        let registry = self.registry.lock().unwrap();

        for (id, reader) in &registry.readers {
            if reader.last_version < overwritten as i64 {
                warn!(
                    "overwriting record version {overwritten} not yet read by {id} ('{}')",
                    reader.name
                );
            }
        }
    }
}

/// Where a reader should resume. Normally this is its own cursor, but a
/// reader that has been lapped finds a record under its cursor that is more
/// than one full revolution ahead; its unread records up to the oldest
/// surviving one are gone, and the oldest survivor sits under the write
/// cursor.
fn resume_index<T>(ring: &Ring<T>, read_idx: usize, last_version: i64) -> usize {
    let capacity = ring.slots.len();

    if let Some(slot) = &ring.slots[read_idx] {
        if slot.version as i64 > last_version + capacity as i64 {
            return ring.write_idx;
        }
    }

    read_idx
}

/// The shared walk behind `read` and `read_with_metadata`. Requires both the
/// ring lock and the registry lock to be held by the caller.
fn consume<T: Clone>(
    ring: &mut Ring<T>,
    reader: &mut ReaderState,
    max_items: usize,
) -> Vec<(T, u64, Instant)> {
    let capacity = ring.slots.len();

    let mut read_idx = resume_index(ring, reader.read_idx, reader.last_version);
    let mut last_version = reader.last_version;
    let mut items = Vec::new();

    while items.len() < max_items {
        let Some(slot) = &ring.slots[read_idx] else {
            // The slot ahead of the cursor has never been written.
            break;
        };

        if (slot.version as i64) <= last_version {
            // The writer has not wrapped past this slot again yet.
            break;
        }

        items.push((slot.data.clone(), slot.version, slot.written));
        last_version = slot.version as i64;
        read_idx = (read_idx + 1) % capacity;
    }

    if !items.is_empty() {
        reader.read_idx = read_idx;
        reader.last_version = last_version;
        reader.read_count += items.len() as u64;
        reader.last_read_time = Some(Instant::now());
        ring.stats.total_reads += items.len() as u64;
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_does_not_consume() {
        let buffer = RingBuffer::new(4).unwrap();
        let reader = buffer.register(None);

        buffer.write("a");
        buffer.write("b");

        let pending = buffer.pending(reader).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].version, 0);
        assert_eq!(pending[0].position, 0);
        assert_eq!(pending[1].version, 1);

        // The cursor has not moved:
        let again = buffer.pending(reader).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(buffer.read(reader, 10).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn pending_after_lap_is_bounded() {
        let buffer = RingBuffer::new(3).unwrap();
        let reader = buffer.register(None);

        for n in 0..7u32 {
            buffer.write(n);
        }

        let pending = buffer.pending(reader).unwrap();
        let versions: Vec<u64> = pending.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![4, 5, 6]);
    }

    #[test]
    fn status_reflects_writes() {
        let buffer = RingBuffer::new(8).unwrap();
        buffer.register(Some("status_watcher"));

        for n in 0..4u32 {
            buffer.write(n);
        }

        let status = buffer.buffer_status();
        assert_eq!(status.capacity, 8);
        assert_eq!(status.write_version, 4);
        assert_eq!(status.write_idx, 4);
        assert_eq!(status.valid_items, 4);
        assert_eq!(status.usage, 50.0);
        assert_eq!(status.readers, 1);
        assert_eq!(status.stats.writes, 4);
        assert_eq!(status.stats.overwrites, 0);
    }

    #[test]
    fn reader_info_tracks_reads() {
        let buffer = RingBuffer::new(4).unwrap();
        let reader = buffer.register(Some("tracked"));

        buffer.write(1u32);
        buffer.write(2u32);
        buffer.read(reader, 1).unwrap();

        let info = buffer.reader_info(Some(reader)).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].name, "tracked");
        assert_eq!(info[0].read_count, 1);
        assert_eq!(info[0].last_version, 0);
        assert!(info[0].last_read_time.is_some());

        let unknown = buffer.register(None);
        buffer.unregister(unknown);
        assert!(matches!(
            buffer.reader_info(Some(unknown)),
            Err(Error::UnknownReader(_))
        ));
    }

    #[test]
    fn cleanup_drops_only_stale_readers() {
        let buffer = RingBuffer::new(4).unwrap();
        let stale = buffer.register(Some("stale"));
        let active = buffer.register(Some("active"));

        buffer.write(1u32);
        buffer.read(active, 1).unwrap();

        // Nothing is older than an hour:
        assert_eq!(buffer.cleanup_old_readers(Duration::from_secs(3600)), 0);

        // With a zero timeout every reader is stale:
        assert_eq!(buffer.cleanup_old_readers(Duration::ZERO), 2);
        assert!(matches!(
            buffer.read(stale, 1),
            Err(Error::UnknownReader(_))
        ));
    }
}
