use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one transaction to `[len][bincode][crc32]` format.
fn encode_txn(writer: &mut impl Write, txn: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(txn).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - Each entry is one transaction; a multi-event mutation either replays
///   fully or not at all.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC
///   check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single transaction and fsync. Used by tests only —
    /// production code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, txn: &[Event]) -> io::Result<()> {
        self.append_buffered(txn)?;
        self.flush_sync()
    }

    /// Append a transaction to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything
    /// buffered.
    pub fn append_buffered(&mut self, txn: &[Event]) -> io::Result<()> {
        encode_txn(&mut self.writer, txn)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    /// This is the slow I/O phase — call OUTSIDE the WAL lock.
    pub fn write_compact_file(path: &Path, txn: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        encode_txn(&mut writer, txn)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal event set recreating current state.
    /// Convenience method that does both phases. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, txn: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, txn)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all committed events in order.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(txn) => events.extend(txn),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LotProfile;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("parkade_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn profile(name: &str) -> LotProfile {
        LotProfile {
            name: name.into(),
            address: "somewhere".into(),
            city: "Pune".into(),
            pincode: "411001".into(),
            area_type: "open".into(),
            price_per_hour: 30.0,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let lot_id = Ulid::new();
        let events = vec![
            Event::LotCreated {
                id: lot_id,
                profile: profile("Central"),
            },
            Event::SpotAdded {
                id: Ulid::new(),
                lot_id,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            // Two separate transactions
            wal.append(&events[..1]).unwrap();
            wal.append(&events[1..]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_event_txn_replays_as_unit() {
        let path = tmp_path("txn_unit.wal");
        let _ = fs::remove_file(&path);

        let lot_id = Ulid::new();
        let txn = vec![
            Event::LotCreated {
                id: lot_id,
                profile: profile("Airport"),
            },
            Event::SpotAdded {
                id: Ulid::new(),
                lot_id,
            },
            Event::SpotAdded {
                id: Ulid::new(),
                lot_id,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&txn).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, txn);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = Event::LotCreated {
            id: Ulid::new(),
            profile: profile("Central"),
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(std::slice::from_ref(&event)).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let txn = vec![Event::LotDeleted { id: Ulid::new() }];

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&txn).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let _ = fs::remove_file(&path);

        let lot_id = Ulid::new();

        // Write churn: create, then repeated spot add/remove
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&[Event::LotCreated {
                id: lot_id,
                profile: profile("Churny"),
            }])
            .unwrap();
            for _ in 0..10 {
                let spot_id = Ulid::new();
                wal.append(&[Event::SpotAdded { id: spot_id, lot_id }]).unwrap();
                wal.append(&[Event::SpotRemoved { id: spot_id, lot_id }]).unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the lot (no spots)
        let compacted = vec![Event::LotCreated {
            id: lot_id,
            profile: profile("Churny"),
        }];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let _ = fs::remove_file(&path);

        let lot_id = Ulid::new();
        let compacted = vec![Event::LotCreated {
            id: lot_id,
            profile: profile("Keeper"),
        }];
        let new_event = Event::SpotAdded {
            id: Ulid::new(),
            lot_id,
        };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(std::slice::from_ref(&new_event)).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let txns: Vec<Vec<Event>> = (0..5)
            .map(|i| {
                vec![Event::SpotAdded {
                    id: Ulid::new(),
                    lot_id: Ulid::new(),
                }, Event::NotificationQueued {
                    record: crate::model::Notification {
                        id: Ulid::new(),
                        user_id: Ulid::new(),
                        category: crate::model::Category::Info,
                        text: format!("txn {i}"),
                        read: false,
                        created_at: 0,
                    },
                }]
            })
            .collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for t in &txns {
                wal.append_buffered(t).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        let flat: Vec<Event> = txns.into_iter().flatten().collect();
        assert_eq!(replayed, flat);

        let _ = fs::remove_file(&path);
    }
}
