use crate::state::fsm::Fsm;
use caravel_common::model::{LogIndex, RpcError};
use caravel_common::wire::encode_entry;
use caravel_common::wire::MessageType;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Entries applied since the last snapshot before a new snapshot is taken.
const SNAPSHOT_THRESHOLD: u64 = 8192;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader,
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log codec error: {0}")]
    Codec(String),
}

/// Durable ordered storage for framed log entries plus point-in-time
/// snapshots. The consensus transport that replicates entries between voters
/// is an external collaborator; the core owns ordering, durability and
/// replay.
pub trait LogStore: Send {
    fn append(&mut self, frame: &[u8]) -> Result<(), RaftError>;
    /// Entries after the last stored snapshot, in order.
    fn entries(&self) -> Result<Vec<Vec<u8>>, RaftError>;
    fn store_snapshot(&mut self, index: LogIndex, data: &[u8]) -> Result<(), RaftError>;
    fn load_snapshot(&self) -> Result<Option<(LogIndex, Vec<u8>)>, RaftError>;
}

/// In-memory backend for tests and `data_dir`-less development servers.
pub struct MemLogStore {
    entries: Vec<Vec<u8>>,
    snapshot: Option<(LogIndex, Vec<u8>)>,
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore {
            entries: Vec::new(),
            snapshot: None,
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, frame: &[u8]) -> Result<(), RaftError> {
        self.entries.push(frame.to_vec());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Vec<u8>>, RaftError> {
        Ok(self.entries.clone())
    }

    fn store_snapshot(&mut self, index: LogIndex, data: &[u8]) -> Result<(), RaftError> {
        self.snapshot = Some((index, data.to_vec()));
        self.entries.clear();
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<(LogIndex, Vec<u8>)>, RaftError> {
        Ok(self.snapshot.clone())
    }
}

/// File-backed log: an append-only file of self-delimiting frames next to a
/// snapshot file. Appends are fsynced before the entry is applied.
pub struct FileLogStore {
    dir: PathBuf,
    log: File,
}

impl FileLogStore {
    pub fn open(dir: &Path) -> Result<FileLogStore, RaftError> {
        std::fs::create_dir_all(dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(dir.join("log.bin"))?;
        Ok(FileLogStore {
            dir: dir.to_path_buf(),
            log,
        })
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.bin")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.bin")
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, frame: &[u8]) -> Result<(), RaftError> {
        self.log.write_all(frame)?;
        self.log.sync_all()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Vec<u8>>, RaftError> {
        let file = File::open(self.log_path())?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            if buf.len() - offset < 5 {
                return Err(RaftError::Codec(format!(
                    "truncated frame header at offset {offset}"
                )));
            }
            let len = u32::from_be_bytes([
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
                buf[offset + 4],
            ]) as usize;
            let end = offset + 5 + len;
            if end > buf.len() {
                return Err(RaftError::Codec(format!(
                    "truncated frame body at offset {offset}"
                )));
            }
            entries.push(buf[offset..end].to_vec());
            offset = end;
        }
        Ok(entries)
    }

    fn store_snapshot(&mut self, index: LogIndex, data: &[u8]) -> Result<(), RaftError> {
        let tmp = self.dir.join("snapshot.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&index.to_be_bytes())?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.snapshot_path())?;

        // Entries up to the snapshot are no longer needed for recovery.
        self.log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(self.log_path())?;
        self.log.sync_all()?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<(LogIndex, Vec<u8>)>, RaftError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let mut index_bytes = [0u8; 8];
        file.read_exact(&mut index_bytes)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some((u64::from_be_bytes(index_bytes), data)))
    }
}

struct WriteState {
    log: Box<dyn LogStore>,
    fsm: Fsm,
    entries_since_snapshot: u64,
}

/// Handle to the replicated log: ordered, durable apply with strictly
/// monotonic indices, plus the leadership signal every leader-only subsystem
/// hangs off.
pub struct RaftHandle {
    write: Mutex<WriteState>,
    last_index: AtomicU64,
    leadership_tx: watch::Sender<bool>,
}

impl RaftHandle {
    /// Restores the FSM from the stored snapshot and log, then returns a
    /// handle positioned after the last entry. Leadership starts false; the
    /// leadership loop flips it once leader-only subsystems are ready.
    pub fn bootstrap(log: Box<dyn LogStore>, fsm: Fsm) -> Result<Arc<RaftHandle>, RaftError> {
        let mut last_index = 0u64;
        if let Some((snapshot_index, data)) = log.load_snapshot()? {
            let snapshot = crate::state::StateSnapshot::from_bytes(&data)
                .map_err(|err| RaftError::Codec(err.to_string()))?;
            fsm.state().restore(snapshot);
            last_index = snapshot_index;
            info!(index = snapshot_index, "restored state snapshot");
        }
        let entries = log.entries()?;
        for frame in &entries {
            last_index += 1;
            if let Err(err) = fsm.apply(last_index, frame) {
                // Deterministic business rejections are part of the log's
                // history; replay must tolerate them exactly like the
                // original apply did.
                warn!(index = last_index, %err, "replayed rejected log entry");
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), last_index, "replayed log entries");
        }

        let (leadership_tx, _) = watch::channel(false);
        Ok(Arc::new(RaftHandle {
            write: Mutex::new(WriteState {
                log,
                fsm,
                entries_since_snapshot: 0,
            }),
            last_index: AtomicU64::new(last_index),
            leadership_tx,
        }))
    }

    /// Appends one entry and applies it to the FSM. The returned inner result
    /// is the entry's deterministic business outcome; the entry is durable
    /// either way.
    pub async fn apply<T: Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<(LogIndex, Result<(), RpcError>), RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        let frame =
            encode_entry(message_type, payload).map_err(|err| RaftError::Codec(err.to_string()))?;

        let mut write = self.write.lock().await;
        write.log.append(&frame)?;
        let index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = write.fsm.apply(index, &frame);

        write.entries_since_snapshot += 1;
        if write.entries_since_snapshot >= SNAPSHOT_THRESHOLD {
            let snapshot = write.fsm.state().snapshot();
            match snapshot.to_bytes() {
                Ok(data) => {
                    write.log.store_snapshot(snapshot.index, &data)?;
                    write.entries_since_snapshot = 0;
                    info!(index = snapshot.index, "stored state snapshot");
                }
                Err(err) => warn!(%err, "failed to serialize state snapshot"),
            }
        }
        Ok((index, outcome))
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership_tx.borrow()
    }

    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership_tx.subscribe()
    }

    /// Flipped by the leadership loop. Single-voter bootstrap self-elects;
    /// multi-voter deployments drive this from the consensus transport.
    pub fn set_leader(&self, is_leader: bool) {
        self.leadership_tx.send_replace(is_leader);
    }
}

/// Maps a raft-layer failure onto the RPC error taxonomy.
pub fn raft_error_to_rpc(err: RaftError) -> RpcError {
    match err {
        RaftError::NotLeader => RpcError::NoLeader,
        other => RpcError::StateWrite(other.to_string()),
    }
}
