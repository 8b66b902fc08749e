//! Replay command implementation.
//!
//! Replays a JSON-lines change feed as one sync pass against an index
//! kept as a JSON snapshot file.

use replidx_engine::{
    ChangeSink, FeedEnd, FileWatermarkStore, IndexStore, InstanceId, MemoryIndexStore,
    OriginatorRef, PassSummary, RecordedFeed, SourceFeed, SyncConfig, SyncError, SyncRecord,
    SyncResult, SyncTarget, Timestamp, UniqueId, Watermark,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Selection criteria recorded when neither the caller nor a previous
/// pass supplied one.
pub const DEFAULT_FORMULA: &str = "SELECT @All";

/// A record of the snapshot index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    /// Unique id of the source document.
    pub unique_id: UniqueId,
    /// Version of the source document.
    pub sequence: u64,
    /// Modification time of that version.
    pub sequence_time: Timestamp,
    /// Payload as reported by the source.
    pub payload: serde_json::Value,
}

impl SyncRecord for IndexedRecord {
    fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn sequence_time(&self) -> Timestamp {
        self.sequence_time
    }
}

/// Options of the replay command.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Source instance the feed was read from.
    pub instance: String,
    /// Selection criteria to record for the next pass.
    pub formula: Option<String>,
    /// Whether the index is rebuilt from this feed alone.
    pub wipe: bool,
}

/// Runs the replay command.
pub fn run(
    feed_path: &Path,
    index_path: &Path,
    watermarks_path: &Path,
    options: &ReplayOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut feed = ReplayFeed::open(feed_path, options)?;
    let store = SnapshotStore::open(index_path)?;
    let seeded = store.existed;

    let config = SyncConfig::new(index_path.display().to_string())
        .with_initial_sync_completed(seeded);
    let target = SyncTarget::new(
        config,
        store,
        FileWatermarkStore::open(watermarks_path)?,
        map_payload,
    );

    let summary = target.run_pass(InstanceId::new(options.instance.as_str()), (), &mut feed)?;
    info!(
        index = %index_path.display(),
        records = target.store().inner.len(),
        "index snapshot written"
    );

    print_summary(&summary, target.store().inner.len());
    Ok(())
}

/// Turns a raw payload into a record. Payloads that are not JSON yield
/// nothing.
pub fn map_payload(_: &(), origin: &OriginatorRef, payload: &[u8]) -> Option<IndexedRecord> {
    let payload = serde_json::from_slice(payload).ok()?;
    Some(IndexedRecord {
        unique_id: origin.unique_id.clone(),
        sequence: origin.sequence,
        sequence_time: origin.sequence_time,
        payload,
    })
}

/// A recorded feed read from a JSON-lines file.
///
/// The pass ends at the latest sequence time in the file, or at the
/// previous watermark when that is later.
struct ReplayFeed {
    recorded: RecordedFeed,
    formula: Option<String>,
    wipe: bool,
}

impl ReplayFeed {
    fn open(path: &Path, options: &ReplayOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let reader = BufReader::new(File::open(path)?);
        let recorded = RecordedFeed::from_json_lines(
            reader,
            FeedEnd::new(DEFAULT_FORMULA, Timestamp::EPOCH),
        )?;

        Ok(Self {
            recorded,
            formula: options.formula.clone(),
            wipe: options.wipe,
        })
    }
}

impl SourceFeed for ReplayFeed {
    fn drive(
        &mut self,
        sink: &mut dyn ChangeSink,
        watermark: Option<&Watermark>,
    ) -> SyncResult<FeedEnd> {
        if self.wipe {
            sink.wipe();
        }
        let end = self.recorded.drive(sink, watermark)?;

        let previous = watermark.map_or(end.next_start, |w| w.last_end_timestamp);
        let next_start = self
            .recorded
            .latest_sequence_time()
            .map_or(previous, |latest| latest.max(previous));
        let formula = self
            .formula
            .clone()
            .or_else(|| watermark.map(|w| w.selection_formula.clone()))
            .unwrap_or(end.selection_formula);
        Ok(FeedEnd::new(formula, next_start))
    }
}

/// An in-memory index that rewrites its snapshot file on every commit.
struct SnapshotStore {
    path: PathBuf,
    inner: MemoryIndexStore<IndexedRecord>,
    existed: bool,
}

impl SnapshotStore {
    fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let (records, existed) = if path.exists() {
            let records: Vec<IndexedRecord> = serde_json::from_slice(&fs::read(path)?)?;
            (records, true)
        } else {
            (Vec::new(), false)
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: MemoryIndexStore::with_records(records),
            existed,
        })
    }

    fn persist(&self) -> SyncResult<()> {
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&serde_json::to_vec_pretty(&self.inner.snapshot())?)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn persist_or_reject(&self) -> SyncResult<()> {
        self.persist().map_err(|e| {
            SyncError::commit(format!("writing {}: {e}", self.path.display()))
        })
    }
}

impl IndexStore<IndexedRecord> for SnapshotStore {
    fn lookup_by_unique_id(&self, id: &UniqueId) -> SyncResult<Option<IndexedRecord>> {
        self.inner.lookup_by_unique_id(id)
    }

    fn clear(&self) -> SyncResult<()> {
        self.inner.clear()?;
        self.persist_or_reject()
    }

    fn update(&self, to_remove: &[IndexedRecord], to_add: &[IndexedRecord]) -> SyncResult<()> {
        self.inner.update(to_remove, to_add)?;
        self.persist_or_reject()
    }

    fn query(&self, predicate: &dyn Fn(&IndexedRecord) -> bool) -> SyncResult<Vec<IndexedRecord>> {
        self.inner.query(predicate)
    }

    fn apply(
        &self,
        wipe: bool,
        to_remove: &[IndexedRecord],
        to_add: &[IndexedRecord],
    ) -> SyncResult<()> {
        self.inner.apply(wipe, to_remove, to_add)?;
        self.persist_or_reject()
    }
}

fn print_summary(summary: &PassSummary, index_len: usize) {
    println!("replidx Replay");
    println!("==============");
    println!();
    println!("Instance: {}", summary.instance);
    println!("Wiped:    {}", if summary.wiped { "yes" } else { "no" });
    println!();
    println!("Events:");
    println!("  Added:   {}", summary.added);
    println!("  Updated: {}", summary.updated);
    println!("  Removed: {}", summary.removed);
    println!("  Ignored: {}", summary.ignored);
    println!();
    println!("Index records: {index_len}");
    println!("Duration:      {:?}", summary.duration);
}
