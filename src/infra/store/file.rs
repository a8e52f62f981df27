//! File-backed state store using JSON-lines journals.
//!
//! One journal per table (`jobs.jsonl`, `batches.jsonl`, `workers.jsonl`)
//! under a directory. Each write appends a single upsert or removal line. The
//! files are owned by a background writer thread fed over a channel, so
//! callers holding coordinator locks only serialize and enqueue. Journals are
//! folded to one line per live record on open, and rewritten in the
//! background once a table's journal grows past twice its live size.

use std::collections::HashMap;
use std::fs::{create_dir_all, rename, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{StateStore, StoreSnapshot};
use crate::core::error::SchedulerError;
use crate::core::job::{Batch, Job};
use crate::core::worker_registry::Worker;
use crate::util::serde::{BatchId, JobId, WorkerId};

/// Journals shorter than this are never compacted in the background.
const COMPACT_MIN_LINES: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Jobs,
    Batches,
    Workers,
}

impl Table {
    const fn name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Batches => "batches",
            Self::Workers => "workers",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine<T> {
    Put { record: T },
    Remove { id: Uuid },
}

enum WriterMsg {
    Append { table: Table, line: String },
    Compact { table: Table, lines: Vec<String> },
    Flush(Sender<Result<(), String>>),
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    workers: HashMap<WorkerId, Worker>,
    /// Lines in each journal since it was last compacted.
    journal_lines: [usize; 3],
}

impl Tables {
    fn live(&self, table: Table) -> usize {
        match table {
            Table::Jobs => self.jobs.len(),
            Table::Batches => self.batches.len(),
            Table::Workers => self.workers.len(),
        }
    }

    fn compacted_lines(&self, table: Table) -> Result<Vec<String>, SchedulerError> {
        match table {
            Table::Jobs => put_lines(self.jobs.values()),
            Table::Batches => put_lines(self.batches.values()),
            Table::Workers => put_lines(self.workers.values()),
        }
    }
}

/// JSON-lines store rooted at a directory.
pub struct FileStore {
    path: PathBuf,
    tables: Mutex<Tables>,
    tx: Option<Sender<WriterMsg>>,
    writer: Option<JoinHandle<()>>,
    compactions: Arc<AtomicUsize>,
}

fn backend(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Backend(e.to_string())
}

fn encode<T: Serialize>(line: &JournalLine<T>) -> Result<String, SchedulerError> {
    serde_json::to_string(line).map_err(backend)
}

fn put_lines<'a, T, I>(records: I) -> Result<Vec<String>, SchedulerError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    records
        .into_iter()
        .map(|record| encode(&JournalLine::Put { record }))
        .collect()
}

fn table_path(dir: &Path, table: Table) -> PathBuf {
    dir.join(format!("{}.jsonl", table.name()))
}

/// Replay a journal into a map keyed by record id.
fn read_journal<T, F>(dir: &Path, table: Table, key: F) -> Result<HashMap<Uuid, T>, SchedulerError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Uuid,
{
    let file_path = table_path(dir, table);
    let mut out = HashMap::new();
    if !file_path.exists() {
        return Ok(out);
    }
    let file = File::open(&file_path).map_err(backend)?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(backend)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalLine<T>>(&line).map_err(backend)? {
            JournalLine::Put { record } => {
                out.insert(key(&record), record);
            }
            JournalLine::Remove { id } => {
                out.remove(&id);
            }
        }
    }
    Ok(out)
}

/// Replace a journal with `lines` through a temp file and rename.
fn write_table(dir: &Path, table: Table, lines: &[String]) -> std::io::Result<()> {
    let target = table_path(dir, table);
    let tmp = target.with_extension("jsonl.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for line in lines {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
    }
    rename(tmp, target)
}

fn open_append(dir: &Path, table: Table) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(table_path(dir, table))?;
    Ok(BufWriter::new(file))
}

fn flush_all(files: &mut [Option<BufWriter<File>>; 3]) -> std::io::Result<()> {
    for writer in files.iter_mut().flatten() {
        writer.flush()?;
    }
    Ok(())
}

/// Writer thread: drains whatever is queued, applies it, then flushes once.
fn run_writer(dir: PathBuf, rx: Receiver<WriterMsg>, compactions: Arc<AtomicUsize>) {
    let mut files: [Option<BufWriter<File>>; 3] = [None, None, None];
    let mut failure: Option<String> = None;

    while let Ok(first) = rx.recv() {
        let mut flush_replies = Vec::new();
        for msg in std::iter::once(first).chain(rx.try_iter()) {
            match msg {
                WriterMsg::Append { table, line } => {
                    let slot = &mut files[table.index()];
                    if slot.is_none() {
                        match open_append(&dir, table) {
                            Ok(writer) => *slot = Some(writer),
                            Err(e) => {
                                tracing::error!(table = table.name(), error = %e, "journal open failed");
                                failure = Some(e.to_string());
                                continue;
                            }
                        }
                    }
                    if let Some(writer) = slot.as_mut() {
                        if let Err(e) = writeln!(writer, "{line}") {
                            tracing::error!(table = table.name(), error = %e, "journal append failed");
                            failure = Some(e.to_string());
                        }
                    }
                }
                WriterMsg::Compact { table, lines } => {
                    files[table.index()] = None;
                    match write_table(&dir, table, &lines) {
                        Ok(()) => {
                            compactions.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(table = table.name(), records = lines.len(), "journal compacted");
                        }
                        Err(e) => {
                            tracing::error!(table = table.name(), error = %e, "journal compaction failed");
                            failure = Some(e.to_string());
                        }
                    }
                }
                WriterMsg::Flush(reply) => flush_replies.push(reply),
            }
        }
        if let Err(e) = flush_all(&mut files) {
            tracing::error!(error = %e, "journal flush failed");
            failure = Some(e.to_string());
        }
        for reply in flush_replies {
            let result = failure.take().map_or(Ok(()), Err);
            let _ = reply.send(result);
        }
    }
    if let Err(e) = flush_all(&mut files) {
        tracing::error!(error = %e, "journal flush failed on close");
    }
}

impl FileStore {
    /// Open (or create) a store under `path`, replaying and compacting
    /// existing journals.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path).map_err(backend)?;

        let mut tables = Tables {
            jobs: read_journal::<Job, _>(&path, Table::Jobs, |j| j.id)?,
            batches: read_journal::<Batch, _>(&path, Table::Batches, |b| b.id)?,
            workers: read_journal::<Worker, _>(&path, Table::Workers, |w| w.id)?,
            journal_lines: [0; 3],
        };
        for table in [Table::Jobs, Table::Batches, Table::Workers] {
            let lines = tables.compacted_lines(table)?;
            write_table(&path, table, &lines).map_err(backend)?;
            tables.journal_lines[table.index()] = lines.len();
        }
        tracing::info!(
            path = %path.display(),
            jobs = tables.jobs.len(),
            batches = tables.batches.len(),
            workers = tables.workers.len(),
            "file store opened"
        );

        let (tx, rx) = unbounded();
        let compactions = Arc::new(AtomicUsize::new(0));
        let writer = {
            let dir = path.clone();
            let compactions = Arc::clone(&compactions);
            std::thread::Builder::new()
                .name("render-farm-store".into())
                .spawn(move || run_writer(dir, rx, compactions))
                .map_err(backend)?
        };

        Ok(Self {
            path,
            tables: Mutex::new(tables),
            tx: Some(tx),
            writer: Some(writer),
            compactions,
        })
    }

    /// Directory holding the journals.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full journal rewrites performed by the writer since open.
    #[must_use]
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::Relaxed)
    }

    fn send(&self, msg: WriterMsg) -> Result<(), SchedulerError> {
        self.tx
            .as_ref()
            .ok_or_else(|| backend("store closed"))?
            .send(msg)
            .map_err(|_| backend("store writer stopped"))
    }

    /// Enqueue journal lines for `table`, scheduling a compaction when the
    /// journal has grown well past the live record count.
    fn append(&self, tables: &mut Tables, table: Table, lines: Vec<String>) -> Result<(), SchedulerError> {
        tables.journal_lines[table.index()] += lines.len();
        for line in lines {
            self.send(WriterMsg::Append { table, line })?;
        }
        let live = tables.live(table);
        if tables.journal_lines[table.index()] > COMPACT_MIN_LINES.max(live * 2) {
            let lines = tables.compacted_lines(table)?;
            tables.journal_lines[table.index()] = lines.len();
            self.send(WriterMsg::Compact { table, lines })?;
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn put_job(&self, job: &Job) -> Result<(), SchedulerError> {
        let line = encode(&JournalLine::Put { record: job })?;
        let mut tables = self.tables.lock();
        tables.jobs.insert(job.id, job.clone());
        self.append(&mut tables, Table::Jobs, vec![line])
    }

    fn put_batch(&self, batch: &Batch) -> Result<(), SchedulerError> {
        let line = encode(&JournalLine::Put { record: batch })?;
        let mut tables = self.tables.lock();
        tables.batches.insert(batch.id, batch.clone());
        self.append(&mut tables, Table::Batches, vec![line])
    }

    fn put_worker(&self, worker: &Worker) -> Result<(), SchedulerError> {
        let line = encode(&JournalLine::Put { record: worker })?;
        let mut tables = self.tables.lock();
        tables.workers.insert(worker.id, worker.clone());
        self.append(&mut tables, Table::Workers, vec![line])
    }

    fn remove_job(&self, id: JobId) -> Result<(), SchedulerError> {
        let mut tables = self.tables.lock();
        tables.jobs.remove(&id);
        let batch_ids: Vec<BatchId> = tables
            .batches
            .values()
            .filter(|b| b.job_id == id)
            .map(|b| b.id)
            .collect();
        let mut batch_lines = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            tables.batches.remove(&batch_id);
            batch_lines.push(encode(&JournalLine::<Batch>::Remove { id: batch_id })?);
        }
        let job_line = encode(&JournalLine::<Job>::Remove { id })?;
        self.append(&mut tables, Table::Jobs, vec![job_line])?;
        self.append(&mut tables, Table::Batches, batch_lines)
    }

    fn remove_worker(&self, id: WorkerId) -> Result<(), SchedulerError> {
        let line = encode(&JournalLine::<Worker>::Remove { id })?;
        let mut tables = self.tables.lock();
        tables.workers.remove(&id);
        self.append(&mut tables, Table::Workers, vec![line])
    }

    fn load(&self) -> Result<StoreSnapshot, SchedulerError> {
        let tables = self.tables.lock();
        Ok(StoreSnapshot {
            jobs: tables.jobs.values().cloned().collect(),
            batches: tables.batches.values().cloned().collect(),
            workers: tables.workers.values().cloned().collect(),
        })
    }

    fn flush(&self) -> Result<(), SchedulerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(WriterMsg::Flush(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| backend("store writer stopped"))?
            .map_err(backend)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!(path = %self.path.display(), "store writer panicked");
            }
        }
    }
}
