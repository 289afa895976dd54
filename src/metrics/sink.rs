use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::record::{MetricKind, Record};
use crate::config::OutputConfig;
use crate::error::SinkError;

/// Where each metric stream goes. Kinds without a path are discarded.
#[derive(Debug, Clone, Default)]
pub struct SinkOutputs {
    paths: HashMap<MetricKind, PathBuf>,
}

impl SinkOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: MetricKind, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.paths.insert(kind, path);
        }
        self
    }

    pub fn path(&self, kind: MetricKind) -> Option<&Path> {
        self.paths.get(&kind).map(PathBuf::as_path)
    }
}

impl From<&OutputConfig> for SinkOutputs {
    fn from(output: &OutputConfig) -> Self {
        SinkOutputs::new()
            .with(MetricKind::ConnectionTime, output.connection_time.clone())
            .with(MetricKind::RoundTrip, output.round_trip.clone())
            .with(MetricKind::BroadcastLatency, output.broadcast_latency.clone())
            .with(MetricKind::Throughput, output.throughput.clone())
            .with(MetricKind::Anomaly, output.anomalies.clone())
    }
}

#[derive(Debug)]
enum Command {
    Write(Record),
    Close,
}

/// Cheap, cloneable handle used by clients and servers to append records.
///
/// Appends never wait on file I/O: records are queued to a single writer
/// task which owns every output file and flushes after each row.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: mpsc::UnboundedSender<Command>,
}

/// Owner side of the writer task.
#[derive(Debug)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<SinkStats>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SinkStats {
    pub written: u64,
    pub discarded: u64,
    pub failed: u64,
}

impl MetricSink {
    pub fn spawn(outputs: SinkOutputs) -> (MetricSink, SinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(outputs, rx));

        (MetricSink { tx: tx.clone() }, SinkHandle { tx, task })
    }

    pub fn record(&self, record: Record) {
        if self.tx.send(Command::Write(record)).is_err() {
            debug!("Metric sink closed, dropping record");
        }
    }
}

impl SinkHandle {
    /// Drains every queued record, flushes and closes the files.
    pub async fn close(self) -> SinkStats {
        let _ = self.tx.send(Command::Close);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Metric writer task failed: {}", e);
                SinkStats::default()
            }
        }
    }
}

/// One output file. Rows are encoded by a `csv::Writer` into memory and
/// written out and flushed one row at a time.
struct CsvStream {
    path: PathBuf,
    encoder: csv::Writer<RowBuf>,
    file: BufWriter<File>,
}

/// In-memory row buffer for `CsvStream::encoder`; `csv::Writer` only exposes
/// `get_ref`, so the encoded bytes are drained through a `RefCell`.
#[derive(Default)]
struct RowBuf(std::cell::RefCell<Vec<u8>>);

impl std::io::Write for RowBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::Write::write(self.0.get_mut(), buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CsvStream {
    async fn create(path: &Path, header: &[&str]) -> Result<Self, SinkError> {
        let open_err = |source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await.map_err(open_err)?;
        }
        let file = File::create(path).await.map_err(open_err)?;

        let encoder = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(RowBuf::default());
        let mut stream = Self {
            path: path.to_path_buf(),
            encoder,
            file: BufWriter::new(file),
        };
        stream.append(header).await?;
        Ok(stream)
    }

    async fn append<I, T>(&mut self, row: I) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let write_err = |source| SinkError::Write {
            path: self.path.clone(),
            source,
        };
        self.encoder
            .write_record(row)
            .map_err(|e| write_err(e.into()))?;
        self.encoder.flush().map_err(write_err)?;

        let encoded = self.encoder.get_ref().0.take();
        self.file.write_all(&encoded).await.map_err(write_err)?;
        self.file.flush().await.map_err(write_err)
    }
}

async fn run_writer(outputs: SinkOutputs, mut rx: mpsc::UnboundedReceiver<Command>) -> SinkStats {
    let mut streams = HashMap::new();
    for kind in MetricKind::ALL {
        let Some(path) = outputs.path(kind) else {
            continue;
        };
        match CsvStream::create(path, kind.header()).await {
            Ok(stream) => {
                info!("Writing {} records to {}", kind, path.display());
                streams.insert(kind, stream);
            }
            Err(e) => error!("{}", e),
        }
    }

    let mut stats = SinkStats::default();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(record) => write_record(&mut streams, &record, &mut stats).await,
            Command::Close => break,
        }
    }

    // clients may still hold senders; take whatever was queued before close
    while let Ok(command) = rx.try_recv() {
        if let Command::Write(record) = command {
            write_record(&mut streams, &record, &mut stats).await;
        }
    }

    for stream in streams.values_mut() {
        if let Err(e) = stream.file.shutdown().await {
            error!("Failed to close {}: {}", stream.path.display(), e);
        }
    }
    debug!(
        "Metric sink closed: {} written, {} discarded, {} failed",
        stats.written, stats.discarded, stats.failed
    );
    stats
}

async fn write_record(
    streams: &mut HashMap<MetricKind, CsvStream>,
    record: &Record,
    stats: &mut SinkStats,
) {
    let Some(stream) = streams.get_mut(&record.kind()) else {
        trace!("No output for {} records", record.kind());
        stats.discarded += 1;
        return;
    };

    match stream.append(record.fields()).await {
        Ok(()) => stats.written += 1,
        Err(e) => {
            error!("{}", e);
            stats.failed += 1;
        }
    }
}
