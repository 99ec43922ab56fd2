//! Per-call profiling records
//!
//! With profiling enabled every outermost GEMM call produces one
//! [`ProfileRecord`], handed to the context's [`ProfileSink`]. Without a sink
//! the record is logged at debug level.

use std::fmt::Write as _;
use std::io::Write;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dtype::GemmKind;
use crate::error::Result;
use crate::matrix::Transpose;
use crate::strategy::Strategy;

/// Column names written by [`CsvProfileSink::with_header`]
pub const CSV_HEADER: &str =
    "site,kind,devices,host_threads,op_a,op_b,m,n,k,splitting_steps,indicator,elapsed,gflops";

/// One profiled GEMM call
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileRecord {
    /// Caller location
    pub site: &'static Location<'static>,
    /// Element kind
    pub kind: GemmKind,
    /// Bound devices (0 if the call stayed on the host)
    pub devices: usize,
    /// Host threads available to the call
    pub host_threads: usize,
    /// Operation on A
    pub op_a: Transpose,
    /// Operation on B
    pub op_b: Transpose,
    /// Rows of C
    pub m: usize,
    /// Columns of C
    pub n: usize,
    /// Inner dimension
    pub k: usize,
    /// Bisections performed by the capacity partitioner
    pub splitting_steps: usize,
    /// `0` for host-only, `-1` for K-split, otherwise the split ratio
    pub indicator: f32,
    /// Wall time of the call in seconds
    pub elapsed: f64,
    /// Achieved rate
    pub gflops: f64,
}

impl ProfileRecord {
    /// Indicator column for a strategy run with `split`
    pub fn indicator_for(strategy: Strategy, split: f32) -> f32 {
        match strategy {
            Strategy::CpuOnly => 0.0,
            Strategy::SpecialK => -1.0,
            Strategy::GpuAssisted { .. } => split,
        }
    }

    /// Gflop/s for `m x n x k` of `kind` completed in `elapsed` seconds
    pub fn rate(kind: GemmKind, m: usize, n: usize, k: usize, elapsed: f64) -> f64 {
        if elapsed > 0.0 {
            kind.flops(m, n, k) / elapsed * 1e-9
        } else {
            0.0
        }
    }

    /// One comma-separated row, without a line terminator
    pub fn to_csv_row(&self) -> String {
        let mut row = String::new();
        let _ = write!(
            row,
            "{}:{},{},{},{},{},{},{},{},{},{},{:.3},{:.6},{:.3}",
            self.site.file(),
            self.site.line(),
            self.kind,
            self.devices,
            self.host_threads,
            self.op_a.as_char(),
            self.op_b.as_char(),
            self.m,
            self.n,
            self.k,
            self.splitting_steps,
            self.indicator,
            self.elapsed,
            self.gflops
        );
        row
    }
}

/// Destination of profile records
pub trait ProfileSink: Send {
    /// Consume one record
    fn record(&mut self, record: &ProfileRecord) -> Result<()>;
}

/// Writes records as comma-separated rows
#[derive(Debug)]
pub struct CsvProfileSink<W: Write> {
    writer: W,
}

impl<W: Write> CsvProfileSink<W> {
    /// Sink without a header line
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Sink that starts with [`CSV_HEADER`]
    pub fn with_header(mut writer: W) -> Result<Self> {
        writeln!(writer, "{CSV_HEADER}")?;
        Ok(Self { writer })
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ProfileSink for CsvProfileSink<W> {
    fn record(&mut self, record: &ProfileRecord) -> Result<()> {
        writeln!(self.writer, "{}", record.to_csv_row())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory; clones share the same storage
#[derive(Clone, Debug, Default)]
pub struct MemoryProfileSink {
    records: Arc<Mutex<Vec<ProfileRecord>>>,
}

impl MemoryProfileSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records so far
    pub fn records(&self) -> Vec<ProfileRecord> {
        self.records.lock().clone()
    }
}

impl ProfileSink for MemoryProfileSink {
    fn record(&mut self, record: &ProfileRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
