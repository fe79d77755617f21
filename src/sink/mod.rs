pub mod file;
pub mod memory;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub use file::FileSink;
pub use memory::MemorySink;

/// Where aggregated rows go. Opened on the first run start.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    File { path: PathBuf, append: bool },
    Stdout,
    Memory(MemorySink),
}

impl SinkTarget {
    /// Map a configured output path to a target. `-` selects stdout.
    pub fn from_path(path: &str, append: bool) -> Self {
        if path == "-" {
            Self::Stdout
        } else {
            Self::File {
                path: PathBuf::from(path),
                append,
            }
        }
    }

    pub fn open(&self) -> Result<RowSink> {
        match self {
            Self::File { path, append } => Ok(RowSink::File(FileSink::open(path, *append)?)),
            Self::Stdout => Ok(RowSink::Stdout(std::io::stdout())),
            Self::Memory(m) => Ok(RowSink::Memory(m.clone())),
        }
    }
}

/// Append-only row writer.
///
/// Enum dispatch over the concrete writers; every row is flushed as soon as
/// it is written.
pub enum RowSink {
    File(FileSink),
    Stdout(std::io::Stdout),
    Memory(MemorySink),
}

impl RowSink {
    /// Returns the sink name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Stdout(_) => "stdout",
            Self::Memory(_) => "memory",
        }
    }

    /// Write one row followed by a newline.
    pub fn write_row(&mut self, row: &str) -> Result<()> {
        match self {
            Self::File(s) => s.write_row(row),
            Self::Stdout(out) => {
                let mut lock = out.lock();
                writeln!(lock, "{row}").context("writing row to stdout")?;
                lock.flush().context("flushing stdout")
            }
            Self::Memory(m) => m.push(row),
        }
    }

    /// Flush and release the underlying writer.
    pub fn close(self) -> Result<()> {
        match self {
            Self::File(s) => s.close(),
            Self::Stdout(mut out) => out.flush().context("flushing stdout"),
            Self::Memory(m) => {
                m.mark_flushed();
                m.mark_closed();
                Ok(())
            }
        }
    }
}
