use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Row writer backed by a local file.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Open `path`, creating parent directories as needed.
    pub fn open(path: &Path, append: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .with_context(|| format!("opening output file {}", path.display()))?;

        tracing::info!(path = %path.display(), append, "aggregated output opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn write_row(&mut self, row: &str) -> Result<()> {
        self.writer
            .write_all(row.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .with_context(|| format!("writing row to {}", self.path.display()))
    }

    pub fn close(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        self.writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_visible_before_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/agg.csv");

        let mut sink = FileSink::open(&path, true).expect("open");
        sink.write_row("r,m,s,1,2,2,2:1,0,1").expect("write");

        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content, "r,m,s,1,2,2,2:1,0,1\n");

        sink.close().expect("close");
    }

    #[test]
    fn test_append_and_truncate_modes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agg.csv");
        std::fs::write(&path, "old\n").expect("seed file");

        let mut sink = FileSink::open(&path, true).expect("open append");
        sink.write_row("new").expect("write");
        sink.close().expect("close");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "old\nnew\n");

        let mut sink = FileSink::open(&path, false).expect("open truncate");
        sink.write_row("only").expect("write");
        sink.close().expect("close");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "only\n");
    }
}
