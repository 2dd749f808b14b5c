use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

/// An asynchronous log sink: lines go through a channel and a dedicated
/// drainer thread writes them out, so the scheduler never blocks on file I/O.
/// Closing (or dropping) the writer drains the channel and joins the thread.
#[derive(Debug)]
pub struct LogWriter {
    tx: Option<mpsc::Sender<String>>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl LogWriter {
    /// Opens the main log at `path` (created if missing, appended otherwise).
    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::msg(format!("failed to open log {}: {e}", path.display())))?;
        Ok(Self::spawn(file, path.to_path_buf()))
    }

    /// Creates a per-task sink backed by a temp file under `dir`. The file is
    /// kept after the run so output can be inspected later.
    pub fn task_sink(dir: &Path, task_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        let temp = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_filename_component(task_name)))
            .suffix(".log")
            .tempfile_in(dir)
            .map_err(|e| {
                Error::msg(format!("failed to create task log in {}: {e}", dir.display()))
            })?;
        let (file, path) = temp
            .keep()
            .map_err(|e| Error::msg(format!("failed to keep task log: {e}")))?;
        Ok(Self::spawn(file, path))
    }

    fn spawn(file: File, path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel::<String>();
        let handle = std::thread::spawn(move || {
            let mut out = BufWriter::new(file);
            for msg in rx {
                let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                let _ = writeln!(out, "[{stamp}] {msg}");
            }
            let _ = out.flush();
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a line. Never blocks; a dead drainer is ignored.
    pub fn append(&self, msg: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(msg.to_string());
        }
    }

    /// Closes the channel and waits for the drainer to finish writing.
    pub fn close(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn sanitize_filename_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() { "task".into() } else { out }
}
