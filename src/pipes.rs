use crate::error::{AgentError, Result};
use crate::failure::CancelToken;
use crate::Oid;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait between attempts to attach to a pipe whose COPY reader
/// hasn't shown up yet.
pub const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The OS facility behind the pipes.
///
/// `FifoTransport` is the production one; `MemoryTransport` swaps in byte
/// channels so the engines can be tested without touching the filesystem.
pub trait PipeTransport {
    type Reader: Read;
    type Writer: Write;

    /// Create the pipe. An existing pipe at `path` is an error.
    fn create(&self, path: &Path) -> io::Result<()>;

    /// Open for reading, blocking until the writing peer shows up.
    fn open_read(&self, path: &Path) -> io::Result<Self::Reader>;

    /// Open for writing if a reading peer is attached, `Ok(None)` otherwise.
    fn try_open_write(&self, path: &Path) -> io::Result<Option<Self::Writer>>;

    fn remove(&self, path: &Path) -> io::Result<()>;
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// `<prefix>_<oid>`
pub fn pipe_path(prefix: &Path, oid: Oid) -> PathBuf {
    suffixed(prefix, &format!("_{oid}"))
}

/// `<prefix>_error`
pub fn sentinel_path(prefix: &Path) -> PathBuf {
    suffixed(prefix, "_error")
}

/// `<prefix>_skip_<oid>`, dropped by the orchestrator when it gave up on a
/// table and will never attach a reader to its pipe.
pub fn skip_marker_path(prefix: &Path, oid: Oid) -> PathBuf {
    suffixed(prefix, &format!("_skip_{oid}"))
}

/// An open pipe end. The owning manager refuses to remove the pipe while
/// one of these is alive.
pub struct PipeHandle<S> {
    stream: S,
    busy: Arc<AtomicBool>,
}

impl<S> Drop for PipeHandle<S> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl<S: Read> Read for PipeHandle<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<S: Write> Write for PipeHandle<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Outcome of waiting for a COPY reader to attach.
pub enum WriteOpen<W> {
    Opened(PipeHandle<W>),
    /// The orchestrator left a skip marker for this table.
    Skipped,
}

struct PipeEntry {
    path: PathBuf,
    busy: Arc<AtomicBool>,
}

/// Owns every pipe of one agent run.
///
/// Pipes are tracked from `create` until `remove`; whatever is still
/// tracked when the manager goes away is removed on drop.
pub struct PipeManager<T: PipeTransport> {
    transport: T,
    prefix: PathBuf,
    pipes: BTreeMap<Oid, PipeEntry>,
}

impl<T: PipeTransport> PipeManager<T> {
    pub fn new(transport: T, prefix: &Path) -> Self {
        Self {
            transport,
            prefix: prefix.to_path_buf(),
            pipes: BTreeMap::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn path_for(&self, oid: Oid) -> PathBuf {
        pipe_path(&self.prefix, oid)
    }

    pub fn create(&mut self, oid: Oid) -> Result<()> {
        let path = self.path_for(oid);
        if self.pipes.contains_key(&oid) {
            return Err(AgentError::Pipe {
                path,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "pipe was already created"),
            });
        }

        self.transport.create(&path).map_err(|source| AgentError::Pipe {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(oid, path = %path.display(), "created pipe");

        self.pipes.insert(
            oid,
            PipeEntry {
                path,
                busy: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(())
    }

    /// Create the pipes of every table up front, so COPY peers started in
    /// parallel by the orchestrator never find their pipe missing.
    pub fn create_all(&mut self, oids: &[Oid]) -> Result<()> {
        for &oid in oids {
            self.create(oid)?;
        }
        Ok(())
    }

    fn claim(&self, oid: Oid) -> Result<(&Path, Arc<AtomicBool>)> {
        let entry = self.pipes.get(&oid).ok_or_else(|| AgentError::Pipe {
            path: self.path_for(oid),
            source: io::Error::new(io::ErrorKind::NotFound, "pipe is not managed by this agent"),
        })?;

        if entry.busy.swap(true, Ordering::AcqRel) {
            return Err(AgentError::Pipe {
                path: entry.path.clone(),
                source: io::Error::new(io::ErrorKind::ResourceBusy, "pipe is already open"),
            });
        }
        Ok((&entry.path, entry.busy.clone()))
    }

    /// Open a table's pipe for reading. Blocks until COPY opens the other end.
    pub fn open_read(&mut self, oid: Oid) -> Result<PipeHandle<T::Reader>> {
        let (path, busy) = self.claim(oid)?;
        match self.transport.open_read(path) {
            Ok(stream) => Ok(PipeHandle { stream, busy }),
            Err(source) => {
                busy.store(false, Ordering::Release);
                Err(AgentError::Pipe {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Open a table's pipe for writing once COPY has attached a reader.
    ///
    /// Polls so that cancellation is noticed while waiting, and, when
    /// `honor_skip_marker` is set, gives up if the orchestrator marks the
    /// table as skipped.
    pub fn open_write(
        &mut self,
        oid: Oid,
        token: &CancelToken,
        honor_skip_marker: bool,
    ) -> Result<WriteOpen<T::Writer>> {
        let skip_marker = skip_marker_path(&self.prefix, oid);
        let (path, busy) = self.claim(oid)?;

        let released = |err: AgentError| {
            busy.store(false, Ordering::Release);
            err
        };

        loop {
            if token.is_cancelled() {
                return Err(released(AgentError::Interrupted));
            }

            match self.transport.try_open_write(path) {
                Ok(Some(stream)) => {
                    return Ok(WriteOpen::Opened(PipeHandle {
                        stream,
                        busy: busy.clone(),
                    }));
                }
                Ok(None) => {
                    if honor_skip_marker && skip_marker.exists() {
                        tracing::info!(oid, "skip marker found, not restoring table");
                        busy.store(false, Ordering::Release);
                        return Ok(WriteOpen::Skipped);
                    }
                    std::thread::sleep(OPEN_POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(released(AgentError::Pipe {
                        path: path.to_path_buf(),
                        source,
                    }));
                }
            }
        }
    }

    /// Remove a pipe whose transfer is over. Removing a pipe that is still
    /// open, or one this manager never created, is a bug in the caller.
    pub fn remove(&mut self, oid: Oid) -> Result<()> {
        let entry = self.pipes.get(&oid).ok_or_else(|| AgentError::Pipe {
            path: self.path_for(oid),
            source: io::Error::new(io::ErrorKind::NotFound, "pipe is not managed by this agent"),
        })?;

        if entry.busy.load(Ordering::Acquire) {
            return Err(AgentError::Pipe {
                path: entry.path.clone(),
                source: io::Error::new(io::ErrorKind::ResourceBusy, "pipe is still open"),
            });
        }

        self.transport
            .remove(&entry.path)
            .map_err(|source| AgentError::Pipe {
                path: entry.path.clone(),
                source,
            })?;
        tracing::debug!(oid, "removed pipe");
        self.pipes.remove(&oid);
        Ok(())
    }

    /// Teardown: remove every pipe still on disk, open or not. Best effort;
    /// failures are logged, not returned.
    pub fn remove_all(&mut self) {
        for (oid, entry) in std::mem::take(&mut self.pipes) {
            match self.transport.remove(&entry.path) {
                Ok(()) => tracing::debug!(oid, "removed leftover pipe"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(oid, error = %e, "failed to remove pipe"),
            }
        }
    }

    /// Oids whose pipes still exist.
    pub fn outstanding(&self) -> Vec<Oid> {
        self.pipes.keys().copied().collect()
    }
}

impl<T: PipeTransport> Drop for PipeManager<T> {
    fn drop(&mut self) {
        self.remove_all();
    }
}
