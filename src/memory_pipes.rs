use crate::pipes::PipeTransport;
use crossbeam_channel as chan;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Chunks a pipe holds before the writer blocks, standing in for the
/// kernel's pipe buffer.
const CHANNEL_DEPTH: usize = 16;

struct Slot {
    tx: Option<chan::Sender<Vec<u8>>>,
    rx: Option<chan::Receiver<Vec<u8>>>,
    reader_attached: bool,
}

/// Pipes backed by bounded in-process channels.
///
/// Each side of a pipe can be taken exactly once: the agent takes its end
/// through the `PipeTransport` calls, a test plays the COPY peer through
/// `peer_reader` / `peer_writer`.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    slots: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        // a panicking test thread must not hide the state from the others
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The COPY FROM side of a restore pipe. Until it is taken, the agent's
    /// write-open sees no reader, as with a FIFO.
    pub fn peer_reader(&self, path: &Path) -> Option<ChannelReader> {
        let mut slots = self.slots();
        let slot = slots.get_mut(path)?;
        let rx = slot.rx.take()?;
        slot.reader_attached = true;
        Some(ChannelReader::new(rx))
    }

    /// The COPY TO side of a backup pipe.
    pub fn peer_writer(&self, path: &Path) -> Option<ChannelWriter> {
        let mut slots = self.slots();
        let slot = slots.get_mut(path)?;
        slot.tx.take().map(|tx| ChannelWriter { tx })
    }

    /// Pretend no COPY process will ever open this pipe for reading, even if
    /// `peer_reader` is called later.
    pub fn detach_reader(&self, path: &Path) {
        if let Some(slot) = self.slots().get_mut(path) {
            slot.reader_attached = false;
            slot.rx = None;
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.slots().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

impl PipeTransport for MemoryTransport {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn create(&self, path: &Path) -> io::Result<()> {
        let mut slots = self.slots();
        if slots.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }

        let (tx, rx) = chan::bounded(CHANNEL_DEPTH);
        slots.insert(
            path.to_path_buf(),
            Slot {
                tx: Some(tx),
                rx: Some(rx),
                reader_attached: false,
            },
        );
        Ok(())
    }

    fn open_read(&self, path: &Path) -> io::Result<ChannelReader> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        slot.rx
            .take()
            .map(ChannelReader::new)
            .ok_or_else(|| io::Error::other("read end already taken"))
    }

    fn try_open_write(&self, path: &Path) -> io::Result<Option<ChannelWriter>> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        if !slot.reader_attached {
            return Ok(None);
        }
        slot.tx
            .take()
            .map(|tx| Some(ChannelWriter { tx }))
            .ok_or_else(|| io::Error::other("write end already taken"))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match self.slots().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

pub struct ChannelReader {
    rx: chan::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: chan::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                // every writer is gone: EOF
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

pub struct ChannelWriter {
    tx: chan::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
