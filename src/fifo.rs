use crate::pipes::PipeTransport;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

const FIFO_MODE: libc::mode_t = 0o660;

/// Named pipes on the local filesystem, the way COPY ... PROGRAM sees them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoTransport;

impl FifoTransport {
    pub fn new() -> Self {
        FifoTransport
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn is_fifo(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|md| md.file_type().is_fifo())
        .unwrap_or(false)
}

/// Release a reader stuck in `open(O_RDONLY)` on `path` by briefly showing
/// up as a writer. The reader then sees an immediate EOF. Used on
/// cancellation only; errors mean nobody was waiting and are ignored.
pub fn wake_blocked_reader(path: &Path) {
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}

impl PipeTransport for FifoTransport {
    type Reader = File;
    type Writer = File;

    fn create(&self, path: &Path) -> io::Result<()> {
        let c = c_path(path)?;
        let rc = unsafe { libc::mkfifo(c.as_ptr(), FIFO_MODE) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn open_read(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).open(path)
    }

    fn try_open_write(&self, path: &Path) -> io::Result<Option<File>> {
        // Non-blocking open fails with ENXIO until a reader has the pipe open,
        // which lets the caller keep an eye on cancellation while it waits.
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                // Writes must block on a full pipe rather than fail with EAGAIN.
                set_blocking(&file)?;
                Ok(Some(file))
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}
