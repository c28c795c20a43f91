use crate::error::{AgentError, Result};
use crate::failure::CancelToken;
use crate::fifo;
use crate::pipes::OPEN_POLL_INTERVAL;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Time the engine gets to unwind on its own after a signal. Past it the
/// engine is stuck in I/O on a peer that will never move, and the watcher
/// tears down by itself.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// What the watcher needs to know about the run.
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Every pipe the run may create.
    pub pipes: Vec<PathBuf>,
    pub sentinel: PathBuf,
    /// Poke `pipes` so a reader blocked in open() returns. Backup only.
    pub wake_readers: bool,
}

fn termination_set() -> io::Result<libc::sigset_t> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        if libc::sigemptyset(&mut set) != 0
            || libc::sigaddset(&mut set, libc::SIGINT) != 0
            || libc::sigaddset(&mut set, libc::SIGTERM) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(set)
    }
}

/// Route SIGINT/SIGTERM to a dedicated watcher thread.
///
/// The signals are blocked in the calling thread (and so in every thread it
/// spawns later); the watcher collects them with `sigwait`, trips `token`
/// and leaves cleanup to the engine loop, stepping in only if the engine
/// hasn't exited within `SHUTDOWN_GRACE`.
///
/// Must be called before any other thread is started.
pub fn install(token: CancelToken, teardown: Teardown) -> Result<()> {
    let set = termination_set().map_err(|e| AgentError::io("Failed to build signal set", e))?;

    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(AgentError::io(
            "Failed to block termination signals",
            io::Error::from_raw_os_error(rc),
        ));
    }

    thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || watch(set, token, teardown))
        .map_err(|e| AgentError::io("Failed to start signal watcher", e))?;

    Ok(())
}

fn watch(set: libc::sigset_t, token: CancelToken, teardown: Teardown) {
    loop {
        let mut sig: libc::c_int = 0;
        let rc = unsafe { libc::sigwait(&set, &mut sig) };
        if rc == 0 {
            tracing::warn!(signal = sig, "received a termination signal, aborting");
            break;
        }
    }

    token.cancel();

    // The engine may have checked the token just before the signal and be
    // about to block in open(), so keep poking. Further signals stay
    // blocked and pending.
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        if teardown.wake_readers {
            for path in &teardown.pipes {
                fifo::wake_blocked_reader(path);
            }
        }
        thread::sleep(OPEN_POLL_INTERVAL);
    }

    force_teardown(&teardown);
    std::process::exit(2);
}

fn force_teardown(teardown: &Teardown) {
    tracing::error!(
        grace_secs = SHUTDOWN_GRACE.as_secs(),
        "agent did not stop after the signal; removing pipes and exiting"
    );

    let sentinel = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&teardown.sentinel)
        .and_then(|mut f| writeln!(f, "terminated due to user request; teardown forced"));
    if let Err(e) = sentinel {
        tracing::error!(error = %e, "could not write error file");
    }

    for path in &teardown.pipes {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed pipe"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove pipe"),
        }
    }
}
