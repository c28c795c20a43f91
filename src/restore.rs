use crate::backup::CHUNK_SIZE;
use crate::compression::ArchiveSource;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::failure::{CancelToken, ErrorPolicy, FailureController};
use crate::manifest;
use crate::pipes::{PipeManager, PipeTransport, WriteOpen};
use crate::toc::{SegmentDataEntry, SegmentToc};
use crate::{Oid, RunSummary};
use std::collections::HashSet;
use std::io::{self, Read, Write};

/// Restore agent: read the archive once, front to back, and hand each
/// requested table's byte range to its pipe.
pub fn run<T: PipeTransport>(
    cfg: &AgentConfig,
    transport: T,
    failures: &mut FailureController,
) -> Result<RunSummary> {
    let toc = SegmentToc::load(&cfg.toc_file)?;
    let oids = manifest::load_oid_list(&cfg.oid_file)?;
    manifest::ensure_toc_entries(&toc, &oids)?;
    tracing::info!(
        tables = oids.len(),
        toc_entries = toc.len(),
        codec = ?cfg.compression.codec,
        "restore agent starting"
    );

    let mut pipes = PipeManager::new(transport, &cfg.pipe_prefix);
    let result = execute(cfg, &toc, &oids, &mut pipes, failures);
    pipes.remove_all();
    result
}

fn execute<T: PipeTransport>(
    cfg: &AgentConfig,
    toc: &SegmentToc,
    oids: &[Oid],
    pipes: &mut PipeManager<T>,
    failures: &mut FailureController,
) -> Result<RunSummary> {
    pipes.create_all(oids)?;
    let codec = cfg.compression.codec;

    match &cfg.plugin {
        Some(plugin) => {
            let (stdout, process) = plugin.start_restore(&cfg.data_file)?;
            let restored = ArchiveSource::new(stdout, codec)
                .and_then(|source| restore_tables(toc, oids, pipes, source, failures));
            match restored {
                Ok(summary) => {
                    process.wait()?;
                    Ok(summary)
                }
                Err(e) => {
                    process.kill();
                    Err(e)
                }
            }
        }
        None => {
            let source = ArchiveSource::open_file(&cfg.data_file, codec)?;
            restore_tables(toc, oids, pipes, source, failures)
        }
    }
}

/// The table loop. Walks every TOC entry in stream order, requested or
/// not, because the decompressor can only move forward.
pub fn restore_tables<T: PipeTransport, R: Read>(
    toc: &SegmentToc,
    oids: &[Oid],
    pipes: &mut PipeManager<T>,
    mut source: ArchiveSource<R>,
    failures: &mut FailureController,
) -> Result<RunSummary> {
    let wanted: HashSet<Oid> = oids.iter().copied().collect();
    let honor_skip_markers = failures.policy() == ErrorPolicy::Continue;
    let mut restored = 0usize;
    let mut bytes = 0u64;

    for (oid, entry) in toc.in_stream_order() {
        failures.check_cancelled()?;

        if !wanted.contains(&oid) {
            let discarded = source.skip_to(entry.end_byte)?;
            tracing::debug!(oid, discarded, "table not requested, range discarded");
            continue;
        }

        // Whatever is left of a failed table, or a gap, comes off here.
        let discarded = source.skip_to(entry.start_byte)?;
        tracing::debug!(
            oid,
            start = entry.start_byte,
            end = entry.end_byte,
            discarded,
            "restoring table"
        );

        match restore_table(oid, entry, pipes, &mut source, failures.token(), honor_skip_markers) {
            Ok(Some(n)) => {
                restored += 1;
                bytes += n;
                tracing::info!(oid, bytes = n, "table restored");
            }
            Ok(None) => {}
            Err(e) => failures.table_failed(oid, e)?,
        }

        pipes.remove(oid)?;
    }

    let trailing = source.finish()?;
    if trailing > 0 {
        tracing::warn!(trailing, "archive has data past the last TOC entry");
    }

    Ok(RunSummary {
        tables: restored,
        bytes,
        skipped: failures.skipped().to_vec(),
    })
}

/// `Ok(None)` when the orchestrator skipped the table.
fn restore_table<T: PipeTransport, R: Read>(
    oid: Oid,
    entry: SegmentDataEntry,
    pipes: &mut PipeManager<T>,
    source: &mut ArchiveSource<R>,
    token: &CancelToken,
    honor_skip_markers: bool,
) -> Result<Option<u64>> {
    let mut writer = match pipes.open_write(oid, token, honor_skip_markers)? {
        WriteOpen::Opened(w) => w,
        WriteOpen::Skipped => return Ok(None),
    };
    tracing::debug!(oid, "reader connected to pipe");

    let n = fill_pipe(oid, source, &mut writer, entry.len(), token)?;
    writer
        .flush()
        .map_err(|source| AgentError::PipeIo { oid, source })?;
    // dropping the handle closes the write end: COPY sees EOF
    Ok(Some(n))
}

/// Copy exactly `len` bytes from the archive into the pipe.
fn fill_pipe<R: Read, W: Write>(
    oid: Oid,
    source: &mut ArchiveSource<R>,
    pipe: &mut W,
    len: u64,
    token: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;

    while remaining > 0 {
        token.check()?;

        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = match source.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(AgentError::compression(
                    format!("reading table {oid}"),
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("archive ended {remaining} bytes before the end of the table"),
                    ),
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AgentError::compression(format!("reading table {oid}"), e)),
        };

        pipe.write_all(&buf[..n])
            .map_err(|source| AgentError::PipeIo { oid, source })?;
        remaining -= n as u64;
    }

    Ok(len)
}
