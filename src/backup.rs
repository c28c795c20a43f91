use crate::compression::ArchiveSink;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::failure::{CancelToken, FailureController};
use crate::manifest;
use crate::pipes::{PipeManager, PipeTransport};
use crate::toc::SegmentToc;
use crate::{Oid, RunSummary};
use std::io::{self, Read, Write};

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Backup agent: drain every table's pipe, in oid-list order, into the
/// archive and write the TOC describing where each table landed.
pub fn run<T: PipeTransport>(
    cfg: &AgentConfig,
    transport: T,
    failures: &mut FailureController,
) -> Result<RunSummary> {
    // Input problems surface before a single pipe exists.
    let oids = manifest::load_oid_list(&cfg.oid_file)?;
    tracing::info!(tables = oids.len(), "backup agent starting");

    let mut pipes = PipeManager::new(transport, &cfg.pipe_prefix);
    let result = execute(cfg, &oids, &mut pipes, failures);
    pipes.remove_all();
    result
}

fn execute<T: PipeTransport>(
    cfg: &AgentConfig,
    oids: &[Oid],
    pipes: &mut PipeManager<T>,
    failures: &mut FailureController,
) -> Result<RunSummary> {
    pipes.create_all(oids)?;

    let (toc, bytes) = match &cfg.plugin {
        Some(plugin) => {
            let (stdin, process) = plugin.start_backup(&cfg.data_file)?;
            let streamed = ArchiveSink::new(stdin, cfg.compression).and_then(|mut sink| {
                let toc = backup_tables(oids, pipes, &mut sink, failures)?;
                let bytes = sink.committed();
                // closing stdin is the plugin's end of input
                drop(sink.finish()?);
                Ok((toc, bytes))
            });
            match streamed {
                Ok(done) => {
                    tracing::info!("waiting for storage plugin to finish upload");
                    process.wait()?;
                    done
                }
                Err(e) => {
                    process.kill();
                    return Err(e);
                }
            }
        }
        None => {
            let mut sink = ArchiveSink::create(&cfg.data_file, cfg.compression)?;
            let toc = backup_tables(oids, pipes, &mut sink, failures)?;
            let bytes = sink.committed();
            let file = sink.finish()?;
            file.sync_all()
                .map_err(|e| AgentError::compression("syncing data file", e))?;
            (toc, bytes)
        }
    };

    toc.write_read_only(&cfg.toc_file)?;
    tracing::info!(toc = %cfg.toc_file.display(), "finished writing segment TOC");

    Ok(RunSummary {
        tables: toc.len(),
        bytes,
        skipped: failures.skipped().to_vec(),
    })
}

/// The table loop. Byte ranges come straight from the sink's logical
/// counter, so they stay right even when a failed table left a partial
/// chunk behind.
pub fn backup_tables<T: PipeTransport, W: Write>(
    oids: &[Oid],
    pipes: &mut PipeManager<T>,
    sink: &mut ArchiveSink<W>,
    failures: &mut FailureController,
) -> Result<SegmentToc> {
    let mut toc = SegmentToc::default();

    for &oid in oids {
        failures.check_cancelled()?;

        tracing::debug!(oid, "opening pipe");
        let mut reader = pipes.open_read(oid)?;
        // woken by the signal watcher rather than by COPY
        failures.check_cancelled()?;

        let start = sink.committed();
        tracing::debug!(oid, start, "backing up table");
        let copied = drain_pipe(oid, &mut reader, sink, failures.token());
        drop(reader);

        match copied {
            Ok(bytes) => {
                let end = sink.committed();
                debug_assert_eq!(end - start, bytes);
                toc.add_entry(oid, start, end);
                tracing::info!(oid, bytes, start, end, "table backed up");
            }
            Err(e) => failures.table_failed(oid, e)?,
        }

        pipes.remove(oid)?;
    }

    Ok(toc)
}

/// Copy one table until COPY closes its end. Reads whatever the pipe has
/// rather than waiting for fixed-size blocks, so the producer never stalls
/// on a full pipe buffer.
fn drain_pipe<R: Read, W: Write>(
    oid: Oid,
    reader: &mut R,
    sink: &mut ArchiveSink<W>,
    token: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        token.check()?;

        let n = match reader.read(&mut buf) {
            // an EOF after cancellation may be the signal watcher's doing
            Ok(0) => return token.check().map(|_| total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(AgentError::PipeIo { oid, source }),
        };

        sink.write_all(&buf[..n])
            .map_err(|e| AgentError::compression(format!("writing table {oid}"), e))?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{ArchiveSource, Codec, CompressionSettings};
    use crate::failure::ErrorPolicy;
    use crate::memory_pipes::MemoryTransport;
    use std::path::{Path, PathBuf};
    use std::thread;

    const ROW: &[u8] = b"here is some data\n";

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::ConnectionReset))
        }
    }

    /// Memory pipes where one table's COPY dies after `cut` bytes.
    struct DyingCopy {
        inner: MemoryTransport,
        dying: PathBuf,
        cut: usize,
    }

    struct CutOff<R> {
        inner: R,
        left: Option<usize>,
    }

    impl<R: Read> Read for CutOff<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.left {
                None => self.inner.read(buf),
                Some(0) => Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                Some(left) => {
                    let n = buf.len().min(left);
                    let n = self.inner.read(&mut buf[..n])?;
                    self.left = Some(left - n);
                    Ok(n)
                }
            }
        }
    }

    impl PipeTransport for DyingCopy {
        type Reader = CutOff<<MemoryTransport as PipeTransport>::Reader>;
        type Writer = <MemoryTransport as PipeTransport>::Writer;

        fn create(&self, path: &Path) -> io::Result<()> {
            self.inner.create(path)
        }

        fn open_read(&self, path: &Path) -> io::Result<Self::Reader> {
            Ok(CutOff {
                inner: self.inner.open_read(path)?,
                left: (path == self.dying).then_some(self.cut),
            })
        }

        fn try_open_write(&self, path: &Path) -> io::Result<Option<Self::Writer>> {
            self.inner.try_open_write(path)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.inner.remove(path)
        }
    }

    fn controller(dir: &Path, policy: ErrorPolicy) -> FailureController {
        FailureController::new(policy, dir.join("pipe_error"), CancelToken::new())
    }

    fn feed(transport: &MemoryTransport, pipes: &PipeManager<MemoryTransport>, oid: Oid, data: Vec<u8>) -> thread::JoinHandle<()> {
        let mut w = transport.peer_writer(&pipes.path_for(oid)).unwrap();
        thread::spawn(move || {
            w.write_all(&data).unwrap();
        })
    }

    #[test]
    fn fixture_tables_produce_contiguous_toc() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let mut pipes = PipeManager::new(transport.clone(), &dir.path().join("pipe"));
        let oids = [1, 2, 3];
        pipes.create_all(&oids).unwrap();

        let feeders: Vec<_> = oids
            .iter()
            .map(|&oid| feed(&transport, &pipes, oid, ROW.to_vec()))
            .collect();

        let mut sink = ArchiveSink::new(Vec::new(), CompressionSettings::none()).unwrap();
        let mut fc = controller(dir.path(), ErrorPolicy::Abort);
        let toc = backup_tables(&oids, &mut pipes, &mut sink, &mut fc).unwrap();
        feeders.into_iter().for_each(|h| h.join().unwrap());

        assert_eq!(toc.get(1).unwrap().start_byte, 0);
        assert_eq!(toc.get(1).unwrap().end_byte, 18);
        assert_eq!(toc.get(2).unwrap().start_byte, 18);
        assert_eq!(toc.get(3).unwrap().end_byte, 54);
        assert_eq!(sink.finish().unwrap(), ROW.repeat(3));
        assert!(transport.is_empty(), "every pipe is removed after its table");
    }

    #[test]
    fn ranges_tile_the_stream_in_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let mut pipes = PipeManager::new(transport.clone(), &dir.path().join("pipe"));
        // non-contiguous, unsorted keys
        let oids = [40_007, 12, 9_000, 77];
        let sizes = [1usize, 0, 200_000, 33];
        pipes.create_all(&oids).unwrap();

        let feeders: Vec<_> = oids
            .iter()
            .zip(sizes)
            .map(|(&oid, n)| feed(&transport, &pipes, oid, vec![oid as u8; n]))
            .collect();

        let settings = CompressionSettings::new(Codec::Zstd, 1).unwrap();
        let mut sink = ArchiveSink::new(Vec::new(), settings).unwrap();
        let mut fc = controller(dir.path(), ErrorPolicy::Abort);
        let toc = backup_tables(&oids, &mut pipes, &mut sink, &mut fc).unwrap();
        feeders.into_iter().for_each(|h| h.join().unwrap());

        let order: Vec<Oid> = toc.in_stream_order().iter().map(|(o, _)| *o).collect();
        assert_eq!(order, oids);

        let mut expected_start = 0;
        for (oid, n) in oids.iter().zip(sizes) {
            let e = toc.get(*oid).unwrap();
            assert_eq!(e.start_byte, expected_start);
            assert_eq!(e.len(), n as u64);
            expected_start = e.end_byte;
        }

        let archive = sink.finish().unwrap();
        let mut src = ArchiveSource::new(&archive[..], Codec::Zstd).unwrap();
        let mut all = Vec::new();
        src.read_to_end(&mut all).unwrap();
        assert_eq!(all.len() as u64, expected_start);
    }

    #[test]
    fn pipe_error_aborts_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ArchiveSink::new(Vec::new(), CompressionSettings::none()).unwrap();
        let token = CancelToken::new();

        let err = drain_pipe(5, &mut FailingReader, &mut sink, &token).unwrap_err();
        assert!(matches!(err, AgentError::PipeIo { oid: 5, .. }));

        let mut fc = controller(dir.path(), ErrorPolicy::Abort);
        assert!(fc.table_failed(5, err).is_err());
    }

    #[test]
    fn cancelled_token_stops_the_copy() {
        let mut sink = ArchiveSink::new(Vec::new(), CompressionSettings::none()).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = drain_pipe(1, &mut &ROW[..], &mut sink, &token).unwrap_err();
        assert!(matches!(err, AgentError::Interrupted));
        assert_eq!(sink.committed(), 0);
    }

    #[test]
    fn cancellation_between_tables_leaves_later_pipes_for_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let mut pipes = PipeManager::new(transport.clone(), &dir.path().join("pipe"));
        let oids = [1, 2, 3];
        pipes.create_all(&oids).unwrap();

        let token = CancelToken::new();
        let mut fc = FailureController::new(ErrorPolicy::Continue, dir.path().join("e"), token.clone());

        // table 1 arrives, then the signal lands while table 2 is streaming
        let mut w1 = transport.peer_writer(&pipes.path_for(1)).unwrap();
        w1.write_all(ROW).unwrap();
        drop(w1);
        let mut w2 = transport.peer_writer(&pipes.path_for(2)).unwrap();
        let signaller = {
            let token = token.clone();
            thread::spawn(move || {
                w2.write_all(ROW).unwrap();
                token.cancel();
                // COPY gets killed too
                drop(w2);
            })
        };

        let mut sink = ArchiveSink::new(Vec::new(), CompressionSettings::none()).unwrap();
        let err = backup_tables(&oids, &mut pipes, &mut sink, &mut fc).unwrap_err();
        signaller.join().unwrap();
        assert!(matches!(err, AgentError::Interrupted));

        assert_eq!(pipes.outstanding(), vec![2, 3]);
        pipes.remove_all();
        assert!(transport.is_empty());
    }

    #[test]
    fn continue_policy_skips_a_table_whose_copy_dies() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("pipe");
        let memory = MemoryTransport::new();
        let transport = DyingCopy {
            inner: memory.clone(),
            dying: crate::pipes::pipe_path(&prefix, 2),
            cut: 40,
        };
        let mut pipes = PipeManager::new(transport, &prefix);
        let oids = [1, 2, 3];
        pipes.create_all(&oids).unwrap();

        let payloads = [ROW.to_vec(), vec![b'x'; 100], ROW.to_vec()];
        let feeders: Vec<_> = oids
            .iter()
            .zip(payloads)
            .map(|(&oid, data)| {
                let mut w = memory.peer_writer(&pipes.path_for(oid)).unwrap();
                // the agent hangs up on table 2, so its write may fail
                thread::spawn(move || drop(w.write_all(&data)))
            })
            .collect();

        let mut sink = ArchiveSink::new(Vec::new(), CompressionSettings::none()).unwrap();
        let mut fc = controller(dir.path(), ErrorPolicy::Continue);
        let toc = backup_tables(&oids, &mut pipes, &mut sink, &mut fc).unwrap();
        feeders.into_iter().for_each(|h| h.join().unwrap());

        let first = toc.get(1).unwrap();
        assert_eq!((first.start_byte, first.end_byte), (0, 18));
        assert!(toc.get(2).is_none());
        // the partial 40 bytes stay in the stream as a gap
        let third = toc.get(3).unwrap();
        assert_eq!((third.start_byte, third.end_byte), (58, 76));

        assert_eq!(fc.skipped(), &[2]);
        assert!(fc.sentinel().exists());
        assert!(memory.is_empty(), "the failed table's pipe is removed too");

        let mut expected = ROW.to_vec();
        expected.extend_from_slice(&[b'x'; 40]);
        expected.extend_from_slice(ROW);
        assert_eq!(sink.finish().unwrap(), expected);
    }
}
