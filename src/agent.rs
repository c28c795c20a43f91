use crate::config::{AgentConfig, Mode};
use crate::error::Result;
use crate::failure::{CancelToken, FailureController};
use crate::pipes::PipeTransport;
use crate::{backup, restore, Oid};

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tables fully transferred.
    pub tables: usize,
    /// Uncompressed bytes moved through the pipes.
    pub bytes: u64,
    /// Tables given up on under `--on-error-continue`.
    pub skipped: Vec<Oid>,
}

/// Run one agent invocation to completion.
///
/// A fatal error leaves the error sentinel behind before it is returned;
/// every pipe the run created is gone by the time this returns, whatever
/// the outcome.
pub fn run<T: PipeTransport>(
    cfg: &AgentConfig,
    transport: T,
    token: CancelToken,
) -> Result<RunSummary> {
    let span = tracing::info_span!("segment", content = cfg.content);
    let _guard = span.enter();

    let mut failures = FailureController::new(cfg.on_error, cfg.sentinel_path(), token);
    let result = match cfg.mode {
        Mode::Backup => backup::run(cfg, transport, &mut failures),
        Mode::Restore => restore::run(cfg, transport, &mut failures),
    };

    match &result {
        Ok(summary) => tracing::info!(
            mode = ?cfg.mode,
            tables = summary.tables,
            bytes = summary.bytes,
            skipped = summary.skipped.len(),
            "agent finished"
        ),
        Err(e) => failures.run_aborted(e),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{Codec, CompressionSettings};
    use crate::error::AgentError;
    use crate::failure::ErrorPolicy;
    use crate::memory_pipes::MemoryTransport;
    use crate::pipes::pipe_path;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::thread;

    const ROW: &[u8] = b"here is some data\n";

    fn config(dir: &Path, mode: Mode, codec: Codec) -> AgentConfig {
        AgentConfig {
            mode,
            toc_file: dir.join("toc.yaml"),
            oid_file: dir.join("oids"),
            pipe_prefix: dir.join("pipe"),
            content: 0,
            data_file: dir.join("data"),
            compression: CompressionSettings::new(codec, 1).unwrap(),
            on_error: ErrorPolicy::Abort,
            plugin: None,
        }
    }

    /// Plays COPY TO for every table once its pipe shows up.
    fn copy_out(transport: &MemoryTransport, prefix: &Path, tables: Vec<(Oid, Vec<u8>)>) -> thread::JoinHandle<()> {
        let transport = transport.clone();
        let prefix = prefix.to_path_buf();
        thread::spawn(move || {
            for (oid, data) in tables {
                let path = pipe_path(&prefix, oid);
                let mut w = loop {
                    if let Some(w) = transport.peer_writer(&path) {
                        break w;
                    }
                    thread::yield_now();
                };
                w.write_all(&data).unwrap();
            }
        })
    }

    /// Plays COPY FROM, collecting what each table received.
    fn copy_in(transport: &MemoryTransport, prefix: &Path, oids: Vec<Oid>) -> thread::JoinHandle<Vec<Vec<u8>>> {
        let transport = transport.clone();
        let prefix = prefix.to_path_buf();
        thread::spawn(move || {
            oids.into_iter()
                .map(|oid| {
                    let path = pipe_path(&prefix, oid);
                    let mut r = loop {
                        if let Some(r) = transport.peer_reader(&path) {
                            break r;
                        }
                        thread::yield_now();
                    };
                    let mut out = Vec::new();
                    r.read_to_end(&mut out).unwrap();
                    out
                })
                .collect()
        })
    }

    #[test]
    fn backup_then_selective_restore() {
        for codec in [Codec::None, Codec::Gzip, Codec::Zstd] {
            let dir = tempfile::tempdir().unwrap();
            let tables: Vec<(Oid, Vec<u8>)> = vec![
                (1, ROW.to_vec()),
                (2, vec![b'x'; 1 << 17]),
                (3, ROW.repeat(5)),
            ];
            std::fs::write(dir.path().join("oids"), "1\n2\n3\n").unwrap();

            let cfg = config(dir.path(), Mode::Backup, codec);
            let transport = MemoryTransport::new();
            let peer = copy_out(&transport, &cfg.pipe_prefix, tables.clone());
            let summary = run(&cfg, transport.clone(), CancelToken::new()).unwrap();
            peer.join().unwrap();
            assert_eq!(summary.tables, 3);
            assert_eq!(summary.bytes, (18 + (1 << 17) + 90) as u64);
            assert!(transport.is_empty());

            std::fs::write(dir.path().join("oids"), "3\n1\n").unwrap();
            let cfg = config(dir.path(), Mode::Restore, codec);
            let peer = copy_in(&transport, &cfg.pipe_prefix, vec![1, 3]);
            let summary = run(&cfg, transport.clone(), CancelToken::new()).unwrap();
            let got = peer.join().unwrap();

            assert_eq!(got[0], tables[0].1, "{codec:?}");
            assert_eq!(got[1], tables[2].1, "{codec:?}");
            assert_eq!(summary.tables, 2);
            assert!(transport.is_empty());
            assert!(!cfg.sentinel_path().exists());
        }
    }

    #[test]
    fn archive_can_go_through_a_storage_plugin() {
        use crate::plugin::PluginConfig;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let exe = dir.path().join("plugin.sh");
        std::fs::write(
            &exe,
            format!(
                "#!/bin/sh\ncase \"$1\" in\n  backup_data) cat > {0}/\"$(basename \"$3\")\" ;;\n  restore_data) cat {0}/\"$(basename \"$3\")\" ;;\nesac\n",
                store.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let plugin_cfg = dir.path().join("plugin.yaml");
        std::fs::write(&plugin_cfg, format!("executablepath: {}\n", exe.display())).unwrap();
        let plugin = PluginConfig::load(&plugin_cfg).unwrap();

        std::fs::write(dir.path().join("oids"), "5\n6\n").unwrap();
        let mut cfg = config(dir.path(), Mode::Backup, Codec::Zstd);
        cfg.plugin = Some(plugin.clone());
        let transport = MemoryTransport::new();
        let peer = copy_out(
            &transport,
            &cfg.pipe_prefix,
            vec![(5, ROW.to_vec()), (6, ROW.repeat(2))],
        );
        run(&cfg, transport.clone(), CancelToken::new()).unwrap();
        peer.join().unwrap();
        assert!(store.join("data").is_file());
        assert!(!cfg.data_file.exists());

        let mut cfg = config(dir.path(), Mode::Restore, Codec::Zstd);
        cfg.plugin = Some(plugin);
        let peer = copy_in(&transport, &cfg.pipe_prefix, vec![5, 6]);
        let summary = run(&cfg, transport.clone(), CancelToken::new()).unwrap();
        assert_eq!(peer.join().unwrap(), vec![ROW.to_vec(), ROW.repeat(2)]);
        assert_eq!(summary.bytes, 54);
    }

    #[test]
    fn restore_rejects_oids_missing_from_toc_before_creating_pipes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("toc.yaml"),
            "dataentries:\n  1:\n    startbyte: 0\n    endbyte: 18\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("oids"), "1\n4\n").unwrap();
        std::fs::write(dir.path().join("data"), ROW).unwrap();

        let cfg = config(dir.path(), Mode::Restore, Codec::None);
        let transport = MemoryTransport::new();
        let err = run(&cfg, transport.clone(), CancelToken::new()).unwrap_err();
        assert!(matches!(err, AgentError::MissingEntry { oid: 4 }));
        assert!(transport.is_empty());
        assert!(cfg.sentinel_path().is_file());
    }

    #[test]
    fn interrupted_backup_cleans_up_and_leaves_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oids"), "1\n2\n").unwrap();
        let cfg = config(dir.path(), Mode::Backup, Codec::Gzip);

        let token = CancelToken::new();
        token.cancel();
        let transport = MemoryTransport::new();
        let err = run(&cfg, transport.clone(), token).unwrap_err();

        assert!(matches!(err, AgentError::Interrupted));
        assert_eq!(err.exit_code(), 2);
        assert!(transport.is_empty());
        assert!(cfg.sentinel_path().is_file());
        assert!(!cfg.toc_file.exists());
    }
}
