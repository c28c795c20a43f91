use crate::error::{AgentError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

/// Storage plugin configuration, as handed to every segment by the
/// orchestrator:
///
/// ```yaml
/// executablepath: $GPHOME/bin/s3_plugin
/// options:
///   bucket: backups
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "executablepath")]
    pub executable_path: PathBuf,
    /// Passed through to the plugin untouched; only the plugin reads them.
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
    /// Path of the config file itself; the plugin gets it as an argument.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl PluginConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AgentError::io(format!("Failed to read plugin config {}", path.display()), e)
        })?;
        let mut cfg: PluginConfig = serde_yaml::from_str(&text).map_err(|e| {
            AgentError::Config(format!("plugin config {}: {e}", path.display()))
        })?;

        let expanded = expand_env(&cfg.executable_path.to_string_lossy());
        cfg.executable_path = PathBuf::from(expanded);
        if !cfg.executable_path.is_absolute() {
            return Err(AgentError::Config(format!(
                "plugin executable {} is not an absolute path",
                cfg.executable_path.display()
            )));
        }

        cfg.config_path = path.to_path_buf();
        Ok(cfg)
    }

    /// `<executable> backup_data <config> <data-file>`; the archive is
    /// streamed into the plugin's stdin.
    pub fn start_backup(&self, data_file: &Path) -> Result<(ChildStdin, PluginProcess)> {
        let mut process = self.spawn("backup_data", data_file, Stdio::piped(), Stdio::null())?;
        let stdin = process
            .child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Plugin("plugin stdin was not captured".into()))?;
        Ok((stdin, process))
    }

    /// `<executable> restore_data <config> <data-file>`; the archive is read
    /// from the plugin's stdout.
    pub fn start_restore(&self, data_file: &Path) -> Result<(ChildStdout, PluginProcess)> {
        let mut process = self.spawn("restore_data", data_file, Stdio::null(), Stdio::piped())?;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Plugin("plugin stdout was not captured".into()))?;
        Ok((stdout, process))
    }

    fn spawn(
        &self,
        action: &'static str,
        data_file: &Path,
        stdin: Stdio,
        stdout: Stdio,
    ) -> Result<PluginProcess> {
        tracing::info!(
            plugin = %self.executable_path.display(),
            action,
            data_file = %data_file.display(),
            "starting storage plugin"
        );

        let mut child = Command::new(&self.executable_path)
            .arg(action)
            .arg(&self.config_path)
            .arg(data_file)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AgentError::Plugin(format!(
                    "failed to start {}: {e}",
                    self.executable_path.display()
                ))
            })?;

        // Drain stderr on the side so a chatty plugin never blocks on it.
        let stderr = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        Ok(PluginProcess {
            child,
            stderr,
            action,
        })
    }
}

pub struct PluginProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
    action: &'static str,
}

impl PluginProcess {
    /// Wait for the plugin to exit; a non-zero status is an error carrying
    /// whatever the plugin printed to stderr.
    pub fn wait(mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .map_err(|e| AgentError::Plugin(format!("{} wait failed: {e}", self.action)))?;

        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if status.success() {
            if !stderr.is_empty() {
                tracing::warn!(action = self.action, stderr, "plugin wrote to stderr");
            }
            return Ok(());
        }

        Err(AgentError::Plugin(format!(
            "{} exited with {status}: {stderr}",
            self.action
        )))
    }

    /// The run is being abandoned; don't let the plugin finish a partial
    /// upload or keep streaming into a closed pipe.
    pub fn kill(mut self) {
        if let Err(e) = self.child.kill() {
            tracing::warn!(action = self.action, error = %e, "failed to kill storage plugin");
        }
        let _ = self.child.wait();
    }
}

/// Expand `$NAME` and `${NAME}`; unset variables expand to nothing.
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&n) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("plugin.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &Path, exe: &Path) -> PluginConfig {
        let path = dir.join("plugin_config.yaml");
        std::fs::write(
            &path,
            format!("executablepath: {}\noptions:\n  bucket: b\n", exe.display()),
        )
        .unwrap();
        PluginConfig::load(&path).unwrap()
    }

    #[test]
    fn expands_environment() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env("$HOME/bin/p"), format!("{home}/bin/p"));
        assert_eq!(expand_env("${HOME}/p"), format!("{home}/p"));
        assert_eq!(expand_env("/usr/bin/$"), "/usr/bin/$");
        assert_eq!(expand_env("/opt/${SEGMENT_AGENT_SURELY_UNSET}x"), "/opt/x");
    }

    #[test]
    fn relative_executable_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.yaml");
        std::fs::write(&path, "executablepath: plugins/s3\n").unwrap();
        assert!(matches!(PluginConfig::load(&path), Err(AgentError::Config(_))));
    }

    #[test]
    fn backup_streams_into_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "cat > \"$3\"");
        let cfg = config(dir.path(), &exe);
        assert_eq!(cfg.options.get("bucket").and_then(|v| v.as_str()), Some("b"));

        let dest = dir.path().join("dest");
        let (mut stdin, process) = cfg.start_backup(&dest).unwrap();
        stdin.write_all(b"here is some data\n").unwrap();
        drop(stdin);
        process.wait().unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"here is some data\n");
    }

    #[test]
    fn restore_reads_from_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "cat \"$3\"");
        let cfg = config(dir.path(), &exe);

        let src = dir.path().join("src");
        std::fs::write(&src, b"abc").unwrap();
        let (mut stdout, process) = cfg.start_restore(&src).unwrap();
        let mut got = Vec::new();
        stdout.read_to_end(&mut got).unwrap();
        process.wait().unwrap();
        assert_eq!(got, b"abc");
    }

    #[test]
    fn failing_plugin_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "echo 'bucket not found' >&2; exit 3");
        let cfg = config(dir.path(), &exe);

        let (stdout, process) = cfg.start_restore(&dir.path().join("x")).unwrap();
        drop(stdout);
        let err = process.wait().unwrap_err().to_string();
        assert!(err.contains("bucket not found"), "{err}");
    }
}
