use crate::Oid;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("malformed {}: {reason}", path.display())]
    ManifestFormat { path: PathBuf, reason: String },

    #[error("no TOC entry for table with oid {oid}")]
    MissingEntry { oid: Oid },

    #[error("pipe {}", path.display())]
    Pipe {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("data transfer failed for table with oid {oid}")]
    PipeIo {
        oid: Oid,
        #[source]
        source: io::Error,
    },

    #[error("archive stream failed while {context}")]
    Compression {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("storage plugin: {0}")]
    Plugin(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("terminated due to user request")]
    Interrupted,
}

impl AgentError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        AgentError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn compression(context: impl Into<String>, source: io::Error) -> Self {
        AgentError::Compression {
            context: context.into(),
            source,
        }
    }

    /// Only a single table's transfer failure may be contained by
    /// `--on-error-continue`; everything else ends the run.
    pub fn is_table_local(&self) -> bool {
        matches!(self, AgentError::PipeIo { .. })
    }

    /// The message followed by every underlying cause, for places that
    /// don't go through anyhow: log fields and the error sentinel.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            out.push_str(": ");
            out.push_str(&e.to_string());
            cause = e.source();
        }
        out
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Interrupted => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_is_printed_once() {
        let err = AgentError::Pipe {
            path: PathBuf::from("/seg/pipe_1"),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "File exists"),
        };
        assert_eq!(err.to_string(), "pipe /seg/pipe_1");
        assert_eq!(err.report(), "pipe /seg/pipe_1: File exists");

        let chained = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chained.matches("File exists").count(), 1, "{chained}");
    }
}
