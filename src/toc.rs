use crate::error::{AgentError, Result};
use crate::Oid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Byte range `[start_byte, end_byte)` of one table in the logical
/// (uncompressed) archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDataEntry {
    #[serde(rename = "startbyte")]
    pub start_byte: u64,
    #[serde(rename = "endbyte")]
    pub end_byte: u64,
}

impl SegmentDataEntry {
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }
}

/// Per-segment table of contents, persisted as YAML:
///
/// ```yaml
/// dataentries:
///   1:
///     startbyte: 0
///     endbyte: 18
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentToc {
    #[serde(rename = "dataentries", default)]
    pub data_entries: BTreeMap<Oid, SegmentDataEntry>,
}

impl SegmentToc {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::io(format!("Failed to read TOC {}", path.display()), e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let toc: SegmentToc = serde_yaml::from_str(text).map_err(|e| AgentError::ManifestFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toc.validate().map_err(|reason| AgentError::ManifestFormat {
            path: path.to_path_buf(),
            reason,
        })?;

        Ok(toc)
    }

    /// Ranges must be well formed and must not overlap once put in stream
    /// order. Gaps are allowed: a backup that skipped a failed table leaves one.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut prev: Option<(Oid, SegmentDataEntry)> = None;

        for (oid, entry) in self.in_stream_order() {
            if entry.start_byte > entry.end_byte {
                return Err(format!(
                    "oid {oid}: startbyte {} is past endbyte {}",
                    entry.start_byte, entry.end_byte
                ));
            }
            if let Some((prev_oid, prev_entry)) = prev {
                if entry.start_byte < prev_entry.end_byte {
                    return Err(format!(
                        "oid {oid} range [{}, {}) overlaps oid {prev_oid} range [{}, {})",
                        entry.start_byte, entry.end_byte, prev_entry.start_byte, prev_entry.end_byte
                    ));
                }
            }
            prev = Some((oid, entry));
        }

        Ok(())
    }

    pub fn add_entry(&mut self, oid: Oid, start_byte: u64, end_byte: u64) {
        self.data_entries.insert(oid, SegmentDataEntry { start_byte, end_byte });
    }

    pub fn get(&self, oid: Oid) -> Option<SegmentDataEntry> {
        self.data_entries.get(&oid).copied()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.data_entries.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.data_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_entries.is_empty()
    }

    /// Entries in the order their bytes appear in the archive. Oids are
    /// opaque keys, so ordering comes from the byte ranges, not the keys.
    pub fn in_stream_order(&self) -> Vec<(Oid, SegmentDataEntry)> {
        let mut entries: Vec<_> = self.data_entries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(oid, e)| (e.start_byte, e.end_byte, *oid));
        entries
    }

    pub fn end_of_stream(&self) -> u64 {
        self.data_entries.values().map(|e| e.end_byte).max().unwrap_or(0)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            AgentError::io("Failed to serialize TOC", std::io::Error::other(e))
        })
    }

    /// Write the TOC and drop write permission, so a finished backup's index
    /// can't be clobbered by a later run pointed at the same directory.
    pub fn write_read_only(&self, path: &Path) -> Result<()> {
        let text = self.to_yaml()?;
        let ctx = || format!("Failed to write TOC {}", path.display());

        std::fs::write(path, text).map_err(|e| AgentError::io(ctx(), e))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))
            .map_err(|e| AgentError::io(ctx(), e))?;
        Ok(())
    }
}
