use crate::error::{AgentError, Result};
use crate::toc::SegmentToc;
use crate::Oid;
use std::collections::HashSet;
use std::path::Path;

/// Read the ordered list of table oids this agent is responsible for.
///
/// One oid per line. Blank lines are ignored; anything else that is not an
/// unsigned integer, or an oid listed twice, rejects the whole file.
pub fn load_oid_list(path: &Path) -> Result<Vec<Oid>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AgentError::io(format!("Failed to read oid list {}", path.display()), e))?;
    parse_oid_list(&text, path)
}

pub fn parse_oid_list(text: &str, path: &Path) -> Result<Vec<Oid>> {
    let mut oids = Vec::new();
    let mut seen = HashSet::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let oid: Oid = line.parse().map_err(|_| AgentError::ManifestFormat {
            path: path.to_path_buf(),
            reason: format!("line {}: '{}' is not a table oid", lineno + 1, line),
        })?;

        if !seen.insert(oid) {
            return Err(AgentError::ManifestFormat {
                path: path.to_path_buf(),
                reason: format!("line {}: oid {} listed more than once", lineno + 1, oid),
            });
        }
        oids.push(oid);
    }

    Ok(oids)
}

/// Every oid a restore is asked for must have a byte range in the TOC.
pub fn ensure_toc_entries(toc: &SegmentToc, oids: &[Oid]) -> Result<()> {
    match oids.iter().find(|oid| !toc.contains(**oid)) {
        Some(&oid) => Err(AgentError::MissingEntry { oid }),
        None => Ok(()),
    }
}
