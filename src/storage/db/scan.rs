use serde_json::Value;

use super::index::{decode_index_key, encode_index_scan_key};
use crate::storage::btree::Scan;
use crate::types::Result;

/// Options for scanning the main map or a secondary index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Only keys (secondary keys when scanning an index) with this prefix.
    pub prefix: String,
    /// Start at this primary key.
    pub start_key: Option<String>,
    /// Start at this secondary key. Index scans only.
    pub start_secondary_key: Option<String>,
    /// Skip the entry exactly at the start position.
    pub start_exclusive: bool,
    /// Stop after this many entries.
    pub limit: Option<usize>,
    /// Scan this index instead of the main map.
    pub index_name: Option<String>,
}

impl ScanOptions {
    /// Main map entries under `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Entries of the named index.
    pub fn index(name: impl Into<String>) -> Self {
        Self {
            index_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Starts at `key`.
    pub fn start(mut self, key: impl Into<String>, exclusive: bool) -> Self {
        self.start_key = Some(key.into());
        self.start_exclusive = exclusive;
        self
    }

    /// Starts an index scan at `secondary`.
    pub fn start_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.start_secondary_key = Some(secondary.into());
        self
    }

    /// Caps the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One scan result.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanItem {
    /// Primary key.
    pub key: String,
    /// Secondary key, for index scans.
    pub secondary_key: Option<String>,
    /// Stored value.
    pub value: Value,
}

/// Map key the scan starts from.
pub(crate) fn start_key(opts: &ScanOptions) -> Result<String> {
    if opts.index_name.is_none() {
        return Ok(match &opts.start_key {
            Some(start) if *start > opts.prefix => start.clone(),
            _ => opts.prefix.clone(),
        });
    }
    match &opts.start_secondary_key {
        Some(secondary) if *secondary >= opts.prefix => {
            encode_index_scan_key(secondary, opts.start_key.as_deref())
        }
        _ => encode_index_scan_key(&opts.prefix, None),
    }
}

/// Applies prefix, exclusivity and limit to a raw map scan.
pub(crate) fn collect(scan: Scan<'_>, opts: &ScanOptions) -> Result<Vec<ScanItem>> {
    let mut out = Vec::new();
    let limit = opts.limit.unwrap_or(usize::MAX);
    for entry in scan {
        if out.len() >= limit {
            break;
        }
        let (key, value) = entry?;
        let item = if opts.index_name.is_some() {
            let (secondary, primary) = decode_index_key(&key)?;
            if !secondary.starts_with(&opts.prefix) {
                break;
            }
            if opts.start_exclusive
                && opts.start_secondary_key.as_deref() == Some(secondary)
                && opts
                    .start_key
                    .as_deref()
                    .map_or(true, |start| start == primary)
            {
                continue;
            }
            ScanItem {
                key: primary.to_string(),
                secondary_key: Some(secondary.to_string()),
                value,
            }
        } else {
            if !key.starts_with(&opts.prefix) {
                break;
            }
            if opts.start_exclusive && opts.start_key.as_deref() == Some(key.as_str()) {
                continue;
            }
            ScanItem {
                key,
                secondary_key: None,
                value,
            }
        };
        out.push(item);
    }
    Ok(out)
}
