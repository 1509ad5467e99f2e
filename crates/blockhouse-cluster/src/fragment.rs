//! Fragments and Epochs
//!
//! A fragment maps a half-open key range `[key_start, key_end)` to its owning
//! LTC, the database id on that LTC, and the StoCs replicating its WAL. An
//! epoch is one complete, sorted fragment map; the fragment map file carries
//! several epochs so that planned reconfigurations ship with the initial
//! deployment.
//!
//! ## Fragment map file
//!
//! Plain text. A line containing `config` opens a new epoch; every other
//! line is `key_start,key_end,ltc_server_id,dbid[,log_replica_stoc_id]*`.
//! Ranges are half-open and non-decreasing within an epoch.

use std::path::Path;

use blockhouse_core::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub key_start: u64,
    pub key_end: u64,
}

impl KeyRange {
    pub fn contains(&self, key: u64) -> bool {
        key >= self.key_start && key < self.key_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub range: KeyRange,
    pub ltc_server_id: u32,
    pub dbid: u32,
    pub log_replica_stoc_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub epoch_id: u32,
    /// Sorted by `range.key_start`.
    pub fragments: Vec<Fragment>,
}

impl Epoch {
    /// Binary search for the fragment owning `key`. Keys past the last
    /// fragment are a routing error, not a panic.
    pub fn home_fragment(&self, key: u64) -> Result<&Fragment> {
        let last = self
            .fragments
            .last()
            .ok_or_else(|| Error::InvalidRequest("epoch has no fragments".to_string()))?;
        if key >= last.range.key_end {
            return Err(Error::InvalidRequest(format!(
                "key {key} beyond configured ranges (end {})",
                last.range.key_end
            )));
        }
        let idx = self
            .fragments
            .partition_point(|f| f.range.key_end <= key);
        let frag = &self.fragments[idx];
        if !frag.range.contains(key) {
            return Err(Error::InvalidRequest(format!(
                "key {key} falls in a gap of the fragment map"
            )));
        }
        Ok(frag)
    }

    /// Fragments homed on `server_id`, indexed by dbid. Sizes the per-node
    /// database array.
    pub fn db_fragments_for(&self, server_id: u32) -> Vec<&Fragment> {
        let mut frags: Vec<&Fragment> = self
            .fragments
            .iter()
            .filter(|f| f.ltc_server_id == server_id)
            .collect();
        frags.sort_by_key(|f| f.dbid);
        frags.dedup_by_key(|f| f.dbid);
        frags
    }
}

/// Parse a fragment map file into epochs, ids assigned in file order.
pub fn read_fragment_map(path: &Path) -> Result<Vec<Epoch>> {
    let text = std::fs::read_to_string(path)?;
    parse_fragment_map(&text)
}

pub fn parse_fragment_map(text: &str) -> Result<Vec<Epoch>> {
    let mut epochs: Vec<Epoch> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("config") {
            epochs.push(Epoch {
                epoch_id: epochs.len() as u32,
                fragments: Vec::new(),
            });
            continue;
        }
        let epoch = epochs.last_mut().ok_or_else(|| {
            Error::InvalidRequest(format!("line {}: fragment before any config", lineno + 1))
        })?;
        let tokens: Vec<&str> = line.split(',').collect();
        if tokens.len() < 4 {
            return Err(Error::InvalidRequest(format!(
                "line {}: expected at least 4 fields",
                lineno + 1
            )));
        }
        let parse = |s: &str| -> Result<u64> {
            s.trim()
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("line {}: bad number {s:?}", lineno + 1)))
        };
        let fragment = Fragment {
            range: KeyRange {
                key_start: parse(tokens[0])?,
                key_end: parse(tokens[1])?,
            },
            ltc_server_id: parse(tokens[2])? as u32,
            dbid: parse(tokens[3])? as u32,
            log_replica_stoc_ids: tokens[4..]
                .iter()
                .map(|t| parse(t).map(|v| v as u32))
                .collect::<Result<_>>()?,
        };
        if let Some(prev) = epoch.fragments.last() {
            if fragment.range.key_start < prev.range.key_start {
                return Err(Error::InvalidRequest(format!(
                    "line {}: fragment ranges must be non-decreasing",
                    lineno + 1
                )));
            }
        }
        epoch.fragments.push(fragment);
    }
    if epochs.is_empty() {
        return Err(Error::InvalidRequest("fragment map has no config section".to_string()));
    }
    Ok(epochs)
}

/// Assign `num_replicas` distinct log-replica StoCs to every fragment,
/// round-robin over `stoc_servers`, never placing a replica on the local
/// node.
pub fn compute_log_replica_locations(
    epochs: &mut [Epoch],
    stoc_servers: &[u32],
    my_server_id: u32,
    num_replicas: usize,
) -> Result<()> {
    let eligible = stoc_servers.iter().filter(|&&s| s != my_server_id).count();
    if num_replicas > eligible {
        return Err(Error::InvalidRequest(format!(
            "{num_replicas} log replicas requested but only {eligible} remote StoCs"
        )));
    }
    let mut cursor = 0usize;
    for epoch in epochs.iter_mut() {
        for fragment in epoch.fragments.iter_mut() {
            fragment.log_replica_stoc_ids.clear();
            while fragment.log_replica_stoc_ids.len() < num_replicas {
                let candidate = stoc_servers[cursor % stoc_servers.len()];
                cursor += 1;
                if candidate == my_server_id {
                    continue;
                }
                if !fragment.log_replica_stoc_ids.contains(&candidate) {
                    fragment.log_replica_stoc_ids.push(candidate);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = "\
config
0,100,0,0,2
100,200,1,0,3
200,300,0,1,2
config
0,150,1,0
150,300,0,0
";

    #[test]
    fn test_parse_two_epochs() {
        let epochs = parse_fragment_map(MAP).unwrap();
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0].epoch_id, 0);
        assert_eq!(epochs[0].fragments.len(), 3);
        assert_eq!(epochs[1].fragments.len(), 2);
        assert_eq!(epochs[0].fragments[1].ltc_server_id, 1);
        assert_eq!(epochs[0].fragments[1].log_replica_stoc_ids, vec![3]);
    }

    #[test]
    fn test_home_fragment_lookup() {
        let epochs = parse_fragment_map(MAP).unwrap();
        let e = &epochs[0];
        assert_eq!(e.home_fragment(0).unwrap().dbid, 0);
        assert_eq!(e.home_fragment(99).unwrap().ltc_server_id, 0);
        // Half-open: 100 belongs to the second fragment.
        assert_eq!(e.home_fragment(100).unwrap().ltc_server_id, 1);
        assert_eq!(e.home_fragment(299).unwrap().dbid, 1);
        assert!(e.home_fragment(300).is_err());
    }

    #[test]
    fn test_db_fragments_for_server() {
        let epochs = parse_fragment_map(MAP).unwrap();
        let frags = epochs[0].db_fragments_for(0);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].dbid, 0);
        assert_eq!(frags[1].dbid, 1);
    }

    #[test]
    fn test_fragment_before_config_rejected() {
        assert!(parse_fragment_map("0,10,0,0\n").is_err());
    }

    #[test]
    fn test_log_replica_placement_skips_local() {
        let mut epochs = parse_fragment_map(MAP).unwrap();
        compute_log_replica_locations(&mut epochs, &[2, 3, 4], 3, 2).unwrap();
        for epoch in &epochs {
            for fragment in &epoch.fragments {
                assert_eq!(fragment.log_replica_stoc_ids.len(), 2);
                assert!(!fragment.log_replica_stoc_ids.contains(&3));
                let mut uniq = fragment.log_replica_stoc_ids.clone();
                uniq.dedup();
                assert_eq!(uniq.len(), 2, "replicas must be distinct");
            }
        }
    }

    #[test]
    fn test_too_many_replicas_rejected() {
        let mut epochs = parse_fragment_map(MAP).unwrap();
        assert!(compute_log_replica_locations(&mut epochs, &[2, 3], 2, 2).is_err());
    }
}
