//! Storage Selector
//!
//! Picks the `G` distinct StoCs that receive one SSTable's scatter groups.
//! The load metric for the power-of-k and stats policies is the number of
//! requests currently outstanding against each peer. Peers inside a declared
//! failure window are never candidates, which is also how a retry after
//! `PeerFailed` lands on a fresh set.

use rand::seq::SliceRandom;
use rand::Rng;

use blockhouse_cluster::{ClusterConfig, ScatterPolicy};
use blockhouse_core::{Error, Result};

use crate::client::BlockClient;

pub struct StorageSelector<'a> {
    client: &'a BlockClient,
    config: &'a ClusterConfig,
}

impl<'a> StorageSelector<'a> {
    pub fn new(client: &'a BlockClient, config: &'a ClusterConfig) -> Self {
        Self { client, config }
    }

    fn candidates(&self) -> Vec<u32> {
        self.config
            .options
            .stoc_servers
            .iter()
            .copied()
            .filter(|&s| !self.client.is_failed(s))
            .collect()
    }

    /// Choose `n` distinct StoCs under `policy`.
    pub fn select_storage_servers(
        &self,
        rng: &mut impl Rng,
        policy: ScatterPolicy,
        n: usize,
    ) -> Result<Vec<u32>> {
        let mut candidates = self.candidates();
        if candidates.len() < n {
            return Err(Error::InvalidRequest(format!(
                "{n} scatter targets requested, only {} live StoCs",
                candidates.len()
            )));
        }
        match policy {
            ScatterPolicy::Random => {
                candidates.shuffle(rng);
                candidates.truncate(n);
                Ok(candidates)
            }
            ScatterPolicy::PowerOfTwo => self.power_of_k(rng, candidates, n, 2),
            ScatterPolicy::PowerOfThree => self.power_of_k(rng, candidates, n, 3),
            ScatterPolicy::ScatterStats => {
                // Deterministic spread over the least-loaded peers.
                candidates.sort_by_key(|&s| (self.client.pending_load(s), s));
                candidates.truncate(n);
                Ok(candidates)
            }
        }
    }

    /// For each slot, sample `k` of the remaining candidates and keep the
    /// least loaded.
    fn power_of_k(
        &self,
        rng: &mut impl Rng,
        mut candidates: Vec<u32>,
        n: usize,
        k: usize,
    ) -> Result<Vec<u32>> {
        let mut chosen = Vec::with_capacity(n);
        while chosen.len() < n {
            let sample = candidates
                .choose_multiple(rng, k.min(candidates.len()))
                .copied()
                .collect::<Vec<u32>>();
            let winner = sample
                .into_iter()
                .min_by_key(|&s| (self.client.pending_load(s), s))
                .expect("non-empty sample");
            candidates.retain(|&s| s != winner);
            chosen.push(winner);
        }
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Transport;
    use async_trait::async_trait;
    use blockhouse_cluster::{fragment::parse_fragment_map, ClusterOptions};
    use bytes::Bytes;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    struct NeverTransport;

    #[async_trait]
    impl Transport for NeverTransport {
        async fn call(&self, server_id: u32, _frame: Bytes) -> blockhouse_core::Result<Bytes> {
            Err(Error::transport(server_id, "unused"))
        }
    }

    fn setup(stocs: Vec<u32>) -> (BlockClient, Arc<ClusterConfig>) {
        let options: ClusterOptions = serde_json::from_value(serde_json::json!({
            "my_server_id": 0,
            "ltc_servers": [0],
            "stoc_servers": stocs,
            "stoc_files_path": "/tmp/s",
            "db_path": "/tmp/d",
        }))
        .unwrap();
        let epochs = parse_fragment_map("config\n0,100,0,0\n").unwrap();
        let config = ClusterConfig::new(options, epochs).unwrap();
        (BlockClient::new(0, Arc::new(NeverTransport)), config)
    }

    #[test]
    fn test_random_returns_distinct() {
        let (client, config) = setup(vec![1, 2, 3, 4, 5]);
        let selector = StorageSelector::new(&client, &config);
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut chosen = selector
                .select_storage_servers(&mut rng, ScatterPolicy::Random, 3)
                .unwrap();
            assert_eq!(chosen.len(), 3);
            chosen.sort_unstable();
            chosen.dedup();
            assert_eq!(chosen.len(), 3);
        }
    }

    #[test]
    fn test_not_enough_candidates() {
        let (client, config) = setup(vec![1, 2]);
        let selector = StorageSelector::new(&client, &config);
        let mut rng = SmallRng::seed_from_u64(7);
        assert!(selector
            .select_storage_servers(&mut rng, ScatterPolicy::Random, 3)
            .is_err());
    }

    #[test]
    fn test_failed_peer_excluded() {
        let (client, config) = setup(vec![1, 2, 3]);
        client.mark_failed(2, std::time::Duration::from_secs(60));
        let selector = StorageSelector::new(&client, &config);
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..10 {
            let chosen = selector
                .select_storage_servers(&mut rng, ScatterPolicy::Random, 2)
                .unwrap();
            assert!(!chosen.contains(&2));
        }
        // Width 3 is now unsatisfiable.
        assert!(selector
            .select_storage_servers(&mut rng, ScatterPolicy::Random, 3)
            .is_err());
    }

    #[test]
    fn test_scatter_stats_prefers_idle_peers() {
        let (client, config) = setup(vec![1, 2, 3, 4]);
        let selector = StorageSelector::new(&client, &config);
        let mut rng = SmallRng::seed_from_u64(3);
        // All idle: deterministic lowest ids first.
        let chosen = selector
            .select_storage_servers(&mut rng, ScatterPolicy::ScatterStats, 2)
            .unwrap();
        assert_eq!(chosen, vec![1, 2]);
    }

    #[test]
    fn test_power_of_two_distinct() {
        let (client, config) = setup(vec![1, 2, 3, 4, 5, 6]);
        let selector = StorageSelector::new(&client, &config);
        let mut rng = SmallRng::seed_from_u64(11);
        let mut chosen = selector
            .select_storage_servers(&mut rng, ScatterPolicy::PowerOfTwo, 4)
            .unwrap();
        chosen.sort_unstable();
        chosen.dedup();
        assert_eq!(chosen.len(), 4);
    }
}
