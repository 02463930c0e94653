/// Shard a cluster id with the rolling 31-multiplier hash, reduced mod the
/// shard count at every step so the running value never overflows.
pub fn assigned_shard(cluster_id: &str, total_shards: i64) -> i64 {
    if total_shards <= 1 {
        return 0;
    }
    let mut hash: i64 = 0;
    for c in cluster_id.chars() {
        hash = (hash.wrapping_mul(31).wrapping_add(c as i64)) % total_shards;
    }
    hash
}

/// Pure shard-ownership decision; with one shard every cluster qualifies.
pub fn should_process(cluster_id: &str, shard_id: i64, total_shards: i64) -> bool {
    assigned_shard(cluster_id, total_shards) == shard_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        for id in ["c1", "c2", "prod-cluster-17", ""] {
            assert_eq!(assigned_shard(id, 5), assigned_shard(id, 5));
        }
    }

    #[test]
    fn test_single_shard_accepts_all() {
        for id in ["c1", "c2", "c3", "anything-at-all"] {
            assert!(should_process(id, 0, 1));
        }
    }

    #[test]
    fn test_union_covers_all_ids() {
        let total = 3;
        let ids = ["c1", "c2", "c3", "c4", "prod-a", "prod-b", "staging-x"];
        for id in ids {
            let owners: Vec<i64> = (0..total)
                .filter(|&shard| should_process(id, shard, total))
                .collect();
            assert_eq!(owners.len(), 1, "{id} owned by {owners:?}");
        }
    }

    #[test]
    fn test_shard_in_range() {
        for id in ["a", "bb", "ccc", "delta-9", "ω-cluster"] {
            let shard = assigned_shard(id, 7);
            assert!((0..7).contains(&shard));
        }
    }
}
