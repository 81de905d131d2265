//! Consensus invariants checked against whole simulated networks.
//!
//! - **Agreement**: every validator that accepts a block at a height accepts
//!   the same one, whatever order payloads arrive in and however often.
//! - **Progress**: with at most F validators offline the rest accept a block
//!   at every height.
//! - **View monotonicity**: a validator's view never decreases within a
//!   height.
//! - **Quorums**: any two quorums share at least F + 1 validators, and the
//!   primary rotation visits every validator.

#[cfg(test)]
mod tests {
    use {
        dbft::{
            config::DbftConfig,
            proposer::primary_index,
            quorum::{max_faulty, quorum},
            testing::{TestNetwork, TestTransaction},
            types::Block,
        },
        proptest::{prelude::*, sample::subsequence},
        rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng},
        std::collections::HashSet,
    };

    // ── Helpers ──

    fn make_config(anti_mev: bool) -> DbftConfig {
        DbftConfig {
            anti_mev_extension_enabling_height: if anti_mev { 0 } else { -1 },
            ..DbftConfig::default()
        }
    }

    fn make_network(n: usize, anti_mev: bool, tx_count: usize) -> TestNetwork {
        let mut net = TestNetwork::new(n, make_config(anti_mev));
        for i in 0..tx_count {
            net.add_transaction(TestTransaction::new(format!("tx-{i}").as_bytes()));
        }
        net
    }

    fn online(net: &TestNetwork) -> Vec<usize> {
        (0..net.nodes.len())
            .filter(|index| !net.offline.contains(index))
            .collect()
    }

    fn all_accepted(net: &TestNetwork) -> bool {
        online(net)
            .into_iter()
            .all(|index| net.nodes[index].context().block_sent())
    }

    /// Delivers payloads in a shuffled order, holding each one back for a
    /// round at most once and sometimes delivering it twice, until nothing
    /// is left in flight.
    fn deliver_shuffled(net: &mut TestNetwork, rng: &mut StdRng) {
        let mut held = Vec::new();
        for _ in 0..1_000 {
            let fresh = net.take_pending();
            if fresh.is_empty() && held.is_empty() {
                return;
            }
            let mut batch = std::mem::take(&mut held);
            for item in fresh {
                if rng.random_bool(0.25) {
                    batch.push(item.clone());
                }
                if rng.random_bool(1.0 / 3.0) {
                    held.push(item);
                } else {
                    batch.push(item);
                }
            }
            batch.shuffle(rng);
            for (from, payload) in &batch {
                net.deliver(*from, payload).unwrap();
            }
        }
        panic!("network did not settle");
    }

    fn views(net: &TestNetwork) -> Vec<u8> {
        net.nodes.iter().map(|n| n.context().view_number).collect()
    }

    fn assert_views_not_decreased(before: &[u8], after: &[u8]) -> Result<(), TestCaseError> {
        for (index, (b, a)) in before.iter().zip(after).enumerate() {
            prop_assert!(a >= b, "node {} went from view {} to view {}", index, b, a);
        }
        Ok(())
    }

    /// Drives the current height to acceptance on every online node, firing
    /// primaries' timers before backups'. Returns the number of timer rounds
    /// it took.
    fn run_height(net: &mut TestNetwork) -> Result<usize, TestCaseError> {
        let height = net.nodes[online(net)[0]].context().block_index;
        for round in 0..32 {
            let before = views(net);
            net.deliver_all().unwrap();
            if all_accepted(net) {
                return Ok(round);
            }

            let primaries: Vec<_> = online(net)
                .into_iter()
                .filter(|&index| {
                    let context = net.nodes[index].context();
                    context.is_primary() && !context.request_sent_or_received()
                })
                .collect();
            for &index in &primaries {
                net.fire_timer(index).unwrap();
            }
            net.deliver_all().unwrap();
            if all_accepted(net) {
                return Ok(round);
            }

            for index in online(net) {
                if !primaries.contains(&index) {
                    net.fire_timer(index).unwrap();
                }
            }
            net.deliver_all().unwrap();
            assert_views_not_decreased(&before, &views(net))?;
        }
        Err(TestCaseError::fail(format!(
            "height {height} not accepted with offline set {:?}",
            net.offline
        )))
    }

    fn network_with_offline() -> impl Strategy<Value = (usize, Vec<usize>)> {
        (4..=10usize).prop_flat_map(|n| {
            let indices: Vec<usize> = (0..n).collect();
            (Just(n), subsequence(indices, 0..=max_faulty(n)))
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 1. Agreement under arbitrary delivery order
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn agreement_under_reordering_and_duplication(
            n in 4..=7usize,
            tx_count in 0..4usize,
            anti_mev in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let mut net = make_network(n, anti_mev, tx_count);
            let mut rng = StdRng::seed_from_u64(seed);
            net.start_all().unwrap();
            deliver_shuffled(&mut net, &mut rng);

            let blocks = net.last_blocks();
            let first = blocks[0].expect("node 0 accepted a block");
            prop_assert_eq!(first.index(), 1);
            prop_assert_eq!(first.transactions().len(), tx_count);
            for (index, block) in blocks.iter().enumerate() {
                let block = block.expect("block accepted");
                prop_assert_eq!(block.hash(), first.hash(), "node {} disagrees", index);
                prop_assert_eq!(net.nodes[index].host().processed.len(), 1);
            }
            for node in &net.nodes {
                prop_assert!(node.evidence().evidence().is_empty());
                prop_assert_eq!(node.context().view_number, 0);
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 2. Progress with at most F validators offline
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn progress_with_f_offline(
            (n, offline) in network_with_offline(),
            anti_mev in any::<bool>(),
        ) {
            let mut net = make_network(n, anti_mev, 2);
            net.offline = offline.iter().copied().collect();
            let online_nodes = online(&net);
            net.start_all().unwrap();

            for height in 1..=3u32 {
                run_height(&mut net)?;
                let blocks = net.last_blocks();
                let first = blocks[online_nodes[0]].expect("block accepted");
                prop_assert_eq!(first.index(), height);
                for &index in &online_nodes {
                    let block = blocks[index].expect("block accepted");
                    prop_assert_eq!(block.hash(), first.hash(), "node {}", index);
                    prop_assert_eq!(net.nodes[index].host().processed.len(), height as usize);
                }
                // The accepting view's primary was online.
                let view = net.nodes[online_nodes[0]].context().view_number;
                prop_assert!(!net.offline.contains(&primary_index(height, view, n)));
                net.reset_accepted().unwrap();
            }
            for &index in &offline {
                prop_assert!(net.nodes[index].host().processed.is_empty());
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 3. Quorum arithmetic and primary rotation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn quorums_intersect_in_an_honest_validator(n in 1..=1_000usize) {
            let f = max_faulty(n);
            let m = quorum(n);
            prop_assert!(3 * f < n);
            prop_assert!(m <= n);
            // Two quorums overlap in 2m - n validators, more than f of them.
            prop_assert!(2 * m > n + f);
        }

        #[test]
        fn primary_is_in_range_and_moves_each_view(
            n in 2..=100usize,
            height in any::<u32>(),
            view in 0..u8::MAX,
        ) {
            let primary = primary_index(height, view, n);
            prop_assert!(primary < n);
            prop_assert_ne!(primary, primary_index(height, view + 1, n));
        }

        #[test]
        fn primary_rotation_visits_every_validator(
            n in 1..=100usize,
            height in any::<u32>(),
        ) {
            let visited: HashSet<usize> = (0..n)
                .map(|view| primary_index(height, view as u8, n))
                .collect();
            prop_assert_eq!(visited.len(), n);
        }
    }
}
