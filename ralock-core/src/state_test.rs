#[cfg(test)]
mod tests {
    use crate::error::CoordinatorError;
    use crate::scheduler::DeferReason;
    use crate::state::{CoordinatorState, Step};
    use crate::types::{Message, NodeId, Outbound, Phase, RequestRecord, Timestamp};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn id(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn ts(secs: f64) -> Timestamp {
        Timestamp::from_secs(secs).unwrap()
    }

    fn node_with_peers(node: u32, peers: &[u32]) -> CoordinatorState {
        CoordinatorState::new(id(node), peers.iter().map(|&p| id(p)).collect())
    }

    fn decode(raw: &str) -> Message {
        raw.parse().unwrap()
    }

    /// Puts `state` into the critical section by feeding it one grant per peer.
    fn enter(state: &mut CoordinatorState, at: f64) {
        state.begin_request(ts(at)).unwrap();
        let peers = state.peers().to_vec();
        for peer in peers {
            state.on_grant(peer);
        }
        assert!(state.in_critical_section());
    }

    // =========================================================================
    // Inbound REQUEST handling
    // =========================================================================

    #[test]
    fn test_idle_node_grants_immediately() {
        let mut node1 = node_with_peers(1, &[2, 3, 4]);

        let step = node1.on_message(decode("REQ:3:12345.0"));

        assert_eq!(step, Step::Granted(Outbound::grant(id(3), id(1))));
        if let Step::Granted(grant) = step {
            assert_eq!(grant.message.encode(), "GRANT:1");
        }
        assert_eq!(node1.deferred().len(), 0);
    }

    #[test]
    fn test_idle_node_grants_unknown_requester() {
        let mut node = node_with_peers(1, &[2]);

        let step = node.on_message(decode("REQ:7:100.0"));

        assert_eq!(step, Step::Granted(Outbound::grant(id(7), id(1))));
        assert_eq!(node.deferred().len(), 0);
        assert_eq!(node.phase(), Phase::Idle);
    }

    #[test]
    fn test_own_older_claim_defers_requester() {
        let mut node1 = node_with_peers(1, &[2, 3, 4]);
        node1.begin_request(ts(12340.0)).unwrap();

        let step = node1.on_message(decode("REQ:3:12345.0"));

        assert!(matches!(
            step,
            Step::Deferred(verdict) if verdict.reason == Some(DeferReason::OwnClaimFirst)
        ));
        let deferred: Vec<RequestRecord> = node1.deferred().copied().collect();
        assert_eq!(deferred, vec![RequestRecord::new(id(3), ts(12345.0))]);
    }

    #[test]
    fn test_own_younger_claim_grants_requester() {
        let mut node1 = node_with_peers(1, &[2, 3]);
        node1.begin_request(ts(12350.0)).unwrap();

        let step = node1.on_message(decode("REQ:3:12345.0"));

        assert_eq!(step, Step::Granted(Outbound::grant(id(3), id(1))));
        assert_eq!(node1.deferred().len(), 0);
    }

    #[test]
    fn test_in_critical_section_defers_even_older_requests() {
        let mut node = node_with_peers(1, &[2]);
        enter(&mut node, 500.0);

        let step = node.on_request(RequestRecord::new(id(2), ts(1.0)));

        assert!(matches!(
            step,
            Step::Deferred(verdict) if verdict.reason == Some(DeferReason::InCriticalSection)
        ));
    }

    // =========================================================================
    // Own request cycle
    // =========================================================================

    #[test]
    fn test_begin_request_broadcasts_to_every_peer() {
        let mut node = node_with_peers(2, &[1, 3, 4]);

        let start = node.begin_request(ts(77.5)).unwrap();

        let targets: Vec<u32> = start.broadcast.iter().map(|o| o.to.get()).collect();
        assert_eq!(targets, vec![1, 3, 4]);
        for outbound in &start.broadcast {
            assert_eq!(outbound.message.encode(), "REQ:2:77.5");
        }
        assert!(!start.entered);
        assert!(start.flushed.is_empty());
        assert_eq!(node.phase(), Phase::Requesting);
        assert_eq!(node.own_request(), Some(ts(77.5)));
        assert_eq!(node.grants_received(), 0);
    }

    #[test]
    fn test_begin_request_rejects_overlapping_cycle() {
        let mut node = node_with_peers(1, &[2]);
        node.begin_request(ts(1.0)).unwrap();

        let err = node.begin_request(ts(2.0)).unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::AlreadyActive { phase: Phase::Requesting }
        ));
        assert_eq!(node.own_request(), Some(ts(1.0)));
    }

    #[test]
    fn test_quorum_requires_every_peer() {
        let mut node = node_with_peers(1, &[2, 3, 4]);
        node.begin_request(ts(10.0)).unwrap();

        assert_eq!(node.on_grant(id(2)), Step::Counted { received: 1, needed: 3 });
        assert_eq!(node.on_grant(id(3)), Step::Counted { received: 2, needed: 3 });
        assert!(!node.in_critical_section());
        assert_eq!(node.on_grant(id(4)), Step::Entered);
        assert!(node.in_critical_section());
    }

    #[test]
    fn test_duplicate_grants_are_counted() {
        let mut node = node_with_peers(1, &[2, 3]);
        node.begin_request(ts(10.0)).unwrap();

        node.on_grant(id(2));
        assert_eq!(node.on_grant(id(2)), Step::Entered);
    }

    #[test]
    fn test_grant_without_request_is_ignored() {
        let mut node = node_with_peers(1, &[2]);

        assert_eq!(node.on_message(decode("GRANT:2")), Step::Ignored);
        assert_eq!(node.grants_received(), 0);
        assert_eq!(node.phase(), Phase::Idle);
    }

    #[test]
    fn test_single_node_cluster_enters_immediately() {
        let mut node = node_with_peers(1, &[]);

        let start = node.begin_request(ts(1.0)).unwrap();

        assert!(start.entered);
        assert!(start.broadcast.is_empty());
        assert!(node.in_critical_section());
    }

    #[test]
    fn test_release_drains_queue_in_arrival_order() {
        let mut a = node_with_peers(1, &[2, 3]);
        enter(&mut a, 100.0);

        // B then C, with C holding the older timestamp: arrival order wins
        a.on_request(RequestRecord::new(id(2), ts(105.0)));
        a.on_request(RequestRecord::new(id(3), ts(101.0)));

        let grants = a.release();

        assert_eq!(
            grants,
            vec![Outbound::grant(id(2), id(1)), Outbound::grant(id(3), id(1))]
        );
        assert_eq!(a.deferred().len(), 0);
        assert_eq!(a.phase(), Phase::Idle);
        assert_eq!(a.own_request(), None);
        assert_eq!(a.grants_received(), 0);
    }

    #[test]
    fn test_node_is_idle_again_after_release() {
        let mut node = node_with_peers(1, &[2]);
        enter(&mut node, 100.0);
        node.release();

        // Any request is now granted, whatever its timestamp
        let step = node.on_request(RequestRecord::new(id(2), ts(1000.0)));
        assert!(matches!(step, Step::Granted(_)));
    }

    #[test]
    fn test_withdraw_while_requesting_grants_deferred() {
        let mut node = node_with_peers(1, &[2, 3]);
        node.begin_request(ts(10.0)).unwrap();
        node.on_grant(id(2));
        node.on_request(RequestRecord::new(id(3), ts(20.0)));

        let released = node.withdraw().unwrap();

        assert_eq!(released, vec![Outbound::grant(id(3), id(1))]);
        assert_eq!(node.phase(), Phase::Idle);
        assert_eq!(node.own_request(), None);
        // Node 3 still owes a grant for the withdrawn request
        assert_eq!(node.stale_grants_owed(id(3)), 1);
        assert_eq!(node.stale_grants_owed(id(2)), 0);
        assert_eq!(node.on_grant(id(3)), Step::Stale);
        assert_eq!(node.on_grant(id(3)), Step::Ignored);
    }

    #[test]
    fn test_withdraw_skips_peers_the_request_never_reached() {
        let mut node = node_with_peers(1, &[2, 3]);
        node.begin_request(ts(10.0)).unwrap();
        node.mark_unreached(id(3));

        node.withdraw().unwrap();

        assert_eq!(node.stale_grants_owed(id(2)), 1);
        assert_eq!(node.stale_grants_owed(id(3)), 0);
        assert!(node.snapshot().stale_grants_owed.get(&id(3)).is_none());
    }

    #[test]
    fn test_stale_grant_is_not_counted_toward_next_request() {
        let mut node = node_with_peers(1, &[2, 3]);
        node.begin_request(ts(10.0)).unwrap();
        node.withdraw().unwrap();

        node.begin_request(ts(20.0)).unwrap();

        assert_eq!(node.on_grant(id(2)), Step::Stale);
        assert_eq!(node.on_grant(id(3)), Step::Stale);
        assert_eq!(node.grants_received(), 0);
        assert_eq!(node.on_grant(id(2)), Step::Counted { received: 1, needed: 2 });
        assert_eq!(node.on_grant(id(3)), Step::Entered);
    }

    #[test]
    fn test_mark_unreached_outside_request_is_ignored() {
        let mut node = node_with_peers(1, &[2]);
        node.mark_unreached(id(2));

        node.begin_request(ts(1.0)).unwrap();
        node.withdraw().unwrap();

        assert_eq!(node.stale_grants_owed(id(2)), 1);
    }

    #[test]
    fn test_withdraw_after_quorum_is_refused() {
        let mut node = node_with_peers(1, &[2]);
        enter(&mut node, 10.0);

        assert!(node.withdraw().is_none());
        assert!(node.in_critical_section());
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut node = node_with_peers(4, &[1, 2]);
        node.begin_request(ts(3.0)).unwrap();
        node.on_grant(id(1));
        node.on_request(RequestRecord::new(id(2), ts(9.0)));

        let snapshot = node.snapshot();

        assert_eq!(snapshot.node, id(4));
        assert_eq!(snapshot.phase, Phase::Requesting);
        assert!(!snapshot.in_critical_section);
        assert_eq!(snapshot.own_request, Some(ts(3.0)));
        assert_eq!(snapshot.grants_received, 1);
        assert_eq!(snapshot.grants_needed, 2);
        assert_eq!(snapshot.deferred.len(), 1);
    }

    // =========================================================================
    // Whole-cluster simulation
    // =========================================================================

    /// Every node of a cluster plus the messages travelling between them.
    /// Delivery order is chosen by the test.
    struct Sim {
        nodes: BTreeMap<NodeId, CoordinatorState>,
        in_flight: Vec<Outbound>,
        clock: f64,
        entries: Vec<NodeId>,
    }

    impl Sim {
        fn new(ids: &[u32]) -> Self {
            let nodes = ids
                .iter()
                .map(|&n| {
                    let peers = ids.iter().filter(|&&p| p != n).map(|&p| id(p)).collect();
                    (id(n), CoordinatorState::new(id(n), peers))
                })
                .collect();
            Self {
                nodes,
                in_flight: Vec::new(),
                clock: 0.0,
                entries: Vec::new(),
            }
        }

        fn request(&mut self, node: NodeId) -> bool {
            self.clock += 1.0;
            self.request_at(node, self.clock)
        }

        fn request_at(&mut self, node: NodeId, at: f64) -> bool {
            let state = self.nodes.get_mut(&node).unwrap();
            match state.begin_request(ts(at)) {
                Ok(start) => {
                    self.in_flight.extend(start.flushed);
                    self.in_flight.extend(start.broadcast);
                    if start.entered {
                        self.entries.push(node);
                    }
                    true
                }
                Err(_) => false,
            }
        }

        fn deliver(&mut self, index: usize) {
            let outbound = self.in_flight.remove(index);
            let state = self.nodes.get_mut(&outbound.to).unwrap();
            match state.on_message(outbound.message) {
                Step::Granted(grant) => self.in_flight.push(grant),
                Step::Entered => self.entries.push(outbound.to),
                _ => {}
            }
        }

        fn deliver_all(&mut self) {
            while !self.in_flight.is_empty() {
                self.deliver(0);
            }
        }

        fn withdraw(&mut self, node: NodeId) -> bool {
            let state = self.nodes.get_mut(&node).unwrap();
            if state.phase() != Phase::Requesting {
                return false;
            }
            let released = state.withdraw().unwrap();
            self.in_flight.extend(released);
            true
        }

        fn release(&mut self, node: NodeId) {
            let grants = self.nodes.get_mut(&node).unwrap().release();
            self.in_flight.extend(grants);
        }

        fn holders(&self) -> Vec<NodeId> {
            self.nodes
                .values()
                .filter(|state| state.in_critical_section())
                .map(|state| state.node())
                .collect()
        }

        fn all_idle(&self) -> bool {
            self.nodes.values().all(|state| state.phase() == Phase::Idle)
        }

        fn owes_nothing(&self) -> bool {
            self.nodes
                .values()
                .all(|state| state.snapshot().stale_grants_owed.is_empty())
        }
    }

    #[test]
    fn test_lone_requester_reaches_quorum() {
        let mut sim = Sim::new(&[1, 2, 3, 4]);

        assert!(sim.request(id(1)));
        sim.deliver_all();

        assert_eq!(sim.entries, vec![id(1)]);
        assert_eq!(sim.holders(), vec![id(1)]);
    }

    #[test]
    fn test_equal_timestamps_lower_node_enters_first() {
        let mut sim = Sim::new(&[2, 3, 5]);

        // Node 3 holds the resource while 2 and 5 ask at the same instant
        sim.request_at(id(3), 50.0);
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(3)]);

        sim.request_at(id(5), 100.0);
        sim.request_at(id(2), 100.0);
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(3)]);

        sim.release(id(3));
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(2)]);

        sim.release(id(2));
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(5)]);

        assert_eq!(sim.entries, vec![id(3), id(2), id(5)]);
    }

    #[test]
    fn test_third_node_grants_both_tied_requests_when_idle() {
        let mut observer = node_with_peers(3, &[2, 5]);

        let first = observer.on_request(RequestRecord::new(id(5), ts(100.0)));
        let second = observer.on_request(RequestRecord::new(id(2), ts(100.0)));

        assert_eq!(first, Step::Granted(Outbound::grant(id(5), id(3))));
        assert_eq!(second, Step::Granted(Outbound::grant(id(2), id(3))));
    }

    #[test]
    fn test_deferred_requesters_each_get_one_grant() {
        let mut sim = Sim::new(&[1, 2, 3]);
        sim.request(id(1));
        sim.deliver_all();

        sim.request(id(2));
        sim.request(id(3));
        sim.deliver_all();
        assert!(sim.in_flight.is_empty());

        sim.release(id(1));
        let grants: Vec<(NodeId, Message)> =
            sim.in_flight.iter().map(|o| (o.to, o.message)).collect();
        assert_eq!(
            grants,
            vec![
                (id(2), Message::Grant { granter: id(1) }),
                (id(3), Message::Grant { granter: id(1) }),
            ]
        );
    }

    #[test]
    fn test_late_grant_after_withdraw_does_not_admit_second_holder() {
        let mut sim = Sim::new(&[1, 2, 3]);

        sim.request_at(id(3), 1.0);
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(3)]);

        // Node 2 grants node 1, node 3 defers it; node 1 then gives up
        sim.request_at(id(1), 2.0);
        sim.deliver_all();
        assert!(sim.withdraw(id(1)));

        // Node 3's grant for the withdrawn request is held back
        sim.release(id(3));
        assert_eq!(sim.in_flight.len(), 1);
        let late = sim.in_flight.remove(0);
        assert_eq!(late.message, Message::Grant { granter: id(3) });

        sim.request_at(id(3), 5.0);
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(3)]);

        sim.request_at(id(1), 10.0);
        sim.deliver_all();
        sim.in_flight.push(late);
        sim.deliver_all();

        assert_eq!(sim.holders(), vec![id(3)]);
        let node1 = &sim.nodes[&id(1)];
        assert_eq!(node1.phase(), Phase::Requesting);
        assert_eq!(node1.grants_received(), 1);

        sim.release(id(3));
        sim.deliver_all();
        assert_eq!(sim.holders(), vec![id(1)]);
        assert_eq!(sim.entries, vec![id(3), id(3), id(1)]);
    }

    proptest! {
        /// Arbitrary interleavings of requests, deliveries, releases and
        /// withdrawals never put two nodes in the critical section, and every
        /// request not withdrawn is eventually served once the network drains.
        #[test]
        fn prop_mutual_exclusion_holds(
            steps in prop::collection::vec((0u8..4, any::<u16>()), 1..300)
        ) {
            let ids = [1, 2, 3, 4];
            let mut sim = Sim::new(&ids);
            let mut requests = 0;
            let mut withdrawn = 0;

            for (action, pick) in steps {
                match action {
                    0 => {
                        let node = id(ids[pick as usize % ids.len()]);
                        if sim.request(node) {
                            requests += 1;
                        }
                    }
                    1 if !sim.in_flight.is_empty() => {
                        let index = pick as usize % sim.in_flight.len();
                        sim.deliver(index);
                    }
                    2 => {
                        if let Some(&holder) = sim.holders().first() {
                            sim.release(holder);
                        }
                    }
                    3 => {
                        let node = id(ids[pick as usize % ids.len()]);
                        if sim.withdraw(node) {
                            withdrawn += 1;
                        }
                    }
                    _ => {}
                }
                prop_assert!(sim.holders().len() <= 1, "holders: {:?}", sim.holders());
            }

            // Drain: deliver everything, release whoever holds, repeat
            for _ in 0..(requests + 1) * 8 {
                sim.deliver_all();
                match sim.holders().first() {
                    Some(&holder) => sim.release(holder),
                    None => break,
                }
                prop_assert!(sim.holders().len() <= 1);
            }

            prop_assert!(sim.all_idle());
            prop_assert!(sim.in_flight.is_empty());
            prop_assert!(sim.owes_nothing());
            prop_assert_eq!(sim.entries.len() + withdrawn, requests);
        }
    }
}
