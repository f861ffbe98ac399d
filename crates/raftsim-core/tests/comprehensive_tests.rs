//! # comprehensive raftsim-core tests
//!
//! why: verify the node state machine in isolation, without timers or a network
//! relations: tests raftsim-core only; the engine crate covers timing and delivery
//! what: initialization, quorum, election, vote rule, replication, commit, fault transitions

use raftsim_core::{
    grants_vote, majority, AppendOutcome, ClusterNode, LogEntry, LogMatching, LogPosition,
    RaftMessage, Role,
};

fn node(id: &str) -> ClusterNode {
    ClusterNode::new(id, "c1", 0)
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_has_empty_state() {
        let n = node("node-1");
        assert_eq!(n.role, Role::Follower);
        assert_eq!(n.current_term, 0);
        assert_eq!(n.voted_for, None);
        assert!(n.log.is_empty());
        assert_eq!(n.commit_index, None);
        assert_eq!(n.last_applied, None);
        assert_eq!(n.votes_received, 0);
        assert!(n.is_alive);
        assert!(!n.is_partitioned);
    }

    #[test]
    fn snapshot_uses_observer_field_names() {
        let n = node("node-1");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["nodeId"], "node-1");
        assert_eq!(json["clusterId"], "c1");
        assert_eq!(json["role"], "follower");
        assert_eq!(json["currentTerm"], 0);
        assert_eq!(json["votedFor"], serde_json::Value::Null);
        assert_eq!(json["isAlive"], true);
        assert!(json["log"].as_array().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn majority_for_each_alive_count() {
        for alive in 0..=9usize {
            assert_eq!(majority(alive), alive / 2 + 1);
        }
    }

    #[test]
    fn candidate_wins_exactly_at_threshold() {
        let mut n = node("node-1");
        n.start_election();
        assert!(!n.has_majority(2));
        assert!(n.handle_vote_response(1, true));
        assert!(n.has_majority(2));
        assert!(!n.has_majority(3));
    }

    #[test]
    fn followers_never_have_majority() {
        let mut n = node("node-1");
        n.votes_received = 10;
        assert!(!n.has_majority(1));
    }
}

// =============================================================================
// SECTION 3: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn start_election_becomes_candidate() {
        let mut n = node("node-1");
        n.start_election();

        assert_eq!(n.role, Role::Candidate);
        assert_eq!(n.current_term, 1);
        assert_eq!(n.voted_for.as_deref(), Some("node-1"));
        assert_eq!(n.votes_received, 1);
    }

    #[test]
    fn start_election_increments_term() {
        let mut n = node("node-1");
        n.current_term = 5;
        n.start_election();
        assert_eq!(n.current_term, 6);
    }

    #[test]
    fn vote_request_carries_last_log_position() {
        let mut n = node("node-1");
        n.current_term = 1;
        n.append_command("a");
        n.current_term = 2;
        n.append_command("b");

        match n.start_election() {
            RaftMessage::VoteRequest {
                last_log_index,
                last_log_term,
            } => {
                assert_eq!(last_log_index, Some(1));
                assert_eq!(last_log_term, 2);
            }
            other => panic!("expected VoteRequest, got {other:?}"),
        }
    }

    #[test]
    fn empty_log_vote_request() {
        let mut n = node("node-1");
        assert_eq!(
            n.start_election(),
            RaftMessage::VoteRequest {
                last_log_index: None,
                last_log_term: 0
            }
        );
    }

    #[test]
    fn rejected_votes_dont_count() {
        let mut n = node("node-1");
        n.start_election();
        assert!(!n.handle_vote_response(1, false));
        assert_eq!(n.votes_received, 1);
    }

    #[test]
    fn stale_vote_response_ignored() {
        let mut n = node("node-1");
        n.start_election(); // term 1
        n.start_election(); // term 2
        assert!(!n.handle_vote_response(1, true));
        assert_eq!(n.votes_received, 1);
    }

    #[test]
    fn only_candidate_counts_votes() {
        let mut n = node("node-1");
        assert!(!n.handle_vote_response(0, true));

        n.start_election();
        n.become_leader(10);
        assert!(!n.handle_vote_response(1, true));
        assert_eq!(n.role, Role::Leader);
        assert_eq!(n.last_heartbeat_at, 10);
    }

    #[test]
    fn observing_higher_term_steps_down() {
        let mut n = node("node-1");
        n.start_election();
        assert!(n.observe_term(4));
        assert_eq!(n.role, Role::Follower);
        assert_eq!(n.current_term, 4);
        assert_eq!(n.voted_for, None);
        assert!(!n.observe_term(4));
    }
}

// =============================================================================
// SECTION 4: VOTE REQUEST HANDLING TESTS
// =============================================================================

mod vote_requests {
    use super::*;
    use proptest::prelude::*;

    fn pos(index: Option<u64>, term: u64) -> LogPosition {
        LogPosition::new(index, term)
    }

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut voter = node("node-2");
        assert!(voter.handle_vote_request(1, "node-1", pos(None, 0)));
        assert_eq!(voter.voted_for.as_deref(), Some("node-1"));
        assert_eq!(voter.current_term, 1);
    }

    #[test]
    fn reject_vote_for_equal_or_lower_term() {
        let mut voter = node("node-2");
        voter.current_term = 5;
        assert!(!voter.handle_vote_request(5, "node-1", pos(None, 0)));
        assert!(!voter.handle_vote_request(3, "node-1", pos(None, 0)));
        assert_eq!(voter.current_term, 5);
        assert_eq!(voter.voted_for, None);
    }

    #[test]
    fn one_vote_per_term() {
        let mut voter = node("node-2");
        assert!(voter.handle_vote_request(1, "node-1", pos(None, 0)));
        assert!(!voter.handle_vote_request(1, "node-3", pos(None, 0)));
        assert_eq!(voter.voted_for.as_deref(), Some("node-1"));
    }

    #[test]
    fn earlier_vote_does_not_bind_a_newer_term() {
        let mut voter = node("node-2");
        assert!(voter.handle_vote_request(1, "node-1", pos(None, 0)));
        assert!(voter.handle_vote_request(2, "node-3", pos(None, 0)));
        assert_eq!(voter.voted_for.as_deref(), Some("node-3"));
        assert_eq!(voter.current_term, 2);
    }

    #[test]
    fn denial_leaves_state_alone() {
        let mut voter = node("node-2");
        voter.current_term = 1;
        voter.append_command("x");
        voter.start_election(); // candidate, term 2

        assert!(!voter.handle_vote_request(3, "node-1", pos(None, 0)));
        assert_eq!(voter.role, Role::Candidate);
        assert_eq!(voter.current_term, 2);
    }

    #[test]
    fn granting_demotes_a_candidate() {
        let mut voter = node("node-2");
        voter.start_election(); // term 1
        assert!(voter.handle_vote_request(2, "node-1", pos(None, 0)));
        assert_eq!(voter.role, Role::Follower);
        assert_eq!(voter.votes_received, 0);
    }

    #[test]
    fn reject_candidate_with_stale_log() {
        let mut voter = node("node-2");
        voter.current_term = 5;
        voter.append_command("x"); // (index 0, term 5)
        assert!(!voter.handle_vote_request(6, "node-1", pos(Some(3), 4)));
    }

    #[test]
    fn reject_candidate_with_shorter_log_same_term() {
        let mut voter = node("node-2");
        voter.current_term = 1;
        voter.append_command("a");
        voter.append_command("b");
        assert!(!voter.handle_vote_request(2, "node-1", pos(Some(0), 1)));
    }

    #[test]
    fn grant_vote_to_candidate_with_higher_term_log() {
        let mut voter = node("node-2");
        voter.current_term = 1;
        voter.append_command("a");
        voter.append_command("b");
        assert!(voter.handle_vote_request(3, "node-1", pos(Some(0), 2)));
    }

    fn arb_pos() -> impl Strategy<Value = LogPosition> {
        (proptest::option::of(0u64..4), 0u64..4).prop_map(|(i, t)| LogPosition::new(i, t))
    }

    fn arb_vote() -> impl Strategy<Value = Option<&'static str>> {
        prop_oneof![Just(None), Just(Some("cand")), Just(Some("other"))]
    }

    proptest! {
        #[test]
        fn rule_matches_ordering_matrix(
            request_term in 0u64..5,
            voter_term in 0u64..5,
            voted_for in arb_vote(),
            cand in arb_pos(),
            voter in arb_pos(),
        ) {
            let term_ok = request_term > voter_term;
            let vote_ok = voted_for.is_none() || voted_for == Some("cand");
            let log_ok = cand.term > voter.term
                || (cand.term == voter.term && cand.index >= voter.index);

            prop_assert_eq!(
                grants_vote(request_term, "cand", cand, voter_term, voted_for, voter),
                term_ok && vote_ok && log_ok
            );
        }

        #[test]
        fn up_to_date_is_total_and_reflexive(a in arb_pos(), b in arb_pos()) {
            prop_assert!(a.is_at_least_as_up_to_date_as(&a));
            prop_assert!(a.is_at_least_as_up_to_date_as(&b) || b.is_at_least_as_up_to_date_as(&a));
        }
    }
}

// =============================================================================
// SECTION 5: REPLICATION TESTS
// =============================================================================

mod replication {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn leader_append_uses_current_term_and_next_index() {
        let mut leader = node("node-1");
        leader.current_term = 2;
        let entry = leader.append_command("SET x=1");
        assert_eq!(entry, LogEntry::new(2, 0, "SET x=1"));
        let entry = leader.append_command("SET y=2");
        assert_eq!(entry.index, 1);
    }

    #[test]
    fn follower_accepts_first_entry() {
        let mut follower = node("node-2");
        let entry = LogEntry::new(2, 0, "SET x=1");
        let outcome = follower.receive_entries(None, 0, &[entry], None, LogMatching::Strict);
        assert_eq!(outcome, AppendOutcome::Accepted { match_index: Some(0) });
        assert_eq!(follower.log.len(), 1);
        assert_eq!(follower.commit_index, None);
    }

    #[test]
    fn follower_follows_leader_commit_within_matched_prefix() {
        let mut follower = node("node-2");
        let entries = vec![LogEntry::new(1, 0, "SET a=1"), LogEntry::new(1, 1, "SET b=2")];
        follower.receive_entries(None, 0, &entries, Some(5), LogMatching::Strict);
        assert_eq!(follower.commit_index, Some(1));
        assert_eq!(follower.last_applied, Some(1));
        assert_eq!(follower.kv.get("b"), Some("2"));
    }

    #[test]
    fn unparseable_entry_is_applied_as_a_no_op() {
        let mut n = node("node-1");
        n.current_term = 1;
        n.append_command("SET a=1");
        n.append_command("INCR a");
        n.append_command("SET b=2");
        n.commit_through(2);

        assert_eq!(n.last_applied, Some(2));
        assert_eq!(n.kv.len(), 2);
        assert_eq!(n.kv.get("a"), Some("1"));
        assert_eq!(n.kv.get("b"), Some("2"));
    }

    #[test]
    fn heartbeat_commit_is_capped_by_matched_prefix() {
        let mut follower = node("node-2");
        let entries = vec![LogEntry::new(1, 0, "a"), LogEntry::new(1, 1, "b")];
        follower.receive_entries(None, 0, &entries, None, LogMatching::Strict);

        follower.receive_entries(Some(0), 1, &[], Some(1), LogMatching::Strict);
        assert_eq!(follower.commit_index, Some(0));
    }

    #[test]
    fn strict_mismatch_reports_last_index() {
        let mut follower = node("node-2");
        let outcome = follower.receive_entries(
            Some(3),
            1,
            &[LogEntry::new(1, 4, "x")],
            None,
            LogMatching::Strict,
        );
        assert_eq!(outcome, AppendOutcome::Rejected { last_index: None });
    }

    proptest! {
        #[test]
        fn commit_and_apply_stay_ordered(cmds in proptest::collection::vec("[a-z]{1,3}", 1..8), upto in 0u64..10) {
            let mut n = node("node-1");
            n.current_term = 1;
            for c in &cmds {
                n.append_command(format!("SET {c}=1"));
            }
            n.commit_through(upto);

            let last = n.log.last_index().unwrap();
            prop_assert_eq!(n.commit_index, Some(upto.min(last)));
            prop_assert!(n.last_applied <= n.commit_index);
            prop_assert!(n.log.iter().all(|e| e.committed == (e.index <= upto.min(last))));
        }
    }
}

// =============================================================================
// SECTION 6: FAULT TRANSITION TESTS
// =============================================================================

mod faults {
    use super::*;

    #[test]
    fn fail_forces_follower_and_keeps_log() {
        let mut n = node("node-1");
        n.start_election();
        n.become_leader(0);
        n.append_command("SET x=1");
        n.fail();

        assert!(!n.is_alive);
        assert_eq!(n.role, Role::Follower);
        assert_eq!(n.voted_for, None);
        assert_eq!(n.votes_received, 0);
        assert_eq!(n.current_term, 1);
        assert_eq!(n.log.len(), 1);
    }

    #[test]
    fn restart_resets_exactly() {
        let mut n = node("node-1");
        n.start_election();
        n.become_leader(0);
        n.append_command("SET x=1");
        n.commit_through(0);
        n.fail();
        n.restart(500);

        assert!(n.is_alive);
        assert_eq!(n.role, Role::Follower);
        assert_eq!(n.current_term, 0);
        assert!(n.log.is_empty());
        assert_eq!(n.votes_received, 0);
        assert_eq!(n.voted_for, None);
        assert_eq!(n.commit_index, None);
        assert_eq!(n.last_applied, None);
        assert!(n.kv.is_empty());
        assert_eq!(n.last_heartbeat_at, 500);
    }

    #[test]
    fn partition_toggle_keeps_role() {
        let mut n = node("node-1");
        n.start_election();
        assert!(n.toggle_partition());
        assert_eq!(n.role, Role::Candidate);
        assert!(!n.can_communicate());
        assert!(!n.toggle_partition());
        assert!(n.can_communicate());
    }
}
