//! Property-based tests for Mailtide core domain models
//!
//! Validates serialization round-trip consistency for the polymorphic block
//! tree and the enums persisted as strings, plus structural invariants of
//! the broadcast status machine.

use proptest::prelude::*;

use crate::{Block, BlockKind, BroadcastStatus, EmailEventKind, MembershipStatus, QueueStatus};

fn arb_block_kind() -> impl Strategy<Value = BlockKind> {
    prop_oneof![
        Just(BlockKind::Mjml),
        Just(BlockKind::MjBody),
        Just(BlockKind::MjSection),
        Just(BlockKind::MjColumn),
        Just(BlockKind::MjText),
        Just(BlockKind::MjButton),
        Just(BlockKind::MjImage),
        Just(BlockKind::MjDivider),
        Just(BlockKind::MjSpacer),
        Just(BlockKind::MjRaw),
        "[a-z][a-z-]{1,12}".prop_map(BlockKind::Other),
    ]
}

fn arb_block() -> impl Strategy<Value = Block> {
    let leaf = (
        "[a-z0-9]{4,12}",
        arb_block_kind(),
        proptest::option::of("[ -~]{0,32}"),
    )
        .prop_map(|(id, kind, content)| {
            let mut block = Block::new(id, kind);
            block.content = content;
            block
        });

    leaf.prop_recursive(3, 24, 4, |inner| {
        (
            "[a-z0-9]{4,12}",
            arb_block_kind(),
            proptest::collection::vec(inner, 0..4),
        )
            .prop_map(|(id, kind, children)| Block::new(id, kind).with_children(children))
    })
}

proptest! {
    #[test]
    fn block_tree_serde_round_trip(block in arb_block()) {
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(block, decoded);
    }

    #[test]
    fn membership_status_round_trips(idx in 0usize..5) {
        let statuses = [
            MembershipStatus::Active,
            MembershipStatus::Pending,
            MembershipStatus::Unsubscribed,
            MembershipStatus::Bounced,
            MembershipStatus::Complained,
        ];
        let status = statuses[idx];
        prop_assert_eq!(MembershipStatus::parse(status.as_str()), Some(status));
    }

    #[test]
    fn event_kind_serde_matches_as_str(idx in 0usize..8) {
        let kinds = [
            EmailEventKind::Sent,
            EmailEventKind::Delivered,
            EmailEventKind::Bounced,
            EmailEventKind::Complained,
            EmailEventKind::Opened,
            EmailEventKind::Clicked,
            EmailEventKind::Unsubscribed,
            EmailEventKind::Failed,
        ];
        let kind = kinds[idx];
        let json = serde_json::to_string(&kind).unwrap();
        prop_assert_eq!(json, format!("\"{}\"", kind.as_str()));
    }

    #[test]
    fn queue_status_round_trips(idx in 0usize..3) {
        let statuses = [QueueStatus::Pending, QueueStatus::Processing, QueueStatus::Failed];
        let status = statuses[idx];
        prop_assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
    }
}

#[test]
fn terminal_broadcast_states_never_transition() {
    let all = [
        BroadcastStatus::Draft,
        BroadcastStatus::Scheduled,
        BroadcastStatus::Testing,
        BroadcastStatus::TestCompleted,
        BroadcastStatus::WinnerSelected,
        BroadcastStatus::Sending,
        BroadcastStatus::Paused,
        BroadcastStatus::Completed,
        BroadcastStatus::Failed,
        BroadcastStatus::Cancelled,
    ];

    for terminal in all.iter().filter(|s| s.is_terminal()) {
        for target in all {
            assert!(
                !terminal.can_transition_to(target),
                "{terminal} must not transition to {target}"
            );
        }
    }
}
