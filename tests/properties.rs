use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;

use study_room::config::TimerDefaults;
use study_room::notifications::{should_alert, NotificationAggregator, NotificationCounts, NotificationEvent, NotificationItem};
use study_room::presence::{PresenceLedger, UserRef};
use study_room::timer::{TimerCommand, TimerMirror, TimerStateMachine, MAX_PHASE_MINUTES};

#[derive(Debug, Clone)]
enum RosterOp {
    Join(u8),
    Leave(u8),
}

fn roster_op() -> impl Strategy<Value = RosterOp> {
    prop_oneof![
        (0u8..6).prop_map(RosterOp::Join),
        (0u8..6).prop_map(RosterOp::Leave),
    ]
}

#[derive(Debug, Clone)]
enum TimerOp {
    Command(TimerCommand),
    Ticks(u16),
}

fn timer_op() -> impl Strategy<Value = TimerOp> {
    let minutes = prop::option::of(0u32..=MAX_PHASE_MINUTES + 5);
    prop_oneof![
        Just(TimerOp::Command(TimerCommand::Start)),
        Just(TimerOp::Command(TimerCommand::Pause)),
        Just(TimerOp::Command(TimerCommand::Reset)),
        (minutes.clone(), minutes).prop_map(|(work_duration, break_duration)| {
            TimerOp::Command(TimerCommand::DurationChange {
                work_duration,
                break_duration,
            })
        }),
        (1u16..200).prop_map(TimerOp::Ticks),
    ]
}

fn feed(total: usize, unread: usize) -> Vec<NotificationItem> {
    let now = Utc::now();
    (0..total)
        .map(|i| NotificationItem {
            id: format!("n{i}"),
            title: String::new(),
            content: String::new(),
            kind: "info".to_string(),
            read: i >= unread,
            timestamp: now - chrono::Duration::seconds(i64::try_from(i).unwrap_or(i64::MAX)),
        })
        .collect()
}

proptest! {
    #[test]
    fn host_is_always_the_earliest_remaining_joiner(ops in prop::collection::vec(roster_op(), 0..60)) {
        let mut ledger = PresenceLedger::new();
        let mut joined_order: Vec<String> = Vec::new();

        for op in ops {
            match op {
                RosterOp::Join(n) => {
                    let id = format!("u{n}");
                    ledger.join(UserRef::new(id.clone(), format!("User {n}")), None);
                    if !joined_order.contains(&id) {
                        joined_order.push(id);
                    }
                }
                RosterOp::Leave(n) => {
                    let id = format!("u{n}");
                    let departure = ledger.leave(&id);
                    prop_assert_eq!(departure.is_some(), joined_order.contains(&id));
                    joined_order.retain(|u| u != &id);
                }
            }

            prop_assert_eq!(ledger.len(), joined_order.len());
            prop_assert_eq!(ledger.host().map(|h| h.user_id.clone()), joined_order.first().cloned());
            if let Some(host) = ledger.host() {
                prop_assert!(ledger.contains(&host.user_id));
            }
        }
    }

    #[test]
    fn timer_stays_within_its_phase(
        ops in prop::collection::vec(timer_op(), 0..40),
        auto_continue in any::<bool>(),
    ) {
        let mut timer = TimerStateMachine::new(&TimerDefaults {
            work_minutes: 1,
            break_minutes: 1,
            auto_continue,
        });

        for op in ops {
            match op {
                TimerOp::Command(command) => {
                    let before = timer.state().clone();
                    if timer.apply(command).is_err() {
                        prop_assert_eq!(timer.state(), &before);
                    }
                }
                TimerOp::Ticks(n) => {
                    for _ in 0..n {
                        timer.tick();
                    }
                }
            }

            let state = timer.state();
            prop_assert!((1..=MAX_PHASE_MINUTES).contains(&state.work_duration));
            prop_assert!((1..=MAX_PHASE_MINUTES).contains(&state.break_duration));
            prop_assert!(state.remaining_seconds <= state.phase_seconds());
            prop_assert!(state.remaining_seconds > 0);
        }
    }

    #[test]
    fn alert_needs_both_counts_to_grow(
        base_total in 0usize..20,
        base_unread in 0usize..20,
        next_total in 0usize..20,
        next_unread in 0usize..20,
    ) {
        let baseline = NotificationCounts::new(base_total, base_unread);
        let next = NotificationCounts::new(next_total, next_unread);

        prop_assert_eq!(
            should_alert(baseline, next),
            next_total > base_total && next_unread > base_unread
        );
    }

    #[test]
    fn aggregator_baseline_follows_every_snapshot(
        snapshots in prop::collection::vec((0usize..8, 0usize..8), 1..20),
    ) {
        let mut aggregator = NotificationAggregator::new();

        for (total, unread) in snapshots {
            let unread = unread.min(total);
            let before = aggregator.baseline();
            let events = aggregator.observe(feed(total, unread)).unwrap();
            let next = NotificationCounts::new(total, unread);

            prop_assert_eq!(events.contains(&NotificationEvent::Alert), should_alert(before, next));
            prop_assert_eq!(events.last(), Some(&NotificationEvent::Badge(unread)));
            prop_assert_eq!(aggregator.baseline(), next);
        }
    }

    #[test]
    fn mirror_applies_updates_idempotently(
        ops in prop::collection::vec(timer_op(), 0..20),
        elapsed in 0u64..5000,
    ) {
        let mut timer = TimerStateMachine::new(&TimerDefaults::default());
        for op in ops {
            match op {
                TimerOp::Command(command) => {
                    let _ = timer.apply(command);
                }
                TimerOp::Ticks(n) => {
                    for _ in 0..n {
                        timer.tick();
                    }
                }
            }
        }

        let update = timer.state().clone();
        let mut once = TimerMirror::new();
        once.apply(&update);
        let mut twice = TimerMirror::new();
        twice.apply(&update);
        twice.apply(&update);

        prop_assert_eq!(once.state(), twice.state());
        let since = Duration::from_secs(elapsed);
        prop_assert_eq!(once.display_remaining(since), twice.display_remaining(since));
        prop_assert!(once.display_remaining(since).unwrap_or(0) <= update.remaining_seconds);
    }
}
