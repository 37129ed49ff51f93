//! Per-user notification feed and the "is this genuinely new" decision.
//!
//! The store only ever hands over full lists. Each list is compared against
//! the counts remembered from the previous one, and the remembered counts are
//! then replaced outright, so a lost or repeated snapshot corrects itself on
//! the next one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::NotificationError;
use crate::presence::UserId;
use crate::store::{NewNotification, NotificationStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationItem {
    pub id: String,
    pub title: String,
    pub content: String,
    pub kind: String,
    pub read: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCounts {
    pub total: usize,
    pub unread: usize,
}

impl NotificationCounts {
    pub fn new(total: usize, unread: usize) -> Self {
        NotificationCounts { total, unread }
    }

    pub fn of(items: &[NotificationItem]) -> Self {
        NotificationCounts {
            total: items.len(),
            unread: items.iter().filter(|i| !i.read).count(),
        }
    }
}

/// Alert only when both the total and the unread count grew. Marking read
/// lowers `unread`, deleting lowers `total`; neither can fire.
pub fn should_alert(baseline: NotificationCounts, next: NotificationCounts) -> bool {
    next.total > baseline.total && next.unread > baseline.unread
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Alert,
    Render(Vec<NotificationItem>),
    Badge(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationSnapshot {
    pub items: Vec<NotificationItem>,
    pub last_known_total: usize,
    pub last_known_unread: usize,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationAggregator {
    snapshot: NotificationSnapshot,
}

impl NotificationAggregator {
    pub fn new() -> Self {
        NotificationAggregator::default()
    }

    pub fn with_baseline(baseline: NotificationCounts) -> Self {
        NotificationAggregator {
            snapshot: NotificationSnapshot {
                items: Vec::new(),
                last_known_total: baseline.total,
                last_known_unread: baseline.unread,
            },
        }
    }

    pub fn current_snapshot(&self) -> &NotificationSnapshot {
        &self.snapshot
    }

    pub fn baseline(&self) -> NotificationCounts {
        NotificationCounts::new(self.snapshot.last_known_total, self.snapshot.last_known_unread)
    }

    /// Evaluates a full snapshot, rendered newest first whatever order it
    /// arrived in. A snapshot with duplicate ids leaves the baseline untouched
    /// and produces no events.
    pub fn observe(
        &mut self,
        mut items: Vec<NotificationItem>,
    ) -> Result<Vec<NotificationEvent>, NotificationError> {
        validate(&items)?;
        // Stable, so items sharing a timestamp keep the store's order.
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let next = NotificationCounts::of(&items);
        let alert = should_alert(self.baseline(), next);

        self.snapshot = NotificationSnapshot {
            items,
            last_known_total: next.total,
            last_known_unread: next.unread,
        };

        let mut events = Vec::with_capacity(3);
        if alert {
            events.push(NotificationEvent::Alert);
        }
        events.push(NotificationEvent::Render(self.snapshot.items.clone()));
        events.push(NotificationEvent::Badge(next.unread));
        Ok(events)
    }
}

fn validate(items: &[NotificationItem]) -> Result<(), NotificationError> {
    let mut seen = HashSet::with_capacity(items.len());
    if let Some(dup) = items.iter().find(|i| !seen.insert(i.id.as_str())) {
        return Err(NotificationError::AlertEvaluationSkipped(format!(
            "duplicate notification id {}",
            dup.id
        )));
    }

    Ok(())
}

/// One observer of a user's notification feed, typically one browser tab.
/// Each session keeps its own baseline.
#[derive(Clone)]
pub struct NotificationSession {
    user_id: UserId,
    store: Arc<dyn NotificationStore>,
}

impl NotificationSession {
    pub fn new(user_id: impl Into<UserId>, store: Arc<dyn NotificationStore>) -> Self {
        NotificationSession {
            user_id: user_id.into(),
            store,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn add(&self, notification: NewNotification) -> Result<NotificationItem, NotificationError> {
        Ok(self.store.add_notification(&self.user_id, notification).await?)
    }

    /// Issues the bulk update and nothing else; the resulting snapshot is
    /// judged like any other.
    pub async fn mark_all_read(&self) -> Result<usize, NotificationError> {
        let changed = self.store.mark_all_read(&self.user_id).await?;
        if changed > 0 {
            info!("Marked {} notifications read for {}", changed, self.user_id);
        }
        Ok(changed)
    }

    pub async fn clear_all(&self) -> Result<usize, NotificationError> {
        let removed = self.store.clear_all(&self.user_id).await?;
        if removed > 0 {
            info!("Cleared {} notifications for {}", removed, self.user_id);
        }
        Ok(removed)
    }

    /// Follows the feed until it closes, handing each evaluated snapshot to
    /// `deliver`. The current list is evaluated immediately.
    pub fn watch<F>(&self, mut deliver: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<NotificationEvent>) + Send + 'static,
    {
        let mut feed = self.store.subscribe(&self.user_id);
        let user_id = self.user_id.clone();

        tokio::spawn(async move {
            let mut aggregator = NotificationAggregator::new();
            loop {
                let items = feed.borrow_and_update().clone();
                match aggregator.observe(items) {
                    Ok(events) => deliver(events),
                    Err(e) => warn!("Notification snapshot for {} ignored: {}", user_id, e),
                }

                if feed.changed().await.is_err() {
                    debug!("Notification feed for {} closed", user_id);
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn items(total: usize, unread: usize) -> Vec<NotificationItem> {
        let now = Utc::now();
        (0..total)
            .map(|i| NotificationItem {
                id: format!("n{i}"),
                title: format!("title {i}"),
                content: String::new(),
                kind: "info".to_string(),
                read: i >= unread,
                timestamp: now - Duration::seconds(i as i64),
            })
            .collect()
    }

    fn alerted(events: &[NotificationEvent]) -> bool {
        events.contains(&NotificationEvent::Alert)
    }

    #[test]
    fn mark_all_read_then_new_item() {
        let mut aggregator = NotificationAggregator::with_baseline(NotificationCounts::new(5, 2));

        let events = aggregator.observe(items(5, 0)).unwrap();
        assert!(!alerted(&events));

        let events = aggregator.observe(items(6, 1)).unwrap();
        assert!(alerted(&events));
        assert_eq!(aggregator.baseline(), NotificationCounts::new(6, 1));
    }

    #[test]
    fn clear_all_never_alerts() {
        let mut aggregator = NotificationAggregator::with_baseline(NotificationCounts::new(5, 3));
        let events = aggregator.observe(Vec::new()).unwrap();

        assert!(!alerted(&events));
        assert_eq!(events, vec![NotificationEvent::Render(Vec::new()), NotificationEvent::Badge(0)]);
    }

    #[test]
    fn repeated_snapshot_alerts_once() {
        let mut aggregator = NotificationAggregator::new();
        assert!(alerted(&aggregator.observe(items(1, 1)).unwrap()));
        assert!(!alerted(&aggregator.observe(items(1, 1)).unwrap()));
    }

    #[test]
    fn malformed_snapshot_keeps_baseline() {
        let mut aggregator = NotificationAggregator::with_baseline(NotificationCounts::new(2, 1));
        let mut dup = items(3, 3);
        dup[2].id = dup[0].id.clone();

        assert!(matches!(
            aggregator.observe(dup),
            Err(NotificationError::AlertEvaluationSkipped(_))
        ));
        assert_eq!(aggregator.baseline(), NotificationCounts::new(2, 1));
    }

    #[test]
    fn out_of_order_snapshot_is_sorted_and_still_alerts() {
        let mut aggregator = NotificationAggregator::new();
        let mut older_first = items(2, 0);
        older_first.reverse();
        assert!(!alerted(&aggregator.observe(older_first).unwrap()));

        let mut next = items(3, 1);
        next.swap(1, 2);
        let events = aggregator.observe(next).unwrap();

        assert!(alerted(&events));
        let ids: Vec<_> = aggregator.current_snapshot().items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["n0", "n1", "n2"]);
        assert_eq!(aggregator.baseline(), NotificationCounts::new(3, 1));
    }

    #[test]
    fn badge_tracks_unread() {
        let mut aggregator = NotificationAggregator::new();
        let events = aggregator.observe(items(4, 3)).unwrap();
        assert_eq!(events.last(), Some(&NotificationEvent::Badge(3)));
        assert_eq!(aggregator.current_snapshot().items.len(), 4);
    }
}
