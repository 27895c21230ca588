//! Event filtering and offset/limit pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ActorKind, EventType, SubmissionEvent};

/// Upper bound on a single page of events.
pub const MAX_PAGE_SIZE: u64 = 500;
/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Filter applied to an event read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only events of these kinds, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
    /// Only events performed by this kind of actor, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_kind: Option<ActorKind>,
    /// Inclusive lower bound on the event timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the event timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Check whether an event passes the filter.
    pub fn matches(&self, event: &SubmissionEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(kind) = self.actor_kind {
            if event.actor.kind != kind {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Offset/limit window for an event read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub offset: u64,
    pub limit: u64,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EventQuery {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// One page of events plus the total count across all pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<SubmissionEvent>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl EventPage {
    /// Apply filter and window to a full, version-ordered event list.
    pub fn from_events(
        all: &[SubmissionEvent],
        filter: &EventFilter,
        query: EventQuery,
    ) -> Self {
        let matching: Vec<&SubmissionEvent> =
            all.iter().filter(|e| filter.matches(e)).collect();
        let total = matching.len() as u64;

        let events = matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .map(super::redact_event)
            .collect();

        Self {
            events,
            total,
            offset: query.offset,
            limit: query.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, SubmissionId, SubmissionState};
    use serde_json::json;

    fn sample_events() -> Vec<SubmissionEvent> {
        let id = SubmissionId::new();
        vec![
            SubmissionEvent::new(
                EventType::SubmissionCreated,
                id,
                Actor::agent("bot-1"),
                SubmissionState::Draft,
                1,
                json!({}),
            ),
            SubmissionEvent::new(
                EventType::FieldUpdated,
                id,
                Actor::agent("bot-1"),
                SubmissionState::InProgress,
                2,
                json!({}),
            ),
            SubmissionEvent::new(
                EventType::FieldUpdated,
                id,
                Actor::human("reviewer-1"),
                SubmissionState::InProgress,
                3,
                json!({}),
            ),
        ]
    }

    #[test]
    fn test_filter_by_type_and_actor_kind() {
        let events = sample_events();

        let by_type = EventFilter {
            event_types: Some(vec![EventType::FieldUpdated]),
            ..Default::default()
        };
        let page = EventPage::from_events(&events, &by_type, EventQuery::default());
        assert_eq!(page.total, 2);

        let by_actor = EventFilter {
            actor_kind: Some(ActorKind::Human),
            ..Default::default()
        };
        let page = EventPage::from_events(&events, &by_actor, EventQuery::default());
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].version, 3);
    }

    #[test]
    fn test_pagination_window_keeps_total() {
        let events = sample_events();
        let page = EventPage::from_events(
            &events,
            &EventFilter::default(),
            EventQuery::new(1, 1),
        );
        assert_eq!(page.total, 3);
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].version, 2);
    }

    #[test]
    fn test_limit_is_clamped() {
        let q = EventQuery::new(0, 10_000);
        assert_eq!(q.limit, MAX_PAGE_SIZE);
        let q = EventQuery::new(0, 0);
        assert_eq!(q.limit, 1);
    }
}
