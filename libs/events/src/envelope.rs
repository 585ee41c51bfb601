//! Change event envelope - the common wrapper for every notification.

use chrono::{DateTime, Utc};
use flotilla_id::ResourceVersion;
use serde::{Deserialize, Serialize};

use crate::{ChangeKind, EventError, ObjectKind, WatchedObject};

/// A single change notification for a watched object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<P> {
    /// What happened to the object.
    pub change: ChangeKind,

    /// Per-object monotonic version.
    pub resource_version: ResourceVersion,

    /// When the watch observed the change.
    pub observed_at: DateTime<Utc>,

    /// The object as observed. For deletions, the last known state.
    pub payload: P,
}

impl<P: WatchedObject> ChangeEvent<P> {
    /// Creates a new change event builder for the given object.
    pub fn builder(payload: P) -> ChangeEventBuilder<P> {
        ChangeEventBuilder::new(payload)
    }

    /// Shorthand for an `Added` event observed now.
    pub fn added(payload: P, resource_version: ResourceVersion) -> Self {
        Self::at(ChangeKind::Added, payload, resource_version)
    }

    /// Shorthand for an `Updated` event observed now.
    pub fn updated(payload: P, resource_version: ResourceVersion) -> Self {
        Self::at(ChangeKind::Updated, payload, resource_version)
    }

    /// Shorthand for a `Deleted` event observed now.
    pub fn deleted(payload: P, resource_version: ResourceVersion) -> Self {
        Self::at(ChangeKind::Deleted, payload, resource_version)
    }

    fn at(change: ChangeKind, payload: P, resource_version: ResourceVersion) -> Self {
        Self {
            change,
            resource_version,
            observed_at: Utc::now(),
            payload,
        }
    }

    /// The kind of object this event is about.
    pub fn kind(&self) -> ObjectKind {
        P::KIND
    }

    /// The identity of the object this event is about.
    pub fn identity(&self) -> P::Id {
        self.payload.id()
    }
}

/// Builder for constructing change events.
#[derive(Debug)]
pub struct ChangeEventBuilder<P> {
    change: Option<ChangeKind>,
    resource_version: Option<ResourceVersion>,
    observed_at: Option<DateTime<Utc>>,
    payload: P,
}

impl<P: WatchedObject> ChangeEventBuilder<P> {
    pub fn new(payload: P) -> Self {
        Self {
            change: None,
            resource_version: None,
            observed_at: None,
            payload,
        }
    }

    pub fn change(mut self, change: ChangeKind) -> Self {
        self.change = Some(change);
        self
    }

    pub fn resource_version(mut self, version: impl Into<ResourceVersion>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    pub fn observed_at(mut self, ts: DateTime<Utc>) -> Self {
        self.observed_at = Some(ts);
        self
    }

    /// Builds the event.
    ///
    /// The change kind and resource version are required; the observation
    /// time defaults to now.
    pub fn build(self) -> Result<ChangeEvent<P>, EventError> {
        Ok(ChangeEvent {
            change: self.change.ok_or(EventError::MissingField("change"))?,
            resource_version: self
                .resource_version
                .ok_or(EventError::MissingField("resource_version"))?,
            observed_at: self.observed_at.unwrap_or_else(Utc::now),
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
    }

    impl WatchedObject for Widget {
        type Id = u32;
        const KIND: ObjectKind = ObjectKind::Node;

        fn id(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn test_builder_requires_change() {
        let err = ChangeEvent::builder(Widget { id: 1 })
            .resource_version(3)
            .build()
            .unwrap_err();
        assert_eq!(err, EventError::MissingField("change"));
    }

    #[test]
    fn test_builder_requires_version() {
        let err = ChangeEvent::builder(Widget { id: 1 })
            .change(ChangeKind::Added)
            .build()
            .unwrap_err();
        assert_eq!(err, EventError::MissingField("resource_version"));
    }

    #[test]
    fn test_builder() {
        let ts = Utc::now();
        let event = ChangeEvent::builder(Widget { id: 7 })
            .change(ChangeKind::Updated)
            .resource_version(4)
            .observed_at(ts)
            .build()
            .unwrap();

        assert_eq!(event.identity(), 7);
        assert_eq!(event.kind(), ObjectKind::Node);
        assert_eq!(event.resource_version, ResourceVersion::new(4));
        assert_eq!(event.observed_at, ts);
    }

    #[test]
    fn test_json_shape() {
        let event = ChangeEvent::deleted(Widget { id: 2 }, ResourceVersion::new(9));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["change"], "deleted");
        assert_eq!(json["resource_version"], 9);
        assert_eq!(json["payload"]["id"], 2);
    }
}
