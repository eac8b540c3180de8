//! In-memory domain stores fed by inbound handlers.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::payload::{ChatMessage, LinkedForm, MapMarker};
use crate::sync::{LinkedFormProvider, MarkerProvider};

/// A stored chat message and whether its recipient acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChat {
    pub message: ChatMessage,
    pub from_device_id: String,
    pub delivered: bool,
}

/// Chat history keyed by message id. Inserting a known id is a no-op.
#[derive(Default)]
pub struct ChatStore {
    messages: RwLock<HashMap<String, StoredChat>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the message was new.
    pub fn insert(&self, message: ChatMessage, from_device_id: &str) -> bool {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            return false;
        }
        messages.insert(
            message.id.clone(),
            StoredChat {
                message,
                from_device_id: from_device_id.to_string(),
                delivered: false,
            },
        );
        true
    }

    /// Returns `true` if the message exists.
    pub fn mark_delivered(&self, message_id: &str) -> bool {
        match self.messages.write().get_mut(message_id) {
            Some(stored) => {
                stored.delivered = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, message_id: &str) -> Option<StoredChat> {
        self.messages.read().get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// All messages, oldest first.
    pub fn list(&self) -> Vec<StoredChat> {
        let mut all: Vec<_> = self.messages.read().values().cloned().collect();
        all.sort_by_key(|c| c.message.created_at_millis);
        all
    }
}

/// Known map markers keyed by marker id.
#[derive(Default)]
pub struct MarkerStore {
    markers: RwLock<HashMap<String, MapMarker>>,
}

impl MarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, marker: MapMarker) {
        self.markers.write().insert(marker.id.clone(), marker);
    }

    pub fn remove(&self, id: &str) -> Option<MapMarker> {
        self.markers.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<MapMarker> {
        self.markers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.markers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.read().is_empty()
    }
}

impl MarkerProvider for MarkerStore {
    fn all_markers(&self) -> Vec<MapMarker> {
        let mut all: Vec<_> = self.markers.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Forms linked to markers or orders, keyed by form id.
#[derive(Default)]
pub struct LinkedFormStore {
    forms: RwLock<HashMap<String, LinkedForm>>,
}

impl LinkedFormStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, form: LinkedForm) {
        self.forms.write().insert(form.id.clone(), form);
    }

    pub fn get(&self, id: &str) -> Option<LinkedForm> {
        self.forms.read().get(id).cloned()
    }

    /// Forms attached to one marker.
    pub fn for_marker(&self, marker_id: &str) -> Vec<LinkedForm> {
        self.forms
            .read()
            .values()
            .filter(|f| f.marker_id.as_deref() == Some(marker_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.forms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.read().is_empty()
    }
}

impl LinkedFormProvider for LinkedFormStore {
    fn all_linked_forms(&self) -> Vec<LinkedForm> {
        let mut all: Vec<_> = self.forms.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
