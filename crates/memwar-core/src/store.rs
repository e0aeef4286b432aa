//! Contact store: the roster, the sighting log and the recent-activity projection.
//!
//! Every mutation is persisted before it becomes visible in memory, so a
//! failed write leaves both copies as they were. Subscribers receive a
//! [`StoreEvent`] after each successful mutation.

use crate::storage::{Storage, StorageError, Write};
use crate::types::{example_roster, Contact, ContactDraft, ContactPatch, Sighting, PLACEHOLDER_AVATAR};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Storage key of the serialized roster.
pub const ROSTER_KEY: &str = "memwar_contacts";
/// Storage key of the append-only sighting log.
pub const SIGHTINGS_KEY: &str = "memwar_sightings";
/// Size of the recent-activity list shown on the dashboard.
pub const RECENT_LIMIT: usize = 4;

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid contact: {0}")]
    Validation(String),
    #[error("contact not found: {0}")]
    NotFound(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt stored data: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Change notification emitted after a mutation has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StoreEvent {
    Created(String),
    Updated(String),
    Deleted(String),
    Sighted(String),
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::Created(_) => "created",
            StoreEvent::Updated(_) => "updated",
            StoreEvent::Deleted(_) => "deleted",
            StoreEvent::Sighted(_) => "sighted",
        }
    }

    pub fn contact_id(&self) -> &str {
        match self {
            StoreEvent::Created(id)
            | StoreEvent::Updated(id)
            | StoreEvent::Deleted(id)
            | StoreEvent::Sighted(id) => id,
        }
    }
}

pub struct ContactStore {
    storage: Box<dyn Storage>,
    scope: String,
    contacts: Vec<Contact>,
    sightings: Vec<Sighting>,
    /// Contact ids, most recently sighted first. Derived from `sightings`.
    recent: Vec<String>,
    events: broadcast::Sender<StoreEvent>,
}

impl ContactStore {
    /// Load the roster persisted under `scope`, seeding the example roster on first run.
    pub fn open(storage: Box<dyn Storage>, scope: &str) -> Result<Self, StoreError> {
        let mut storage = storage;

        let contacts = match storage.read(scope, ROSTER_KEY)? {
            Some(raw) => serde_json::from_str::<Vec<Contact>>(&raw)?,
            None => {
                let seeded = example_roster();
                let raw = serde_json::to_string(&seeded)?;
                storage.commit(scope, &[Write::Put { key: ROSTER_KEY, value: raw }])?;
                tracing::info!(scope, count = seeded.len(), "seeded example roster");
                seeded
            }
        };

        let sightings = storage
            .read_log(scope, SIGHTINGS_KEY)?
            .iter()
            .map(|raw| serde_json::from_str::<Sighting>(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut store = Self {
            storage,
            scope: scope.to_string(),
            contacts,
            sightings,
            recent: Vec::new(),
            events,
        };
        store.rebuild_recent();

        tracing::info!(
            scope,
            contacts = store.contacts.len(),
            sightings = store.sightings.len(),
            "contact store loaded"
        );
        Ok(store)
    }

    /// Scope (user id) this store persists under.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Full roster in insertion order.
    pub fn list(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn get(&self, id: &str) -> Result<&Contact, StoreError> {
        self.contacts
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Contacts whose name or relationship contains `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<&Contact> {
        let needle = query.trim().to_lowercase();
        self.contacts
            .iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.relationship.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Up to `n` contacts, most recently sighted first.
    ///
    /// Contacts never sighted follow in roster order.
    pub fn recent(&self, n: usize) -> Vec<&Contact> {
        let sighted = self.recent.iter().filter_map(|id| self.contacts.iter().find(|c| &c.id == id));
        let unsighted = self.contacts.iter().filter(|c| !self.recent.contains(&c.id));
        sighted.chain(unsighted).take(n).collect()
    }

    /// Sighting log, oldest first, optionally restricted to one contact.
    pub fn sightings(&self, contact_id: Option<&str>) -> Vec<&Sighting> {
        self.sightings
            .iter()
            .filter(|s| contact_id.map_or(true, |id| s.contact_id == id))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn create(&mut self, draft: ContactDraft) -> Result<Contact, StoreError> {
        let name = required("name", &draft.name)?;
        let relationship = required("relationship", &draft.relationship)?;

        let id = self.fresh_id();
        let contact = Contact {
            id,
            name,
            relationship,
            avatar: draft
                .avatar
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| PLACEHOLDER_AVATAR.to_string()),
            last_seen: None,
            location: non_blank(draft.location),
            notes: non_blank(draft.notes),
            contact: non_blank(draft.contact),
        };

        let mut next = self.contacts.clone();
        next.push(contact.clone());
        self.persist(next, None)?;

        tracing::info!(id = %contact.id, name = %contact.name, "contact created");
        self.notify(StoreEvent::Created(contact.id.clone()));
        Ok(contact)
    }

    pub fn update(&mut self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError> {
        let idx = self.index_of(id)?;
        if let Some(name) = &patch.name {
            required("name", name)?;
        }
        if let Some(relationship) = &patch.relationship {
            required("relationship", relationship)?;
        }

        let mut next = self.contacts.clone();
        next[idx].apply(patch);
        let updated = next[idx].clone();
        self.persist(next, None)?;

        tracing::info!(id, "contact updated");
        self.notify(StoreEvent::Updated(id.to_string()));
        Ok(updated)
    }

    /// Remove a contact. Its sightings stay in the log but drop out of the recent list.
    pub fn delete(&mut self, id: &str) -> Result<Contact, StoreError> {
        let idx = self.index_of(id)?;
        let mut next = self.contacts.clone();
        let removed = next.remove(idx);
        self.persist(next, None)?;
        self.rebuild_recent();

        tracing::info!(id, "contact deleted");
        self.notify(StoreEvent::Deleted(id.to_string()));
        Ok(removed)
    }

    pub fn record_sighting(&mut self, id: &str, location: Option<&str>) -> Result<Contact, StoreError> {
        self.record_sighting_with_image(id, location, None)
    }

    /// Record that `id` was seen now, optionally at `location` and with the snap that showed it.
    pub fn record_sighting_with_image(
        &mut self,
        id: &str,
        location: Option<&str>,
        image_ref: Option<String>,
    ) -> Result<Contact, StoreError> {
        let idx = self.index_of(id)?;
        let location = location.map(str::trim).filter(|l| !l.is_empty());
        let now = Utc::now();

        let mut next = self.contacts.clone();
        let contact = &mut next[idx];
        contact.last_seen = Some(last_seen_label(now, location));
        if let Some(place) = location {
            contact.location = Some(place.to_string());
        }
        let updated = contact.clone();

        let sighting = Sighting {
            contact_id: updated.id.clone(),
            name: updated.name.clone(),
            relationship: updated.relationship.clone(),
            avatar: updated.avatar.clone(),
            phone: updated.contact.clone(),
            location: location.map(str::to_string),
            timestamp: now,
            image_ref,
        };

        self.persist(next, Some(&sighting))?;
        self.sightings.push(sighting);
        self.rebuild_recent();

        tracing::info!(id, location = ?location, "sighting recorded");
        self.notify(StoreEvent::Sighted(id.to_string()));
        Ok(updated)
    }

    /// Write the new roster (and sighting, if any) in one commit, then adopt it.
    fn persist(&mut self, next: Vec<Contact>, sighting: Option<&Sighting>) -> Result<(), StoreError> {
        let mut writes = vec![Write::Put {
            key: ROSTER_KEY,
            value: serde_json::to_string(&next)?,
        }];
        if let Some(s) = sighting {
            writes.push(Write::Append {
                key: SIGHTINGS_KEY,
                value: serde_json::to_string(s)?,
            });
        }

        if let Err(e) = self.storage.commit(&self.scope, &writes) {
            tracing::warn!(scope = %self.scope, error = %e, "persist failed; roster unchanged");
            return Err(e.into());
        }
        self.contacts = next;
        Ok(())
    }

    fn rebuild_recent(&mut self) {
        let mut recent: Vec<String> = Vec::new();
        for sighting in self.sightings.iter().rev() {
            if recent.contains(&sighting.contact_id) {
                continue;
            }
            if self.contacts.iter().any(|c| c.id == sighting.contact_id) {
                recent.push(sighting.contact_id.clone());
            }
        }
        self.recent = recent;
    }

    fn index_of(&self, id: &str) -> Result<usize, StoreError> {
        self.contacts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// A UUID not used by any current contact or any logged sighting.
    fn fresh_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            let taken = self.contacts.iter().any(|c| c.id == id)
                || self.sightings.iter().any(|s| s.contact_id == id);
            if !taken {
                return id;
            }
        }
    }

    fn notify(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// `"<time> • <location>"`, or the bare time without a location.
pub fn last_seen_label(at: DateTime<Utc>, location: Option<&str>) -> String {
    let time = at.with_timezone(&Local).format("%-I:%M %p").to_string();
    match location {
        Some(place) => format!("{time} • {place}"),
        None => time,
    }
}

fn required(field: &str, value: &str) -> Result<String, StoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
