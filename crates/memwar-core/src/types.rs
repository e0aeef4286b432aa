use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Avatar used when a contact is created without one.
pub const PLACEHOLDER_AVATAR: &str = "https://images.pexels.com/photos/1222271/pexels-photo-1222271.jpeg?auto=compress&cs=tinysrgb&w=150&h=150&dpr=2";

/// A remembered person in the user's roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub relationship: String,
    pub avatar: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Phone number or other way to reach the person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// Fields supplied when creating a contact. `id` and `lastSeen` are owned by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDraft {
    pub name: String,
    pub relationship: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

impl ContactDraft {
    pub fn new(name: impl Into<String>, relationship: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relationship: relationship.into(),
            ..Default::default()
        }
    }
}

/// Partial update merged into an existing contact. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

impl Contact {
    /// Merge every populated field of `patch` into this contact. The id never changes.
    pub fn apply(&mut self, patch: ContactPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(relationship) = patch.relationship {
            self.relationship = relationship;
        }
        if let Some(avatar) = patch.avatar {
            self.avatar = avatar;
        }
        if patch.last_seen.is_some() {
            self.last_seen = patch.last_seen;
        }
        if patch.location.is_some() {
            self.location = patch.location;
        }
        if patch.notes.is_some() {
            self.notes = patch.notes;
        }
        if patch.contact.is_some() {
            self.contact = patch.contact;
        }
    }
}

/// One entry of the append-only sighting log.
///
/// Contact fields are captured as they were at commit time so the log
/// stays readable after the contact is edited or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sighting {
    pub contact_id: String,
    pub name: String,
    pub relationship: String,
    pub avatar: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub image_ref: Option<String>,
}

/// A possible identity for a captured image, as reported by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub contact_id: String,
    pub name: String,
    pub relationship: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub confidence: f32,
}

impl Candidate {
    /// A candidate the user picked by hand rather than one the matcher ranked.
    pub fn confirmed(contact: &Contact) -> Self {
        Self {
            contact_id: contact.id.clone(),
            name: contact.name.clone(),
            relationship: contact.relationship.clone(),
            avatar: Some(contact.avatar.clone()),
            confidence: 1.0,
        }
    }
}

/// Pick the highest-confidence candidate. Earlier entries win ties; the input order is kept.
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        let is_better = match best {
            None => true,
            Some(prev) => candidate.confidence > prev.confidence,
        };
        if is_better {
            best = Some(candidate);
        }
    }
    best
}

/// The roster written on first run, before any state has been persisted.
pub fn example_roster() -> Vec<Contact> {
    let seed = |id: &str, name: &str, relationship: &str, photo: &str, last_seen: &str, location: &str| Contact {
        id: id.into(),
        name: name.into(),
        relationship: relationship.into(),
        avatar: format!(
            "https://images.pexels.com/photos/{photo}/pexels-photo-{photo}.jpeg?auto=compress&cs=tinysrgb&w=150&h=150&dpr=2"
        ),
        last_seen: Some(last_seen.into()),
        location: Some(location.into()),
        notes: None,
        contact: None,
    };

    vec![
        seed("1", "Samantha R.", "Wife", "774909", "6pm • Golden Gate", "Golden Gate"),
        seed("2", "Sarah J", "Daughter", "1239291", "5pm • Peet's Cafe", "Peet's Cafe"),
        seed("3", "Liam Torres", "Grandson", "1043471", "4pm • Home", "Home"),
        seed("4", "Brianna Lee", "Niece", "1181686", "11am • 3 Jun 2025", "Park"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, confidence: f32) -> Candidate {
        Candidate {
            contact_id: id.into(),
            name: format!("person {id}"),
            relationship: "Friend".into(),
            avatar: None,
            confidence,
        }
    }

    #[test]
    fn test_best_candidate_highest_confidence() {
        let candidates = vec![candidate("1", 0.9), candidate("2", 0.95)];
        assert_eq!(best_candidate(&candidates).unwrap().contact_id, "2");
    }

    #[test]
    fn test_best_candidate_tie_keeps_first() {
        let candidates = vec![candidate("a", 0.8), candidate("b", 0.8), candidate("c", 0.7)];
        assert_eq!(best_candidate(&candidates).unwrap().contact_id, "a");
    }

    #[test]
    fn test_best_candidate_empty() {
        assert!(best_candidate(&[]).is_none());
    }

    #[test]
    fn test_apply_patch_keeps_id_and_untouched_fields() {
        let mut contact = example_roster().remove(0);
        contact.apply(ContactPatch {
            notes: Some("likes tulips".into()),
            ..Default::default()
        });
        assert_eq!(contact.id, "1");
        assert_eq!(contact.name, "Samantha R.");
        assert_eq!(contact.notes.as_deref(), Some("likes tulips"));
        assert_eq!(contact.location.as_deref(), Some("Golden Gate"));
    }

    #[test]
    fn test_contact_json_uses_camel_case() {
        let contact = example_roster().remove(1);
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["lastSeen"], "5pm • Peet's Cafe");
        assert!(json.get("notes").is_none());
    }

    #[test]
    fn test_example_roster_ids_unique() {
        let roster = example_roster();
        let mut ids: Vec<_> = roster.iter().map(|c| c.id.as_str()).collect();
        ids.dedup();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }
}
