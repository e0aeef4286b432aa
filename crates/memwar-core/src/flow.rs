//! Recognition flow: one capture-to-disposition session.
//!
//! ```text
//! Capturing ──capture──▶ Processing ──matches──▶ Recognized ──save──▶ Ended(Saved)
//!     ▲                      │   └──no matches─▶ Unrecognized ──add new──▶ Ended(AddNew)
//!     │                      └──failed / unassisted──▶ NotRemembered ──no──▶ Ended(Forgotten)
//!     └────────────── discard (Recognized | Unrecognized | NotRemembered)
//! ```
//!
//! [`transition`] is the only place a state changes. [`RecognitionFlow`]
//! performs the two suspensions (image capture and the matcher call) and
//! feeds their results through it. The capture device is owned by the
//! flow and dropped as soon as the session ends.

use crate::matcher::{MatchError, Matcher};
use crate::store::{ContactStore, StoreError};
use crate::types::{best_candidate, Candidate, Contact};
use serde::Serialize;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct CaptureError(pub String);

/// Source of still images for one session. Dropping it releases the device.
pub trait CaptureDevice {
    fn capture(&mut self) -> impl Future<Output = Result<Vec<u8>, CaptureError>> + Send;
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("capture device: {0}")]
    Device(String),
    #[error("no authenticated user")]
    Auth,
    #[error("recognition failed: {0}")]
    Network(#[from] MatchError),
    #[error("a capture is already being processed")]
    Busy,
    #[error("cannot {event} while {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why the user is being asked "did you remember who this was?".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecallCause {
    /// The user chose to identify the face without the matcher.
    SelfReported,
    /// The matcher call failed.
    MatcherFailed { message: String },
}

/// How a session finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Disposition {
    Saved { contact_id: String },
    Forgotten,
    AddNew,
    Cancelled,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FlowState {
    Capturing,
    Processing {
        #[serde(skip)]
        image: Vec<u8>,
    },
    Recognized {
        #[serde(skip)]
        image: Vec<u8>,
        candidate: Candidate,
        /// The contact's `lastSeen` at the time of recognition.
        last_seen: Option<String>,
    },
    Unrecognized {
        #[serde(skip)]
        image: Vec<u8>,
    },
    NotRemembered {
        #[serde(skip)]
        image: Vec<u8>,
        cause: RecallCause,
    },
    Ended {
        disposition: Disposition,
    },
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Capturing => "capturing",
            FlowState::Processing { .. } => "processing",
            FlowState::Recognized { .. } => "recognized",
            FlowState::Unrecognized { .. } => "unrecognized",
            FlowState::NotRemembered { .. } => "not_remembered",
            FlowState::Ended { .. } => "ended",
        }
    }

    /// The image captured in this session, if one is held.
    pub fn image(&self) -> Option<&[u8]> {
        match self {
            FlowState::Processing { image }
            | FlowState::Recognized { image, .. }
            | FlowState::Unrecognized { image }
            | FlowState::NotRemembered { image, .. } => Some(image),
            FlowState::Capturing | FlowState::Ended { .. } => None,
        }
    }

    /// Line shown to the user for the current state.
    pub fn display_text(&self) -> Option<String> {
        match self {
            FlowState::Recognized {
                candidate,
                last_seen,
                ..
            } => {
                let recency = match last_seen {
                    Some(seen) => format!("last seen {seen}"),
                    None => "not seen before".to_string(),
                };
                Some(format!(
                    "Your {} — {}",
                    candidate.relationship.to_lowercase(),
                    recency
                ))
            }
            FlowState::Unrecognized { .. } => Some("No familiar faces detected".to_string()),
            FlowState::NotRemembered { .. } => Some("Did you remember who this was?".to_string()),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, FlowState::Ended { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Captured(Vec<u8>),
    Matched(Vec<Candidate>),
    MatchFailed(String),
    SelfReported,
    /// "Yes, I remember": the user names the contact.
    Recalled(String),
    /// "No, I didn't."
    Forgotten,
    AddNew,
    Discard,
    Saved,
    Cancel,
    Abort(String),
}

impl FlowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::Captured(_) => "capture",
            FlowEvent::Matched(_) => "accept matches",
            FlowEvent::MatchFailed(_) => "report match failure",
            FlowEvent::SelfReported => "skip matching",
            FlowEvent::Recalled(_) => "confirm a contact",
            FlowEvent::Forgotten => "decline",
            FlowEvent::AddNew => "add a new contact",
            FlowEvent::Discard => "discard",
            FlowEvent::Saved => "save",
            FlowEvent::Cancel => "cancel",
            FlowEvent::Abort(_) => "abort",
        }
    }
}

/// Compute the state that follows `state` on `event`.
///
/// `roster` resolves the contacts named by matches or by the user.
pub fn transition(state: &FlowState, event: FlowEvent, roster: &[Contact]) -> Result<FlowState, FlowError> {
    let last_seen_of = |id: &str| {
        roster
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.last_seen.clone())
    };

    let next = match (state, event) {
        (FlowState::Ended { .. }, event) => {
            return Err(invalid(state, &event));
        }
        (_, FlowEvent::Cancel) => FlowState::Ended {
            disposition: Disposition::Cancelled,
        },
        (_, FlowEvent::Abort(reason)) => FlowState::Ended {
            disposition: Disposition::Aborted { reason },
        },

        (FlowState::Capturing, FlowEvent::Captured(image)) => FlowState::Processing { image },

        (FlowState::Processing { image }, FlowEvent::Matched(candidates)) => match best_candidate(&candidates) {
            Some(best) => FlowState::Recognized {
                image: image.clone(),
                last_seen: last_seen_of(&best.contact_id),
                candidate: best.clone(),
            },
            None => FlowState::Unrecognized { image: image.clone() },
        },
        (FlowState::Processing { image }, FlowEvent::MatchFailed(message)) => FlowState::NotRemembered {
            image: image.clone(),
            cause: RecallCause::MatcherFailed { message },
        },
        (FlowState::Processing { image }, FlowEvent::SelfReported) => FlowState::NotRemembered {
            image: image.clone(),
            cause: RecallCause::SelfReported,
        },

        (FlowState::NotRemembered { image, .. }, FlowEvent::Recalled(id)) => {
            let contact = roster
                .iter()
                .find(|c| c.id == id)
                .ok_or(StoreError::NotFound(id))?;
            FlowState::Recognized {
                image: image.clone(),
                candidate: Candidate::confirmed(contact),
                last_seen: contact.last_seen.clone(),
            }
        }
        (FlowState::NotRemembered { .. }, FlowEvent::Forgotten) => FlowState::Ended {
            disposition: Disposition::Forgotten,
        },

        (FlowState::Unrecognized { .. } | FlowState::NotRemembered { .. }, FlowEvent::AddNew) => FlowState::Ended {
            disposition: Disposition::AddNew,
        },

        (
            FlowState::Recognized { .. } | FlowState::Unrecognized { .. } | FlowState::NotRemembered { .. },
            FlowEvent::Discard,
        ) => FlowState::Capturing,

        (FlowState::Recognized { candidate, .. }, FlowEvent::Saved) => FlowState::Ended {
            disposition: Disposition::Saved {
                contact_id: candidate.contact_id.clone(),
            },
        },

        (FlowState::Processing { .. }, FlowEvent::Captured(_)) => return Err(FlowError::Busy),
        (state, event) => return Err(invalid(state, &event)),
    };

    Ok(next)
}

fn invalid(state: &FlowState, event: &FlowEvent) -> FlowError {
    FlowError::InvalidTransition {
        state: state.name(),
        event: event.name(),
    }
}

/// Drives one recognition session.
pub struct RecognitionFlow<D, M> {
    device: Option<D>,
    matcher: M,
    user: Option<String>,
    state: FlowState,
}

impl<D: CaptureDevice, M: Matcher> RecognitionFlow<D, M> {
    /// Begin a session in `Capturing` with an already-acquired device.
    ///
    /// `user` is the authenticated user id; without one, the first capture aborts the session.
    pub fn start(device: D, matcher: M, user: Option<String>) -> Self {
        tracing::info!(user = ?user, "recognition session started");
        Self {
            device: Some(device),
            matcher,
            user,
            state: FlowState::Capturing,
        }
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Whether the capture device is still held.
    pub fn holds_device(&self) -> bool {
        self.device.is_some()
    }

    /// Capture a still and submit it to the matcher.
    ///
    /// On a device failure the session stays in `Capturing`. On a matcher
    /// failure the session moves to `NotRemembered` and the error is returned.
    pub async fn capture(&mut self, roster: &[Contact]) -> Result<&FlowState, FlowError> {
        self.ready_to_capture(FlowEvent::Captured(Vec::new()))?;

        let Some(user) = self.user.clone() else {
            tracing::warn!("capture without an authenticated user; aborting session");
            self.apply(FlowEvent::Abort("no authenticated user".into()), roster)?;
            return Err(FlowError::Auth);
        };

        let image = self.grab().await?;
        self.apply(FlowEvent::Captured(image.clone()), roster)?;

        match self.matcher.find_matches(&image, &user).await {
            Ok(candidates) => {
                tracing::info!(candidates = candidates.len(), "matcher answered");
                self.apply(FlowEvent::Matched(candidates), roster)?;
                Ok(&self.state)
            }
            Err(e) => {
                tracing::warn!(error = %e, "matcher call failed");
                self.apply(FlowEvent::MatchFailed(e.to_string()), roster)?;
                Err(FlowError::Network(e))
            }
        }
    }

    /// Capture a still and go straight to the "did you remember?" prompt.
    pub async fn capture_unassisted(&mut self) -> Result<&FlowState, FlowError> {
        self.ready_to_capture(FlowEvent::Captured(Vec::new()))?;
        let image = self.grab().await?;
        self.apply(FlowEvent::Captured(image), &[])?;
        self.apply(FlowEvent::SelfReported, &[])?;
        Ok(&self.state)
    }

    /// "Yes": the user names the contact in the picture.
    pub fn remembered(&mut self, contact_id: &str, roster: &[Contact]) -> Result<&FlowState, FlowError> {
        self.apply(FlowEvent::Recalled(contact_id.to_string()), roster)?;
        Ok(&self.state)
    }

    /// "No": end the session without recording anything.
    pub fn forgotten(&mut self) -> Result<&FlowState, FlowError> {
        self.apply(FlowEvent::Forgotten, &[])?;
        Ok(&self.state)
    }

    /// End the session and hand the captured image to contact creation.
    pub fn add_new(&mut self) -> Result<Vec<u8>, FlowError> {
        let image = self.state.image().map(<[u8]>::to_vec).unwrap_or_default();
        self.apply(FlowEvent::AddNew, &[])?;
        Ok(image)
    }

    /// Drop the image and candidate and return to `Capturing`.
    pub fn discard(&mut self) -> Result<&FlowState, FlowError> {
        self.apply(FlowEvent::Discard, &[])?;
        Ok(&self.state)
    }

    /// Commit a sighting of the recognized contact and end the session.
    ///
    /// If the store rejects the sighting the session stays in `Recognized`.
    pub fn save(
        &mut self,
        store: &mut ContactStore,
        location: Option<&str>,
        image_ref: Option<String>,
    ) -> Result<Contact, FlowError> {
        let FlowState::Recognized { candidate, .. } = &self.state else {
            return Err(invalid(&self.state, &FlowEvent::Saved));
        };
        let contact_id = candidate.contact_id.clone();

        let contact = store.record_sighting_with_image(&contact_id, location, image_ref)?;
        self.apply(FlowEvent::Saved, store.list())?;
        Ok(contact)
    }

    /// Abort the session. A no-op once it has ended.
    pub fn cancel(&mut self) {
        if self.state.is_ended() {
            return;
        }
        if let Err(e) = self.apply(FlowEvent::Cancel, &[]) {
            tracing::warn!(error = %e, "cancel rejected");
        }
    }

    fn ready_to_capture(&self, probe: FlowEvent) -> Result<(), FlowError> {
        match &self.state {
            FlowState::Capturing => Ok(()),
            FlowState::Processing { .. } => Err(FlowError::Busy),
            other => Err(invalid(other, &probe)),
        }
    }

    async fn grab(&mut self) -> Result<Vec<u8>, FlowError> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| FlowError::Device("capture device already released".into()))?;
        match device.capture().await {
            Ok(image) if !image.is_empty() => Ok(image),
            Ok(_) => Err(FlowError::Device("device returned an empty image".into())),
            Err(e) => {
                tracing::warn!(error = %e, "capture failed; still capturing");
                Err(FlowError::Device(e.0))
            }
        }
    }

    fn apply(&mut self, event: FlowEvent, roster: &[Contact]) -> Result<(), FlowError> {
        let from = self.state.name();
        let next = transition(&self.state, event, roster)?;
        tracing::debug!(from, to = next.name(), "flow transition");
        self.state = next;

        if let FlowState::Ended { disposition } = &self.state {
            if self.device.take().is_some() {
                tracing::info!(disposition = ?disposition, "session ended; capture device released");
            }
        }
        Ok(())
    }
}
