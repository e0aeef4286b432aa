use crate::engine::{CameraLease, EngineHandle};
use crate::session::{flow_mut, SessionError, SessionSlot};
use memwar_core::{
    ContactDraft, ContactPatch, ContactStore, FlowError, FlowState, RemoteMatcher, StoreError, StoreEvent,
    RECENT_LIMIT,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use zbus::interface;
use zbus::message::Header;
use zbus::names::BusName;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.memwar.Memwar1";
pub const OBJECT_PATH: &str = "/org/memwar/Memwar1";

type Sessions = SessionSlot<CameraLease, RemoteMatcher>;

/// D-Bus interface for the memwar daemon.
///
/// Bus name: org.memwar.Memwar1
/// Object path: /org/memwar/Memwar1
pub struct MemwarService {
    store: Arc<Mutex<ContactStore>>,
    engine: EngineHandle,
    matcher: RemoteMatcher,
    session: Sessions,
    user: Option<String>,
    snap_dir: PathBuf,
    default_location: Option<String>,
    camera_device: String,
}

pub struct ServiceParts {
    pub store: Arc<Mutex<ContactStore>>,
    pub engine: EngineHandle,
    pub matcher: RemoteMatcher,
    pub user: Option<String>,
    pub snap_dir: PathBuf,
    pub default_location: Option<String>,
    pub camera_device: String,
}

impl MemwarService {
    pub fn new(parts: ServiceParts) -> Self {
        Self {
            store: parts.store,
            engine: parts.engine,
            matcher: parts.matcher,
            session: SessionSlot::new(),
            user: parts.user,
            snap_dir: parts.snap_dir,
            default_location: parts.default_location,
            camera_device: parts.camera_device,
        }
    }

    /// Save a captured image under the snap directory and return its path.
    async fn write_snap(&self, image: &[u8]) -> zbus::fdo::Result<String> {
        let path = self.snap_dir.join(format!("{}.jpg", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&self.snap_dir)
            .await
            .map_err(|e| zbus::fdo::Error::IOError(format!("{}: {e}", self.snap_dir.display())))?;
        tokio::fs::write(&path, image)
            .await
            .map_err(|e| zbus::fdo::Error::IOError(format!("{}: {e}", path.display())))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

#[interface(name = "org.memwar.Memwar1")]
impl MemwarService {
    /// Full roster as a JSON array, in insertion order.
    async fn list_contacts(&self) -> zbus::fdo::Result<String> {
        let store = self.store.lock().await;
        to_json(&store.list())
    }

    /// Up to `n` contacts, most recently seen first. `0` uses the dashboard default.
    async fn recent_contacts(&self, n: u32) -> zbus::fdo::Result<String> {
        let n = if n == 0 { RECENT_LIMIT } else { n as usize };
        let store = self.store.lock().await;
        to_json(&store.recent(n))
    }

    async fn search_contacts(&self, query: &str) -> zbus::fdo::Result<String> {
        let store = self.store.lock().await;
        to_json(&store.search(query))
    }

    async fn get_contact(&self, id: &str) -> zbus::fdo::Result<String> {
        let store = self.store.lock().await;
        to_json(store.get(id).map_err(store_error)?)
    }

    /// Create a contact from a JSON draft; returns the stored contact.
    async fn create_contact(&self, draft: &str) -> zbus::fdo::Result<String> {
        let draft: ContactDraft = serde_json::from_str(draft)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("malformed contact: {e}")))?;
        let mut store = self.store.lock().await;
        to_json(&store.create(draft).map_err(store_error)?)
    }

    async fn update_contact(&self, id: &str, patch: &str) -> zbus::fdo::Result<String> {
        let patch: ContactPatch = serde_json::from_str(patch)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("malformed patch: {e}")))?;
        let mut store = self.store.lock().await;
        to_json(&store.update(id, patch).map_err(store_error)?)
    }

    async fn delete_contact(&self, id: &str) -> zbus::fdo::Result<String> {
        let mut store = self.store.lock().await;
        to_json(&store.delete(id).map_err(store_error)?)
    }

    /// Record a sighting without going through a capture session.
    async fn record_sighting(&self, id: &str, location: &str) -> zbus::fdo::Result<String> {
        let location = self.location_or_default(location);
        let mut store = self.store.lock().await;
        to_json(&store.record_sighting(id, location.as_deref()).map_err(store_error)?)
    }

    /// Sighting log, oldest first. An empty id returns every entry.
    async fn sightings(&self, id: &str) -> zbus::fdo::Result<String> {
        let filter = (!id.is_empty()).then_some(id);
        let store = self.store.lock().await;
        to_json(&store.sightings(filter))
    }

    /// Open the camera and begin a recognition session.
    ///
    /// A session left behind by a client that is no longer on the bus is replaced.
    async fn start_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let owner = header.sender().map(|name| name.to_string());
        let conn = conn.clone();
        let state = self
            .session
            .start(
                owner,
                move |name| async move { is_connected(&conn, &name).await },
                self.engine.acquire(),
                self.matcher.clone(),
                self.user.clone(),
            )
            .await
            .map_err(session_error)?;
        session_json(&state, None)
    }

    /// Capture a still and run it through the matcher.
    async fn capture(&self) -> zbus::fdo::Result<String> {
        let roster = self.store.lock().await.list().to_vec();
        let (state, error) = self.session.capture(&roster, true).await.map_err(session_error)?;
        // On a matcher failure the flow asks whether the user remembers; report both.
        session_json(&state, error)
    }

    /// Capture a still and skip matching: the user will say who it is.
    async fn capture_unassisted(&self) -> zbus::fdo::Result<String> {
        let (state, _) = self.session.capture(&[], false).await.map_err(session_error)?;
        session_json(&state, None)
    }

    /// "Yes, I remember": the face belongs to contact `id`.
    async fn remembered(&self, id: &str) -> zbus::fdo::Result<String> {
        let roster = self.store.lock().await.list().to_vec();
        let mut slot = self.session.lock().await;
        let flow = flow_mut(&mut *slot).map_err(session_error)?;
        let state = flow.remembered(id, &roster).map_err(flow_error)?;
        session_json(state, None)
    }

    /// "No, I didn't": end the session without recording anything.
    async fn forgotten(&self) -> zbus::fdo::Result<String> {
        let mut slot = self.session.lock().await;
        let flow = flow_mut(&mut *slot).map_err(session_error)?;
        let state = flow.forgotten().map_err(flow_error)?;
        session_json(state, None)
    }

    /// End the session and keep the snap as the avatar of a contact about to be created.
    ///
    /// Returns the path of the saved image.
    async fn add_new(&self) -> zbus::fdo::Result<String> {
        let mut slot = self.session.lock().await;
        let flow = flow_mut(&mut *slot).map_err(session_error)?;
        let image = flow.add_new().map_err(flow_error)?;
        if image.is_empty() {
            return Ok(String::new());
        }
        self.write_snap(&image).await
    }

    /// Commit a sighting of the recognized contact; returns the updated contact.
    async fn save(&self, location: &str) -> zbus::fdo::Result<String> {
        let mut slot = self.session.lock().await;
        let flow = flow_mut(&mut *slot).map_err(session_error)?;
        let image = match flow.state() {
            FlowState::Recognized { image, .. } => image.clone(),
            other => {
                return Err(flow_error(FlowError::InvalidTransition {
                    state: other.name(),
                    event: "save",
                }))
            }
        };

        let image_ref = self.write_snap(&image).await?;
        let location = self.location_or_default(location);
        let mut store = self.store.lock().await;
        match flow.save(&mut store, location.as_deref(), Some(image_ref.clone())) {
            Ok(contact) => to_json(&contact),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&image_ref).await {
                    tracing::warn!(path = %image_ref, error = %rm, "failed to remove unsaved snap");
                }
                Err(flow_error(e))
            }
        }
    }

    /// Drop the current snap and return to capturing.
    async fn discard(&self) -> zbus::fdo::Result<String> {
        let mut slot = self.session.lock().await;
        let flow = flow_mut(&mut *slot).map_err(session_error)?;
        let state = flow.discard().map_err(flow_error)?;
        session_json(state, None)
    }

    /// Abort the session and release the camera, even mid-capture.
    async fn cancel(&self) -> zbus::fdo::Result<String> {
        match self.session.cancel().await {
            Some(state) => session_json(&state, None),
            None => Ok(serde_json::json!({ "state": "idle" }).to_string()),
        }
    }

    async fn session_state(&self) -> zbus::fdo::Result<String> {
        match self.session.state() {
            Ok(Some(state)) => session_json(&state, None),
            Ok(None) => Ok(serde_json::json!({ "state": "idle" }).to_string()),
            Err(_) => Ok(serde_json::json!({ "state": "processing" }).to_string()),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (scope, contacts, sightings) = {
            let store = self.store.lock().await;
            (store.scope().to_string(), store.list().len(), store.sightings(None).len())
        };
        let session = match self.session.state() {
            Ok(state) => state.as_ref().map_or("idle", FlowState::name),
            Err(_) => "processing",
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "matcher": self.matcher.endpoint(),
            "user": self.user,
            "scope": scope,
            "contacts": contacts,
            "sightings": sightings,
            "session": session,
        })
        .to_string())
    }

    /// Emitted after every roster mutation.
    #[zbus(signal)]
    async fn contacts_changed(emitter: &SignalEmitter<'_>, kind: &str, id: &str) -> zbus::Result<()>;
}

impl MemwarService {
    fn location_or_default(&self, location: &str) -> Option<String> {
        let trimmed = location.trim();
        if trimmed.is_empty() {
            self.default_location.clone()
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Re-emit store events as `ContactsChanged` signals until the store goes away.
pub async fn forward_store_events(connection: zbus::Connection, mut events: broadcast::Receiver<StoreEvent>) {
    let emitter = match SignalEmitter::new(&connection, OBJECT_PATH) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit ContactsChanged signals");
            return;
        }
    };
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = MemwarService::contacts_changed(&emitter, event.kind(), event.contact_id()).await {
                    tracing::warn!(error = %e, "failed to emit ContactsChanged");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "store events dropped before they could be signalled");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Whether `name` still has an owner on the bus. Errors count as connected.
async fn is_connected(conn: &zbus::Connection, name: &str) -> bool {
    let Ok(bus_name) = BusName::try_from(name) else {
        return false;
    };
    let dbus = match zbus::fdo::DBusProxy::new(conn).await {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::warn!(error = %e, "cannot query the bus; keeping the current session");
            return true;
        }
    };
    dbus.name_has_owner(bus_name).await.unwrap_or(true)
}

fn session_json(state: &FlowState, error: Option<String>) -> zbus::fdo::Result<String> {
    let mut value = serde_json::to_value(state).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    value["display"] = serde_json::json!(state.display_text());
    if let Some(message) = error {
        value["error"] = serde_json::json!(message);
    }
    Ok(value.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn store_error(e: StoreError) -> zbus::fdo::Error {
    match e {
        StoreError::Validation(msg) => zbus::fdo::Error::InvalidArgs(msg),
        StoreError::NotFound(id) => zbus::fdo::Error::UnknownObject(format!("contact not found: {id}")),
        other => {
            tracing::error!(error = %other, "store failure");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn flow_error(e: FlowError) -> zbus::fdo::Error {
    tracing::info!(error = %e, "flow request rejected");
    match e {
        FlowError::Store(inner) => store_error(inner),
        FlowError::Auth => zbus::fdo::Error::AuthFailed(e.to_string()),
        FlowError::Busy => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        FlowError::InvalidTransition { .. } => zbus::fdo::Error::NotSupported(e.to_string()),
        FlowError::Device(_) | FlowError::Network(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn session_error(e: SessionError) -> zbus::fdo::Error {
    match e {
        SessionError::Flow(inner) => flow_error(inner),
        SessionError::Active | SessionError::Busy => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        SessionError::NoSession => zbus::fdo::Error::Failed(e.to_string()),
        SessionError::Device(_) => {
            tracing::warn!(error = %e, "camera unavailable");
            zbus::fdo::Error::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memwar_core::{Candidate, Disposition};

    #[test]
    fn test_session_json_includes_display_and_error() {
        let state = FlowState::Recognized {
            image: vec![1, 2, 3],
            candidate: Candidate {
                contact_id: "1".into(),
                name: "Samantha R.".into(),
                relationship: "Wife".into(),
                avatar: None,
                confidence: 0.9,
            },
            last_seen: Some("6pm • Golden Gate".into()),
        };
        let raw = session_json(&state, Some("late".into())).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["state"], "recognized");
        assert_eq!(v["candidate"]["contactId"], "1");
        assert_eq!(v["display"], "Your wife — last seen 6pm • Golden Gate");
        assert_eq!(v["error"], "late");
        assert!(v.get("image").is_none());
    }

    #[test]
    fn test_session_json_ended() {
        let state = FlowState::Ended {
            disposition: Disposition::Saved { contact_id: "2".into() },
        };
        let v: serde_json::Value = serde_json::from_str(&session_json(&state, None).unwrap()).unwrap();
        assert_eq!(v["state"], "ended");
        assert_eq!(v["disposition"]["kind"], "saved");
        assert_eq!(v["disposition"]["contactId"], "2");
        assert!(v["display"].is_null());
    }

    #[test]
    fn test_store_errors_map_to_dbus_errors() {
        assert!(matches!(
            store_error(StoreError::Validation("name is required".into())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            store_error(StoreError::NotFound("9".into())),
            zbus::fdo::Error::UnknownObject(_)
        ));
        assert!(matches!(flow_error(FlowError::Auth), zbus::fdo::Error::AuthFailed(_)));
        assert!(matches!(flow_error(FlowError::Busy), zbus::fdo::Error::LimitsExceeded(_)));
    }

    #[test]
    fn test_session_errors_map_to_dbus_errors() {
        assert!(matches!(session_error(SessionError::Active), zbus::fdo::Error::LimitsExceeded(_)));
        assert!(matches!(session_error(SessionError::Busy), zbus::fdo::Error::LimitsExceeded(_)));
        assert!(matches!(
            session_error(SessionError::Flow(FlowError::Auth)),
            zbus::fdo::Error::AuthFailed(_)
        ));
        assert!(matches!(
            session_error(SessionError::Device("gone".into())),
            zbus::fdo::Error::Failed(m) if m.contains("gone")
        ));
    }
}
