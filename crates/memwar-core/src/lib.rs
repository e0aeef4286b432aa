//! memwar-core: contact roster, sighting log and the recognition flow.
//!
//! The [`ContactStore`] owns the roster and persists it through a
//! [`Storage`] backend. A [`RecognitionFlow`] drives one capture session
//! against a [`Matcher`] and commits sightings into the store.

pub mod flow;
pub mod matcher;
pub mod storage;
pub mod store;
pub mod types;

pub use flow::{CaptureDevice, CaptureError, Disposition, FlowError, FlowState, RecognitionFlow};
pub use matcher::{MatchError, Matcher, RemoteMatcher};
pub use storage::{MemoryStorage, SqliteStorage, Storage, StorageError};
pub use store::{ContactStore, StoreError, StoreEvent, RECENT_LIMIT};
pub use types::{Candidate, Contact, ContactDraft, ContactPatch, Sighting};
