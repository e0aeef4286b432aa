//! The daemon's single recognition session.
//!
//! At most one session exists at a time. It remembers the bus name that
//! started it so a session abandoned by a client that has left the bus can
//! be replaced. `cancel` reaches a capture that is still waiting on the
//! camera or the matcher without queueing behind it.

use memwar_core::{CaptureDevice, Contact, FlowError, FlowState, Matcher, RecognitionFlow};
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already active")]
    Active,
    #[error("a capture is in progress")]
    Busy,
    #[error("no active session; call StartSession first")]
    NoSession,
    #[error("capture device: {0}")]
    Device(String),
    #[error(transparent)]
    Flow(#[from] FlowError),
}

pub struct Session<D, M> {
    /// Unique bus name of the client that started the session.
    owner: Option<String>,
    flow: RecognitionFlow<D, M>,
}

pub struct SessionSlot<D, M> {
    active: Mutex<Option<Session<D, M>>>,
    cancel: Notify,
}

impl<D: CaptureDevice, M: Matcher> SessionSlot<D, M> {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            cancel: Notify::new(),
        }
    }

    /// Begin a session for `owner` with the device `acquire` yields.
    ///
    /// A live session blocks this unless it belongs to another client and
    /// `is_connected` reports that client gone; the stale session is then
    /// cancelled and its device released before `acquire` runs.
    pub async fn start<A, E, C, CF>(
        &self,
        owner: Option<String>,
        is_connected: C,
        acquire: A,
        matcher: M,
        user: Option<String>,
    ) -> Result<FlowState, SessionError>
    where
        A: Future<Output = Result<D, E>>,
        E: Display,
        C: FnOnce(String) -> CF,
        CF: Future<Output = bool>,
    {
        let mut slot = self.active.try_lock().map_err(|_| SessionError::Busy)?;

        if let Some(current) = slot.as_ref().filter(|s| !s.flow.state().is_ended()) {
            let stale = match &current.owner {
                Some(prev) if owner.as_deref() != Some(prev.as_str()) => !is_connected(prev.clone()).await,
                _ => false,
            };
            if !stale {
                return Err(SessionError::Active);
            }
            tracing::info!(owner = ?current.owner, "replacing session of a client that left the bus");
        }
        if let Some(mut previous) = slot.take() {
            previous.flow.cancel();
        }

        let device = acquire.await.map_err(|e| SessionError::Device(e.to_string()))?;
        let flow = RecognitionFlow::start(device, matcher, user);
        let state = flow.state().clone();
        *slot = Some(Session { owner, flow });
        Ok(state)
    }

    /// Capture a still and, when `assisted`, run it through the matcher.
    ///
    /// Returns the new state plus the matcher's error when the flow fell
    /// back to asking the user. A concurrent capture gets `Busy`.
    pub async fn capture(
        &self,
        roster: &[Contact],
        assisted: bool,
    ) -> Result<(FlowState, Option<String>), SessionError> {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        let mut slot = self.active.try_lock().map_err(|_| SessionError::Busy)?;
        let flow = flow_mut(&mut *slot)?;

        let outcome = tokio::select! {
            result = step(&mut *flow, roster, assisted) => Some(result),
            _ = &mut cancelled => None,
        };

        match outcome {
            None => {
                flow.cancel();
                tracing::info!("capture cancelled while in flight");
                Ok((flow.state().clone(), None))
            }
            Some(Ok(())) => Ok((flow.state().clone(), None)),
            Some(Err(e @ FlowError::Network(_))) => Ok((flow.state().clone(), Some(e.to_string()))),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// End the session, aborting a capture in flight. `None` when there never was one.
    pub async fn cancel(&self) -> Option<FlowState> {
        self.cancel.notify_waiters();
        let mut slot = self.active.lock().await;
        slot.as_mut().map(|s| {
            s.flow.cancel();
            s.flow.state().clone()
        })
    }

    /// Current state without waiting; `Busy` while a capture holds the session.
    pub fn state(&self) -> Result<Option<FlowState>, SessionError> {
        let slot = self.active.try_lock().map_err(|_| SessionError::Busy)?;
        Ok(slot.as_ref().map(|s| s.flow.state().clone()))
    }

    pub async fn lock(&self) -> MutexGuard<'_, Option<Session<D, M>>> {
        self.active.lock().await
    }
}

/// The live flow in `slot`.
pub fn flow_mut<D, M>(slot: &mut Option<Session<D, M>>) -> Result<&mut RecognitionFlow<D, M>, SessionError> {
    match slot.as_mut() {
        Some(s) if !s.flow.state().is_ended() => Ok(&mut s.flow),
        _ => Err(SessionError::NoSession),
    }
}

async fn step<D: CaptureDevice, M: Matcher>(
    flow: &mut RecognitionFlow<D, M>,
    roster: &[Contact],
    assisted: bool,
) -> Result<(), FlowError> {
    if assisted {
        flow.capture(roster).await?;
    } else {
        flow.capture_unassisted().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memwar_core::{Candidate, CaptureError, Disposition, MatchError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct CountingDevice {
        released: Arc<AtomicUsize>,
    }

    impl Drop for CountingDevice {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CaptureDevice for CountingDevice {
        async fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
            Ok(vec![0xFF, 0xD8, 0x01])
        }
    }

    /// Never answers.
    struct StalledMatcher;

    impl Matcher for StalledMatcher {
        async fn find_matches(&self, _image: &[u8], _user: &str) -> Result<Vec<Candidate>, MatchError> {
            std::future::pending().await
        }
    }

    type Slot = SessionSlot<CountingDevice, StalledMatcher>;

    fn device() -> (CountingDevice, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        (CountingDevice { released: released.clone() }, released)
    }

    async fn start(slot: &Slot, owner: &str, connected: bool, device: CountingDevice) -> Result<FlowState, SessionError> {
        slot.start(
            Some(owner.to_string()),
            move |_| async move { connected },
            async { Ok::<_, String>(device) },
            StalledMatcher,
            Some("alice".into()),
        )
        .await
    }

    /// Spawn an assisted capture and wait until it holds the session.
    async fn capture_in_flight(slot: &Arc<Slot>) -> tokio::task::JoinHandle<Result<(FlowState, Option<String>), SessionError>> {
        let task = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.capture(&[], true).await })
        };
        while slot.state().is_ok() {
            tokio::task::yield_now().await;
        }
        task
    }

    #[tokio::test]
    async fn test_second_start_is_refused_while_owner_connected() {
        let slot = Slot::new();
        let (first, released) = device();
        start(&slot, ":1.5", true, first).await.unwrap();

        let (second, _) = device();
        let err = start(&slot, ":1.6", true, second).await.unwrap_err();
        assert!(matches!(err, SessionError::Active));
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_session_is_replaced_and_released() {
        let slot = Slot::new();
        let (first, released) = device();
        start(&slot, ":1.5", true, first).await.unwrap();

        // :1.5 exited without cancelling
        let (second, _) = device();
        let state = start(&slot, ":1.6", false, second).await.unwrap();
        assert_eq!(state, FlowState::Capturing);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ended_session_does_not_block_start() {
        let slot = Slot::new();
        let (first, _) = device();
        start(&slot, ":1.5", true, first).await.unwrap();
        slot.cancel().await.unwrap();

        let (second, _) = device();
        assert!(start(&slot, ":1.5", true, second).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_capture_is_busy() {
        let slot = Arc::new(Slot::new());
        let (dev, _) = device();
        start(&slot, ":1.5", true, dev).await.unwrap();

        let task = capture_in_flight(&slot).await;
        let err = slot.capture(&[], true).await.unwrap_err();
        assert!(matches!(err, SessionError::Busy));
        assert!(matches!(slot.state(), Err(SessionError::Busy)));

        slot.cancel().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_capture_waiting_on_matcher() {
        let slot = Arc::new(Slot::new());
        let (dev, released) = device();
        start(&slot, ":1.5", true, dev).await.unwrap();

        let task = capture_in_flight(&slot).await;
        let state = tokio::time::timeout(Duration::from_secs(2), slot.cancel())
            .await
            .expect("cancel queued behind the matcher")
            .unwrap();
        let cancelled = FlowState::Ended {
            disposition: Disposition::Cancelled,
        };
        assert_eq!(state, cancelled);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let (captured, error) = task.await.unwrap().unwrap();
        assert_eq!(captured, cancelled);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_capture_without_session() {
        let slot = Slot::new();
        assert!(matches!(slot.capture(&[], true).await, Err(SessionError::NoSession)));
        assert!(slot.cancel().await.is_none());
        assert!(slot.state().unwrap().is_none());
    }
}
