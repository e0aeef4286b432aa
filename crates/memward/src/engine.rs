use memwar_core::{CaptureDevice, CaptureError};
use memwar_hw::{Camera, CameraError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("camera is already held by another session")]
    Busy,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Open {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snap {
        reply: oneshot::Sender<Result<Vec<u8>, EngineError>>,
    },
    Close,
}

/// Capture settings applied by the engine thread.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub camera_device: String,
    pub warmup_frames: usize,
    pub capture_attempts: usize,
    pub jpeg_quality: u8,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineRequest>,
}

impl EngineHandle {
    /// Open the camera for one session. The returned lease closes it on drop.
    pub async fn acquire(&self) -> Result<CameraLease, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Open { reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(CameraLease { tx: self.tx.clone() })
    }
}

/// Exclusive use of the camera for the lifetime of a recognition session.
pub struct CameraLease {
    tx: mpsc::UnboundedSender<EngineRequest>,
}

impl CameraLease {
    async fn snap(&self) -> Result<Vec<u8>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snap { reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

impl CaptureDevice for CameraLease {
    async fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
        self.snap().await.map_err(|e| CaptureError(e.to_string()))
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        // The engine may already be gone during shutdown.
        let _ = self.tx.send(EngineRequest::Close);
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera is opened lazily when a session acquires it and closed when
/// the lease is dropped, so the device is free between sessions.
pub fn spawn_engine(settings: EngineSettings) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<EngineRequest>();

    std::thread::Builder::new()
        .name("memwar-engine".into())
        .spawn(move || {
            tracing::info!(device = %settings.camera_device, "engine thread started");
            let mut camera: Option<Camera> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Open { reply } => {
                        let result = if camera.is_some() {
                            Err(EngineError::Busy)
                        } else {
                            open_camera(&settings).map(|c| {
                                camera = Some(c);
                            })
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Snap { reply } => {
                        let result = match &camera {
                            Some(c) => c
                                .snap_jpeg(settings.capture_attempts, settings.jpeg_quality)
                                .map_err(EngineError::from),
                            None => Err(EngineError::Camera(CameraError::DeviceNotFound(
                                "camera not opened for this session".into(),
                            ))),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Close => {
                        if camera.take().is_some() {
                            tracing::info!("camera released");
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn open_camera(settings: &EngineSettings) -> Result<Camera, EngineError> {
    let camera = Camera::open(&settings.camera_device)?;
    if let Err(e) = camera.warm_up(settings.warmup_frames) {
        tracing::warn!(error = %e, "warmup failed; capturing anyway");
    }
    Ok(camera)
}
