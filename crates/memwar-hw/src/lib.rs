//! memwar-hw: camera access for snapping a still of someone's face.
//!
//! Opens a V4L2 capture device, grabs a frame that is not too dark to be
//! useful, and encodes it as a JPEG for the matcher.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::Frame;
