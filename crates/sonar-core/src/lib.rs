pub mod artifact;
pub mod device;
pub mod frames;
pub mod ids;
pub mod time;

pub use artifact::ArtifactEvent;
pub use device::DeviceName;
pub use frames::{ClientFrame, FrameError, ServerFrame};
pub use ids::ConnectionId;
