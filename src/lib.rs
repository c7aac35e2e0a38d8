pub mod config;
pub mod mesh;

pub use config::Config;
pub use mesh::{
    IncomingUrl, MeshConfig, MeshError, PeerCoordinator, PeerSnapshot, RelayStatus,
    SignalingTransport,
};
