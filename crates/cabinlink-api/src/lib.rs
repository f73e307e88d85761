// cabinlink-api: async clients for the local hub, the portal, and the camera relay.

pub mod error;
pub mod hub;
pub mod model;
pub mod portal;
pub mod relay;
pub mod transport;

pub use error::Error;
pub use hub::HubClient;
pub use model::EntityState;
pub use portal::{AuthGrant, CabinCredentials, PortalClient, TunnelRequest, TunnelStatus, TunnelUpdate};
pub use relay::{RelayConfig, RelaySession, SessionState};
pub use transport::{TlsMode, TransportConfig};
