mod distribution;
mod registry;
mod service;
mod session;

pub use distribution::{EncryptedDistribution, MemberKeyData, SpaceKeyDistribution};
pub use registry::{SharedSession, SpaceSessionRegistry};
pub use service::{LocalSpaceService, SpaceDirectory, SpaceKeyService, SpaceServiceError};
pub use session::{
    DistributionDecision, EncryptedSpaceSession, PendingRotation, SessionError, SessionReport, SessionState,
};

/*
 * Space sessions
 *
 * Each space a member belongs to gets one encrypted session: an outbound
 * sender-key chain owned by the member plus one inbound chain per peer,
 * seeded from the peers' distribution messages. Distributions travel sealed
 * to each recipient's identity key.
 */
