//! replikv Placement - membership and replica placement
//!
//! Cluster membership and failure detection live outside replikv. This
//! crate defines the seam the replication core consumes ([`Membership`])
//! and ships a static, in-process implementation that places each key's
//! replica with rendezvous (HRW) hashing.
//!
//! # Example
//! ```ignore
//! use replikv_placement::{Membership, StaticMembership};
//!
//! let members = StaticMembership::new("node-a", ["node-a", "node-b", "node-c"]);
//! let replica = members.mapped_instance("sessions", "user:42")?;
//! assert_ne!(replica.as_str(), "node-a");
//! ```

pub mod hrw;
pub mod membership;
pub mod topology;

pub use hrw::HrwPlacement;
pub use membership::{Membership, StaticMembership};
pub use topology::{ClusterView, MemberInfo, MemberStatus};
