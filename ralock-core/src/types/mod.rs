mod primitives;
mod request;

pub use primitives::{NodeId, Timestamp};
pub use request::{Message, Outbound, Phase, RequestRecord, SendOutcome};
