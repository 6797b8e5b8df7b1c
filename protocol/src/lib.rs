//! Data model shared between the agent daemon and the user CLI.
//!
//! Everything that crosses the discussion log lives here so that the two
//! binaries agree on the wire format without depending on each other.

mod discussion;
mod message;

pub use discussion::DiscussionStatus;
pub use message::Message;
pub use message::Opinion;
pub use message::Payload;
pub use message::StatusKind;
pub use message::USER_SENDER;
pub use message::WORKING_DIR_KEY;
pub use message::now_rfc3339;
