//! ttyhub-core: shared protocol library for the ttyhub PTY multiplexer.
//!
//! Provides the in-band event codec, typed viewer events, outbound control
//! sequences, the growable staging buffer and 28-bit wraparound counters.

pub mod buffer;
pub mod codec;
pub mod counter;
pub mod error;
pub mod event;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use buffer::GrowBuf;
pub use codec::{EventDecoder, Inbound};
pub use error::{HubError, HubResult};
pub use event::{Geometry, ViewerEvent};
pub use protocol::{DetachCode, LocalModes, PROTOCOL_VERSION};
