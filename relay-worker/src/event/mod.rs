//! Event types consumed from collaborators and the canonical wire envelope.
//!
//! ## Wire format
//!
//! ```text
//! {"id":"E1","type":"workflow.completed","timestamp":"2024-01-01T00:00:00.000Z","data":{...}}
//! ```
//!
//! The envelope bytes are produced once and used both as the HMAC input and
//! as the HTTP body, so the signature always covers exactly what is sent.

pub mod envelope;
pub mod types;

pub use envelope::{canonical_envelope, canonicalize};
pub use types::{Event, EventType};
