//! Response translation from the upstream chat completion shape to the one
//! callers expect.
//!
//! Everything here is independent of HTTP: the relays consume byte streams or
//! byte buffers and produce bytes or JSON values.

pub mod reasoning;
pub mod response;
pub mod sse;
pub mod streaming;
