//! XNL framed transport: frame encode/decode (§4.2) plus the session
//! that carries address assignment, TEA authentication, and duplex
//! request/reply exchange (§4.3).

pub mod frame;
pub mod session;

pub use frame::{XnlFrame, XnlFrameError, HEADER_LEN};
pub use session::{XnlOpcode, XnlSession, XnlSessionError};

/// Default TCP port for MOTOTRBO/TETRA XNL+XCMP traffic (spec.md §6).
pub const DEFAULT_XNL_PORT: u16 = 8002;
