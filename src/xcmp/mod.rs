//! XCMP command layer: opcode taxonomy and packet codec (§4.4), plus
//! typed request/reply helpers built on top of an XNL session (§4.5).

pub mod client;
pub mod codec;

pub use client::{CloneDataType, CloneFieldValue, CloneReadReply, PsdtRange, XcmpClient, XcmpError};
pub use codec::{ComponentSessionActions, PsdtAction, RadioStatusSelector, VersionInfoSelector, XcmpPacket};
