//! Typed XCMP request helpers (spec.md §4.5): issue one request over an
//! authenticated [`XnlSession`] and parse the reply into a structured
//! value instead of a raw byte slice.

use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::xcmp::codec::{
    self, PsdtAction, RadioStatusSelector, VersionInfoSelector, XcmpPacket,
};
use crate::xnl::session::{XnlSession, XnlSessionError};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PSDT_SIZE: u32 = 50 * 1024 * 1024;
/// Single-flight requests never accept a broadcast-class reply
/// (spec.md §4.5/§5); this bounds how many we'll skip past before
/// giving up, matching the session layer's own `MAX_RECV_ITERATIONS`.
const MAX_BROADCAST_SKIPS: usize = 10;

#[derive(Error, Debug)]
pub enum XcmpError {
    #[error(transparent)]
    Session(#[from] XnlSessionError),
    #[error("XCMP reply could not be parsed: {0}")]
    InvalidReply(String),
    #[error("radio reported error byte {0:#04x}")]
    RadioError(u8),
}

/// One read-class clone-data field of a channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloneDataType {
    ChannelName = 0x00,
    RxFrequency = 0x01,
    TxFrequency = 0x02,
    Flags = 0x03,
    Tones = 0x04,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloneFieldValue {
    Text(String),
    FrequencyTenHz(u32),
    Flags(u8),
    Tones(u16),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloneReadReply {
    pub zone: u16,
    pub channel: u16,
    pub data_type: u8,
    pub value: CloneFieldValue,
}

/// `(start, end)` of the `CP` PSDT partition, in radio address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsdtRange {
    pub start: u32,
    pub end: u32,
}

impl PsdtRange {
    pub fn size(&self) -> u32 {
        self.end - self.start
    }
}

/// Strips a UTF-8 string of C0 control characters and trailing NULs,
/// the way identify replies encode short human-readable fields.
fn clean_identity_string(bytes: &[u8]) -> String {
    let trimmed_end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..trimmed_end])
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect()
}

pub struct XcmpClient<'a, T> {
    session: &'a mut XnlSession<T>,
}

impl<'a, T> XcmpClient<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(session: &'a mut XnlSession<T>) -> Self {
        XcmpClient { session }
    }

    async fn exchange(&mut self, request: XcmpPacket) -> Result<XcmpPacket, XcmpError> {
        self.exchange_with_timeout(request, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    async fn exchange_with_timeout(
        &mut self,
        request: XcmpPacket,
        budget: Duration,
    ) -> Result<XcmpPacket, XcmpError> {
        let mut reply_bytes = self.session.send_xcmp(request.encode(), budget).await?;
        for _ in 0..MAX_BROADCAST_SKIPS {
            let reply = XcmpPacket::decode(&reply_bytes)
                .ok_or_else(|| XcmpError::InvalidReply("reply shorter than 2 bytes".into()))?;
            if !reply.is_broadcast() {
                return Ok(reply);
            }
            warn!(
                "ignoring broadcast-class XCMP reply {:#06x} while awaiting a single-flight response",
                reply.opcode
            );
            reply_bytes = self.session.recv_xcmp_reply(budget).await?;
        }
        Err(XcmpError::InvalidReply(
            "only broadcast-class replies received".into(),
        ))
    }

    /// Leading error byte of a one-byte-prefixed reply payload, per the
    /// `[err:1][...]` shape most engine-level XCMP replies share.
    fn require_success_byte(payload: &[u8]) -> Result<(), XcmpError> {
        match payload.first() {
            Some(0x00) => Ok(()),
            Some(&code) => Err(XcmpError::RadioError(code)),
            None => Err(XcmpError::InvalidReply("reply had an empty payload".into())),
        }
    }

    /// Issue one identify-group request, stripping the opcode and error
    /// byte, returning the raw remainder for the caller to interpret.
    async fn identify_field(&mut self, request: XcmpPacket) -> Result<Vec<u8>, XcmpError> {
        let reply = self.exchange(request).await?;
        if reply.payload.is_empty() {
            return Err(XcmpError::InvalidReply("empty identify reply".into()));
        }
        let error_byte = reply.payload[0];
        if error_byte != 0x00 {
            return Err(XcmpError::RadioError(error_byte));
        }
        Ok(reply.payload[1..].to_vec())
    }

    pub async fn model_number(&mut self) -> Result<String, XcmpError> {
        let bytes = self
            .identify_field(codec::radio_status_request(RadioStatusSelector::ModelNumber))
            .await?;
        Ok(clean_identity_string(&bytes))
    }

    pub async fn serial_number(&mut self) -> Result<String, XcmpError> {
        let bytes = self
            .identify_field(codec::radio_status_request(RadioStatusSelector::SerialNumber))
            .await?;
        Ok(clean_identity_string(&bytes))
    }

    pub async fn radio_id(&mut self) -> Result<u32, XcmpError> {
        let bytes = self
            .identify_field(codec::radio_status_request(RadioStatusSelector::RadioId))
            .await?;
        if bytes.len() < 3 {
            return Err(XcmpError::InvalidReply(
                "RadioID reply shorter than 3 bytes".into(),
            ));
        }
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub async fn firmware_version(&mut self) -> Result<String, XcmpError> {
        let bytes = self
            .identify_field(codec::version_info_request(VersionInfoSelector::Firmware))
            .await?;
        Ok(clean_identity_string(&bytes))
    }

    pub async fn codeplug_id(&mut self) -> Result<String, XcmpError> {
        let bytes = self
            .identify_field(codec::version_info_request(VersionInfoSelector::Codeplug))
            .await?;
        Ok(clean_identity_string(&bytes))
    }

    /// `CloneReadReply` per spec.md §4.5: reply shaped
    /// `[80 01][zone:2][80 02][channel:2][data_type:2][len:2][data...]`.
    pub async fn clone_read(
        &mut self,
        zone: u16,
        channel: u16,
        data_type: CloneDataType,
    ) -> Result<CloneReadReply, XcmpError> {
        let request = codec::clone_read_request(zone, channel, data_type as u8);
        let reply = self.exchange(request).await?;
        let p = &reply.payload;
        if p.len() < 12 {
            return Err(XcmpError::InvalidReply(
                "clone read reply shorter than fixed header".into(),
            ));
        }
        if p[0..2] != [0x80, 0x01] || p[4..6] != [0x80, 0x02] {
            return Err(XcmpError::InvalidReply(
                "clone read reply missing 80 01 / 80 02 markers".into(),
            ));
        }
        let reply_zone = u16::from_be_bytes([p[2], p[3]]);
        let reply_channel = u16::from_be_bytes([p[6], p[7]]);
        let reply_data_type = u16::from_be_bytes([p[8], p[9]]) as u8;
        let len = u16::from_be_bytes([p[10], p[11]]) as usize;
        let data = p.get(12..12 + len).ok_or_else(|| {
            XcmpError::InvalidReply("clone read reply data field shorter than declared len".into())
        })?;

        let value = match data_type {
            CloneDataType::ChannelName => {
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                CloneFieldValue::Text(
                    String::from_utf16_lossy(&units)
                        .trim_end_matches('\0')
                        .to_string(),
                )
            }
            CloneDataType::RxFrequency | CloneDataType::TxFrequency => {
                if data.len() < 4 {
                    return Err(XcmpError::InvalidReply(
                        "frequency field shorter than 4 bytes".into(),
                    ));
                }
                CloneFieldValue::FrequencyTenHz(u32::from_be_bytes([
                    data[0], data[1], data[2], data[3],
                ]))
            }
            CloneDataType::Flags => {
                if data.is_empty() {
                    return Err(XcmpError::InvalidReply("flags field was empty".into()));
                }
                CloneFieldValue::Flags(data[0])
            }
            CloneDataType::Tones => {
                if data.len() < 2 {
                    return Err(XcmpError::InvalidReply(
                        "tones field shorter than 2 bytes".into(),
                    ));
                }
                CloneFieldValue::Tones(u16::from_be_bytes([data[0], data[1]]))
            }
        };

        Ok(CloneReadReply {
            zone: reply_zone,
            channel: reply_channel,
            data_type: reply_data_type,
            value,
        })
    }

    async fn psdt_address(&mut self, action: PsdtAction, partition: &str) -> Result<u32, XcmpError> {
        let request = codec::psdt_access(action, partition, "");
        let reply = self.exchange(request).await?;
        if reply.payload.len() < 5 {
            return Err(XcmpError::InvalidReply(
                "PSDT address reply shorter than 5 bytes".into(),
            ));
        }
        if reply.payload[0] != 0x00 {
            return Err(XcmpError::RadioError(reply.payload[0]));
        }
        Ok(u32::from_be_bytes([
            reply.payload[1],
            reply.payload[2],
            reply.payload[3],
            reply.payload[4],
        ]))
    }

    /// Start/end of the `CP` partition with the `end > start`,
    /// `end - start <= 50 MB` invariant enforced here.
    pub async fn psdt_range(&mut self, partition: &str) -> Result<PsdtRange, XcmpError> {
        let start = self
            .psdt_address(PsdtAction::GetStartAddress, partition)
            .await?;
        let end = self
            .psdt_address(PsdtAction::GetEndAddress, partition)
            .await?;
        if end <= start {
            return Err(XcmpError::InvalidReply(format!(
                "PSDT range end {end:#010x} <= start {start:#010x}"
            )));
        }
        if end - start > MAX_PSDT_SIZE {
            return Err(XcmpError::InvalidReply(format!(
                "PSDT range {} exceeds 50 MB cap",
                end - start
            )));
        }
        Ok(PsdtRange { start, end })
    }

    pub async fn psdt_lock(&mut self, partition: &str) -> Result<(), XcmpError> {
        let reply = self.exchange(codec::psdt_access(PsdtAction::Lock, partition, "")).await?;
        Self::require_success_byte(&reply.payload)
    }

    pub async fn psdt_unlock(&mut self, partition: &str) -> Result<(), XcmpError> {
        let reply = self
            .exchange(codec::psdt_access(PsdtAction::Unlock, partition, ""))
            .await?;
        Self::require_success_byte(&reply.payload)
    }

    /// `cps_read_request`: reply is `[err:1][bytes...]`.
    pub async fn cps_read(&mut self, addr: u32, len: u16) -> Result<Vec<u8>, XcmpError> {
        let reply = self.exchange(codec::cps_read_request(addr, len)).await?;
        if reply.payload.is_empty() {
            return Err(XcmpError::InvalidReply("cps read reply had an empty payload".into()));
        }
        let error_byte = reply.payload[0];
        if error_byte != 0x00 {
            return Err(XcmpError::RadioError(error_byte));
        }
        Ok(reply.payload[1..].to_vec())
    }

    /// Component-session action, under an explicit time budget since some
    /// actions (CRC validation, unpack/deploy) run far longer than a
    /// routine request/reply.
    pub async fn component_session(
        &mut self,
        actions: codec::ComponentSessionActions,
        session_id: u16,
        extra: Option<u32>,
        budget: Duration,
    ) -> Result<(), XcmpError> {
        let reply = self
            .exchange_with_timeout(codec::component_session(actions, session_id, extra), budget)
            .await?;
        Self::require_success_byte(&reply.payload)
    }

    pub async fn radio_update_control(&mut self, action: u8) -> Result<(), XcmpError> {
        let reply = self.exchange(codec::radio_update_control(action)).await?;
        Self::require_success_byte(&reply.payload)
    }

    pub async fn transfer_data(&mut self, kind: u8, bytes: &[u8]) -> Result<(), XcmpError> {
        let reply = self.exchange(codec::transfer_data(kind, bytes)).await?;
        Self::require_success_byte(&reply.payload)
    }

    /// Issue `CodeplugRead` for one batch of record IDs and return the raw
    /// reply payload (the concatenated record frames of spec.md §4.6).
    pub async fn codeplug_read(&mut self, record_ids: &[u16]) -> Result<Vec<u8>, XcmpError> {
        let reply = self.exchange(codec::codeplug_read_request(record_ids)).await?;
        Ok(reply.payload)
    }
}
