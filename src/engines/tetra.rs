//! TETRA RP/data-transfer engine (spec.md §4.7): framed, checksummed
//! read/write of radio memory with programming-mode gating.

use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::engines::{Engine, ProgressCallback, RadioIdentification};
use crate::model::ParsedCodeplug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BLOCK_LEN: u16 = 1024;
const WRITE_BLOCK_LEN: u16 = 512;
const FALLBACK_WINDOW_START: u32 = 0x0001_0000;
const FALLBACK_WINDOW_END: u32 = 0x0010_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RpOpcode {
    StatusIndication = 0x00,
    ParameterVersionRequest = 0x01,
    ParameterVersionConfirm = 0x02,
    ResetRequest = 0x03,
    ParameterVersionReply = 0x04,
    RejectIndication = 0x05,
    TerminalIdRequest = 0x06,
    TerminalIdConfirm = 0x07,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetMode {
    Normal = 0x00,
    Charging = 0x01,
    Programming = 0x02,
    RpMode = 0x03,
}

pub const READ_DATA_REQUEST: u16 = 0xF511;
pub const READ_DATA_REPLY: u16 = 0xFF80;
pub const EXTENDED_READ_REQUEST: u16 = 0xF741;
pub const EXTENDED_READ_REPLY: u16 = 0xFFB0;
pub const WRITE_DATA_REQUEST: u16 = 0xFF17;
pub const EXTENDED_WRITE_REQUEST: u16 = 0xFF47;
pub const GOOD_WRITE_REPLY: u16 = 0xF484;
pub const BAD_WRITE_REPLY: u16 = 0xF485;
pub const EXTENDED_GOOD_WRITE_REPLY: u16 = 0xF5B4;
pub const EXTENDED_BAD_WRITE_REPLY: u16 = 0xF5B5;
pub const CHECKSUM_REQUEST: u16 = 0xF612;
pub const CHECKSUM_REPLY: u16 = 0xF381;
pub const EXTENDED_CHECKSUM_REQUEST: u16 = 0xF613;
pub const EXTENDED_CHECKSUM_REPLY: u16 = 0xF382;
pub const CONFIGURATION_REQUEST: u16 = 0xF113;
pub const UNSUPPORTED_OPCODE_REPLY: u16 = 0xF186;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TetraError {
    #[error("connection error: {0}")]
    ConnectionFailed(String),
    #[error("timed out waiting for expected frame")]
    Timeout,
    #[error("command rejected with code {0:#04x}")]
    CommandRejected(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("read failure at address {0:#010x}")]
    ReadFailure(u32),
    #[error("write failure at address {0:#010x}")]
    WriteFailure(u32),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One TETRA data message: `[len:2 BE][opcode:2 BE][address:4 LE][length:2 LE][data...][cksum:2 BE]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetraFrame {
    pub opcode: u16,
    pub address: u32,
    pub data: Vec<u8>,
}

/// `0xFFFF XOR (sum mod 0x10000)` over the frame body (opcode through data).
fn checksum(body: &[u8]) -> u16 {
    let sum: u32 = body.iter().map(|&b| b as u32).sum();
    0xFFFF ^ ((sum % 0x1_0000) as u16)
}

impl TetraFrame {
    pub fn new(opcode: u16, address: u32, data: Vec<u8>) -> Self {
        TetraFrame { opcode, address, data }
    }

    fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.data.len());
        body.extend_from_slice(&self.opcode.to_be_bytes());
        body.extend_from_slice(&self.address.to_le_bytes());
        body.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let len = (2 + body.len() + 2) as u16;
        let mut out = Vec::with_capacity(len as usize);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum(&body).to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<TetraFrame, TetraError> {
        if data.len() < 10 {
            return Err(TetraError::InvalidResponse("frame shorter than 10 bytes".into()));
        }
        let declared_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if declared_len != data.len() {
            return Err(TetraError::InvalidResponse(format!(
                "declared length {declared_len} != actual {}",
                data.len()
            )));
        }
        let body = &data[2..data.len() - 2];
        let expected_cksum = checksum(body);
        let actual_cksum = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
        if expected_cksum != actual_cksum {
            return Err(TetraError::ChecksumMismatch);
        }
        let opcode = u16::from_be_bytes([body[0], body[1]]);
        let address = u32::from_le_bytes(body[2..6].try_into().unwrap());
        let length = u16::from_le_bytes(body[6..8].try_into().unwrap()) as usize;
        let data = body.get(8..8 + length).ok_or_else(|| {
            TetraError::InvalidResponse("declared data length exceeds frame body".into())
        })?;
        Ok(TetraFrame {
            opcode,
            address,
            data: data.to_vec(),
        })
    }
}

pub struct TetraEngine<T> {
    stream: T,
}

impl<T> TetraEngine<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T) -> Self {
        TetraEngine { stream }
    }

    async fn send(&mut self, frame: &TetraFrame) -> Result<(), TetraError> {
        self.stream
            .write_all(&frame.encode())
            .await
            .map_err(|e| TetraError::ConnectionFailed(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| TetraError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self, budget: Duration) -> Result<TetraFrame, TetraError> {
        timeout(budget, self.recv_inner())
            .await
            .map_err(|_| TetraError::Timeout)?
    }

    async fn recv_inner(&mut self) -> Result<TetraFrame, TetraError> {
        let mut len_prefix = [0u8; 2];
        self.stream
            .read_exact(&mut len_prefix)
            .await
            .map_err(|e| TetraError::ConnectionFailed(e.to_string()))?;
        let total_len = u16::from_be_bytes(len_prefix) as usize;
        if total_len < 2 {
            return Err(TetraError::InvalidResponse("declared length shorter than prefix".into()));
        }
        let mut rest = vec![0u8; total_len - 2];
        self.stream
            .read_exact(&mut rest)
            .await
            .map_err(|e| TetraError::ConnectionFailed(e.to_string()))?;
        let mut full = len_prefix.to_vec();
        full.extend(rest);
        TetraFrame::decode(&full)
    }

    async fn reset(&mut self, mode: ResetMode) -> Result<(), TetraError> {
        self.send(&TetraFrame::new(RpOpcode::ResetRequest as u16, 0, vec![mode as u8]))
            .await?;
        let reply = self.recv(DEFAULT_TIMEOUT).await?;
        if reply.opcode != RpOpcode::StatusIndication as u16 {
            if reply.opcode == RpOpcode::RejectIndication as u16 {
                let code = reply.data.first().copied().unwrap_or(0xFF);
                return Err(TetraError::CommandRejected(code));
            }
            return Err(TetraError::InvalidResponse(format!(
                "expected StatusIndication after reset, got opcode {:#06x}",
                reply.opcode
            )));
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), TetraError> {
        self.send(&TetraFrame::new(RpOpcode::TerminalIdRequest as u16, 0, vec![]))
            .await?;
        let confirm = self.recv(DEFAULT_TIMEOUT).await?;
        if confirm.opcode != RpOpcode::TerminalIdConfirm as u16 {
            return Err(TetraError::InvalidResponse(format!(
                "expected TerminalIDConfirm, got {:#06x}",
                confirm.opcode
            )));
        }

        self.send(&TetraFrame::new(RpOpcode::ParameterVersionRequest as u16, 0, vec![]))
            .await?;
        let confirm = self.recv(DEFAULT_TIMEOUT).await?;
        if confirm.opcode != RpOpcode::ParameterVersionConfirm as u16 {
            return Err(TetraError::InvalidResponse(format!(
                "expected ParameterVersionConfirm, got {:#06x}",
                confirm.opcode
            )));
        }
        let reply = self.recv(DEFAULT_TIMEOUT).await?;
        if reply.opcode != RpOpcode::ParameterVersionReply as u16 {
            return Err(TetraError::InvalidResponse(format!(
                "expected ParameterVersionReply, got {:#06x}",
                reply.opcode
            )));
        }
        Ok(())
    }

    /// Memory window to read, from `ConfigurationRequest` if the radio
    /// answers it, else the fixed fallback window (spec.md §4.7).
    async fn memory_window(&mut self) -> Result<(u32, u32), TetraError> {
        self.send(&TetraFrame::new(CONFIGURATION_REQUEST, 0, vec![]))
            .await?;
        match self.recv(DEFAULT_TIMEOUT).await {
            Ok(reply) if reply.data.len() >= 8 => {
                let start = u32::from_le_bytes(reply.data[0..4].try_into().unwrap());
                let end = u32::from_le_bytes(reply.data[4..8].try_into().unwrap());
                Ok((start, end))
            }
            _ => {
                warn!("ConfigurationRequest unanswered or malformed, using fallback memory window");
                Ok((FALLBACK_WINDOW_START, FALLBACK_WINDOW_END))
            }
        }
    }

    async fn read_window(
        &mut self,
        start: u32,
        end: u32,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<Vec<u8>, TetraError> {
        let total = (end - start).max(1);
        let mut data = Vec::with_capacity(total as usize);
        let mut address = start;
        while address < end {
            let len = (end - address).min(READ_BLOCK_LEN as u32) as u16;
            self.send(&TetraFrame::new(EXTENDED_READ_REQUEST, address, len.to_le_bytes().to_vec()))
                .await?;
            let reply = self.recv(DEFAULT_TIMEOUT).await?;
            if reply.opcode != EXTENDED_READ_REPLY && reply.opcode != READ_DATA_REPLY {
                return Err(TetraError::ReadFailure(address));
            }
            address += reply.data.len() as u32;
            data.extend_from_slice(&reply.data);
            progress((address - start) as f64 / total as f64);
        }
        Ok(data)
    }

    async fn write_window(
        &mut self,
        start: u32,
        bytes: &[u8],
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), TetraError> {
        let total_chunks = bytes.chunks(WRITE_BLOCK_LEN as usize).count().max(1);
        let mut address = start;
        for (i, chunk) in bytes.chunks(WRITE_BLOCK_LEN as usize).enumerate() {
            self.send(&TetraFrame::new(EXTENDED_WRITE_REQUEST, address, chunk.to_vec()))
                .await?;
            let reply = self.recv(DEFAULT_TIMEOUT).await?;
            if reply.opcode != EXTENDED_GOOD_WRITE_REPLY {
                return Err(TetraError::WriteFailure(address));
            }
            address += chunk.len() as u32;
            progress((i + 1) as f64 / total_chunks as f64 * 0.9);
        }

        self.send(&TetraFrame::new(
            EXTENDED_CHECKSUM_REQUEST,
            start,
            (address - start).to_le_bytes().to_vec(),
        ))
        .await?;
        let reply = self.recv(DEFAULT_TIMEOUT).await?;
        if reply.opcode != EXTENDED_CHECKSUM_REPLY {
            return Err(TetraError::InvalidResponse(format!(
                "expected ExtendedChecksumReply, got {:#06x}",
                reply.opcode
            )));
        }
        progress(1.0);
        Ok(())
    }
}

impl<T> Engine for TetraEngine<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn identify(&mut self) -> Result<RadioIdentification, crate::error::CoreError> {
        self.handshake().await?;
        Ok(RadioIdentification {
            family: "tetra".to_string(),
            model: None,
            serial: None,
            firmware: None,
            codeplug_version: None,
        })
    }

    async fn read_codeplug(
        &mut self,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<ParsedCodeplug, crate::error::CoreError> {
        self.reset(ResetMode::Programming).await?;
        let (start, end) = self.memory_window().await?;
        let result = self.read_window(start, end, progress).await;
        self.reset(ResetMode::Normal).await?;
        let bytes = result?;
        let mut codeplug = ParsedCodeplug::default();
        codeplug
            .unparsed_records
            .push((RpOpcode::StatusIndication as u16, bytes));
        Ok(codeplug)
    }

    async fn write_codeplug(
        &mut self,
        codeplug: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<(), crate::error::CoreError> {
        self.reset(ResetMode::Programming).await?;
        let bytes: Vec<u8> = codeplug
            .unparsed_records
            .iter()
            .flat_map(|(_, data)| data.clone())
            .collect();
        let result = self.write_window(FALLBACK_WINDOW_START, &bytes, progress).await;
        self.reset(ResetMode::Normal).await?;
        result?;
        Ok(())
    }

    async fn verify(
        &mut self,
        expected: &ParsedCodeplug,
        progress: &mut ProgressCallback<'_>,
    ) -> Result<bool, crate::error::CoreError> {
        let actual = self.read_codeplug(progress).await?;
        Ok(actual.unparsed_records == expected.unparsed_records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn encode_decode_round_trips() {
        let frame = TetraFrame::new(READ_DATA_REQUEST, 0x0001_0000, vec![1, 2, 3, 4]);
        let encoded = frame.encode();
        let decoded = TetraFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn mutating_any_body_byte_flips_checksum_validity() {
        let frame = TetraFrame::new(READ_DATA_REQUEST, 0x10, vec![9, 9, 9]);
        let mut encoded = frame.encode();
        assert!(TetraFrame::decode(&encoded).is_ok());
        let mutate_at = 4;
        encoded[mutate_at] ^= 0xFF;
        assert_eq!(TetraFrame::decode(&encoded), Err(TetraError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn write_failure_on_third_block_triggers_reset_and_write_failure() {
        let (client_stream, mut radio) = duplex(8192);
        let mut engine = TetraEngine::new(client_stream);

        let radio_task = tokio::spawn(async move {
            async fn recv_one(stream: &mut tokio::io::DuplexStream) -> TetraFrame {
                let mut len = [0u8; 2];
                stream.read_exact(&mut len).await.unwrap();
                let total = u16::from_be_bytes(len) as usize;
                let mut rest = vec![0u8; total - 2];
                stream.read_exact(&mut rest).await.unwrap();
                let mut full = len.to_vec();
                full.extend(rest);
                TetraFrame::decode(&full).unwrap()
            }
            async fn send(stream: &mut tokio::io::DuplexStream, frame: TetraFrame) {
                stream.write_all(&frame.encode()).await.unwrap();
            }

            // ResetRequest(Programming) -> StatusIndication.
            recv_one(&mut radio).await;
            send(&mut radio, TetraFrame::new(RpOpcode::StatusIndication as u16, 0, vec![])).await;

            // Blocks 1, 2 good; block 3 bad.
            for i in 0..3u32 {
                let req = recv_one(&mut radio).await;
                let opcode = if i == 2 { EXTENDED_BAD_WRITE_REPLY } else { EXTENDED_GOOD_WRITE_REPLY };
                send(&mut radio, TetraFrame::new(opcode, req.address, vec![])).await;
            }

            // ResetRequest(Normal) -> StatusIndication.
            recv_one(&mut radio).await;
            send(&mut radio, TetraFrame::new(RpOpcode::StatusIndication as u16, 0, vec![])).await;
        });

        let bytes = vec![0u8; WRITE_BLOCK_LEN as usize * 3];
        let mut codeplug = ParsedCodeplug::default();
        codeplug.unparsed_records.push((0, bytes));
        let err = engine
            .write_codeplug(&codeplug, &mut |_f| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::CoreError::ProtocolError(ref m) if m.contains("write failure")
        ));
        radio_task.await.unwrap();
    }
}
