//! XNL session lifecycle: connect, authenticate, and carry XCMP
//! payloads duplex over one TCP (or test) stream (spec.md §4.3).

use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::tea;
use crate::xnl::frame::{XnlFrame, XnlFrameError, HEADER_LEN};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECV_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XnlOpcode {
    MasterStatusBroadcast = 0x02,
    DeviceMasterQuery = 0x03,
    DeviceAuthKeyRequest = 0x04,
    DeviceAuthKeyReply = 0x05,
    DeviceConnectionRequest = 0x06,
    DeviceConnectionReply = 0x07,
    DataMessage = 0x08,
    DataMessageAck = 0x09,
    DeviceSysMapBroadcast = 0x0B,
}

impl XnlOpcode {
    fn matches(self, raw: u8) -> bool {
        self as u8 == raw
    }
}

#[derive(Error, Debug)]
pub enum XnlSessionError {
    #[error("connection error: {0}")]
    ConnectionFailed(String),
    #[error("timed out waiting for expected frame")]
    Timeout,
    #[error("authentication rejected with code {0:#04x}")]
    AuthenticationFailed(u8),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Frame(#[from] XnlFrameError),
}

/// Connection state per spec.md §3. `authenticated()` holds iff
/// `assigned_address != 0`.
pub struct XnlSession<T> {
    stream: T,
    connected: bool,
    master_address: u16,
    self_address: u16,
    assigned_address: u16,
    next_txid: u16,
}

impl<T> XnlSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T) -> Self {
        XnlSession {
            stream,
            connected: true,
            master_address: 0,
            self_address: 0x0001,
            assigned_address: 0,
            next_txid: 0,
        }
    }

    pub fn authenticated(&self) -> bool {
        self.assigned_address != 0
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn assigned_address(&self) -> u16 {
        self.assigned_address
    }

    fn next_txid(&mut self) -> u16 {
        self.next_txid = self.next_txid.wrapping_add(1);
        self.next_txid
    }

    async fn send_frame(&mut self, frame: &XnlFrame) -> Result<(), XnlSessionError> {
        self.stream
            .write_all(&frame.encode())
            .await
            .map_err(|e| XnlSessionError::ConnectionFailed(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| XnlSessionError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    /// Read exactly one frame: the 2-byte length prefix, then
    /// `length - 2` more bytes. Not line-oriented; no delimiters.
    async fn recv_frame(&mut self, budget: Duration) -> Result<XnlFrame, XnlSessionError> {
        timeout(budget, self.recv_frame_inner())
            .await
            .map_err(|_| XnlSessionError::Timeout)?
    }

    async fn recv_frame_inner(&mut self) -> Result<XnlFrame, XnlSessionError> {
        let mut len_prefix = [0u8; 2];
        self.stream
            .read_exact(&mut len_prefix)
            .await
            .map_err(|e| XnlSessionError::ConnectionFailed(e.to_string()))?;
        let total_length = u16::from_be_bytes(len_prefix) as usize;
        if total_length < HEADER_LEN {
            return Err(XnlFrameError::ShortFrame(total_length).into());
        }
        let mut rest = vec![0u8; total_length - 2];
        self.stream
            .read_exact(&mut rest)
            .await
            .map_err(|e| XnlSessionError::ConnectionFailed(e.to_string()))?;
        let mut full = Vec::with_capacity(total_length);
        full.extend_from_slice(&len_prefix);
        full.extend_from_slice(&rest);
        Ok(XnlFrame::decode(&full)?)
    }

    /// Run the full handshake: master discovery, auth key exchange, TEA
    /// challenge/response, connection request. On success
    /// `self.authenticated()` is true.
    pub async fn authenticate(&mut self) -> Result<(), XnlSessionError> {
        // Step 2: DeviceMasterQuery from address 0/0, txid 0.
        self.send_frame(&XnlFrame::new(
            XnlOpcode::DeviceMasterQuery as u8,
            0,
            0,
            0,
            vec![],
        ))
        .await?;

        // Step 3: MasterStatusBroadcast; the sender's own address IS the
        // master address, which lands in the frame's src_address field
        // (the same byte range spec.md calls out as [8..10]).
        let master_broadcast = self.recv_frame(DEFAULT_TIMEOUT).await?;
        if !XnlOpcode::MasterStatusBroadcast.matches(master_broadcast.opcode) {
            return Err(XnlSessionError::Protocol(format!(
                "expected MasterStatusBroadcast, got opcode {:#04x}",
                master_broadcast.opcode
            )));
        }
        self.master_address = master_broadcast.src_address;

        // Step 4: DeviceAuthKeyRequest.
        let txid = self.next_txid();
        self.send_frame(&XnlFrame::new(
            XnlOpcode::DeviceAuthKeyRequest as u8,
            self.master_address,
            self.self_address,
            txid,
            vec![],
        ))
        .await?;

        // Step 5: absorb stray MasterStatusBroadcasts, then AuthKeyReply.
        let auth_reply = self.recv_until(XnlOpcode::DeviceAuthKeyReply).await?;
        if auth_reply.payload.len() < 10 {
            return Err(XnlSessionError::Protocol(
                "DeviceAuthKeyReply payload shorter than 10 bytes".into(),
            ));
        }
        let temp_address = u16::from_be_bytes([auth_reply.payload[0], auth_reply.payload[1]]);
        let challenge = &auth_reply.payload[2..10];

        // Step 6: TEA-encrypt the challenge.
        let response = tea::encrypt(challenge)
            .map_err(|_| XnlSessionError::Protocol("challenge was not 8 bytes".into()))?;

        // Step 7: DeviceConnectionRequest.
        let mut conn_payload = Vec::with_capacity(12);
        conn_payload.extend_from_slice(&temp_address.to_be_bytes());
        conn_payload.push(0x0A); // device_type
        conn_payload.push(0x00); // auth_index
        conn_payload.extend_from_slice(&response);
        let txid = self.next_txid();
        self.send_frame(&XnlFrame::new(
            XnlOpcode::DeviceConnectionRequest as u8,
            self.master_address,
            self.self_address,
            txid,
            conn_payload,
        ))
        .await?;

        // Step 8: DeviceConnectionReply.
        let conn_reply = self.recv_until(XnlOpcode::DeviceConnectionReply).await?;
        if conn_reply.payload.is_empty() {
            return Err(XnlSessionError::Protocol(
                "DeviceConnectionReply had an empty payload".into(),
            ));
        }
        let result_code = conn_reply.payload[0];
        if result_code != 0x00 {
            return Err(XnlSessionError::AuthenticationFailed(result_code));
        }
        self.assigned_address = if conn_reply.payload.len() >= 3 {
            u16::from_be_bytes([conn_reply.payload[1], conn_reply.payload[2]])
        } else {
            self.self_address
        };

        debug!(
            "XNL authenticated: master={:#06x} assigned={:#06x}",
            self.master_address, self.assigned_address
        );
        Ok(())
    }

    /// Receive frames, discarding anything but `want`, up to
    /// `MAX_RECV_ITERATIONS` tries each bounded by `DEFAULT_TIMEOUT`.
    async fn recv_until(&mut self, want: XnlOpcode) -> Result<XnlFrame, XnlSessionError> {
        for _ in 0..MAX_RECV_ITERATIONS {
            let frame = self.recv_frame(DEFAULT_TIMEOUT).await?;
            if want.matches(frame.opcode) {
                return Ok(frame);
            }
            warn!(
                "discarding unexpected XNL frame opcode {:#04x} while waiting for {:#04x}",
                frame.opcode, want as u8
            );
        }
        Err(XnlSessionError::Protocol(format!(
            "no {:#04x} frame within {MAX_RECV_ITERATIONS} frames",
            want as u8
        )))
    }

    /// Send an XCMP payload wrapped in a DataMessage frame and return
    /// the first DataMessage/DataMessageAck reply's XCMP payload.
    pub async fn send_xcmp(
        &mut self,
        payload: Vec<u8>,
        budget: Duration,
    ) -> Result<Vec<u8>, XnlSessionError> {
        if !self.authenticated() {
            return Err(XnlSessionError::Protocol(
                "send_xcmp called before authentication".into(),
            ));
        }
        let txid = self.next_txid();
        self.send_frame(&XnlFrame::new(
            XnlOpcode::DataMessage as u8,
            self.master_address,
            self.assigned_address,
            txid,
            payload,
        ))
        .await?;

        self.recv_xcmp_reply(budget).await
    }

    /// Receive the next DataMessage/DataMessageAck payload without
    /// sending anything first. Used by the XCMP layer to keep waiting
    /// past a reply it has decided not to accept (e.g. a broadcast-class
    /// XCMP packet riding inside a DataMessage frame), since XNL-level
    /// framing alone can't tell such a frame apart from a real reply.
    pub(crate) async fn recv_xcmp_reply(
        &mut self,
        budget: Duration,
    ) -> Result<Vec<u8>, XnlSessionError> {
        for _ in 0..MAX_RECV_ITERATIONS {
            let frame = self.recv_frame(budget).await?;
            let is_data = XnlOpcode::DataMessage.matches(frame.opcode)
                || XnlOpcode::DataMessageAck.matches(frame.opcode);
            if is_data {
                return Ok(frame.payload);
            }
            // Broadcasts (top nibble 0xB, e.g. DeviceSysMapBroadcast) and
            // anything else are acknowledged implicitly by being ignored.
            warn!("ignoring non-data XNL frame opcode {:#04x}", frame.opcode);
        }
        Err(XnlSessionError::Timeout)
    }

    pub async fn disconnect(&mut self) {
        self.connected = false;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xnl::frame::XnlFrame;
    use tokio::io::duplex;

    async fn drive_radio_side(
        mut radio: tokio::io::DuplexStream,
        master_address: u16,
        temp_address: u16,
        challenge: [u8; 8],
        connection_result: u8,
        assigned_address: u16,
    ) {
        // Step 2: DeviceMasterQuery in.
        recv_one(&mut radio).await;
        // Step 3: MasterStatusBroadcast out, src_address = master.
        send_frame(
            &mut radio,
            XnlFrame::new(
                XnlOpcode::MasterStatusBroadcast as u8,
                0,
                master_address,
                0,
                vec![],
            ),
        )
        .await;

        // Step 4: DeviceAuthKeyRequest in.
        recv_one(&mut radio).await;
        // Step 5: AuthKeyReply out.
        let mut payload = temp_address.to_be_bytes().to_vec();
        payload.extend_from_slice(&challenge);
        send_frame(
            &mut radio,
            XnlFrame::new(
                XnlOpcode::DeviceAuthKeyReply as u8,
                0x0001,
                master_address,
                1,
                payload,
            ),
        )
        .await;

        // Step 7: DeviceConnectionRequest in.
        recv_one(&mut radio).await;
        // Step 8: DeviceConnectionReply out.
        let mut reply_payload = vec![connection_result];
        if connection_result == 0 {
            reply_payload.extend_from_slice(&assigned_address.to_be_bytes());
        }
        send_frame(
            &mut radio,
            XnlFrame::new(
                XnlOpcode::DeviceConnectionReply as u8,
                0x0001,
                master_address,
                2,
                reply_payload,
            ),
        )
        .await;
    }

    async fn recv_one(stream: &mut tokio::io::DuplexStream) -> XnlFrame {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.unwrap();
        let total = u16::from_be_bytes(len) as usize;
        let mut rest = vec![0u8; total - 2];
        stream.read_exact(&mut rest).await.unwrap();
        let mut full = len.to_vec();
        full.extend(rest);
        XnlFrame::decode(&full).unwrap()
    }

    async fn send_frame(stream: &mut tokio::io::DuplexStream, frame: XnlFrame) {
        stream.write_all(&frame.encode()).await.unwrap();
    }

    #[tokio::test]
    async fn happy_path_handshake_assigns_address() {
        let (client_stream, radio_stream) = duplex(4096);
        let challenge = [0, 1, 2, 3, 4, 5, 6, 7];
        let radio_task = tokio::spawn(drive_radio_side(
            radio_stream,
            0x0064,
            0x0100,
            challenge,
            0x00,
            0x0A55,
        ));

        let mut session = XnlSession::new(client_stream);
        session.authenticate().await.unwrap();

        assert_eq!(session.assigned_address(), 0x0A55);
        assert!(session.authenticated());
        radio_task.await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_result_code_fails_authentication() {
        let (client_stream, radio_stream) = duplex(4096);
        let challenge = [0u8; 8];
        let radio_task = tokio::spawn(drive_radio_side(
            radio_stream,
            0x0064,
            0x0100,
            challenge,
            0x05,
            0,
        ));

        let mut session = XnlSession::new(client_stream);
        let err = session.authenticate().await.unwrap_err();
        assert!(matches!(err, XnlSessionError::AuthenticationFailed(0x05)));
        radio_task.await.unwrap();
    }
}
