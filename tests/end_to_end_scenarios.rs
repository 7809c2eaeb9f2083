//! End-to-end scenarios against a simulated radio, driven over
//! `tokio::io::duplex` the way the engine-level unit tests are.

use cps_core::engines::mototrbo::MototrboEngine;
use cps_core::engines::Engine;
use cps_core::xnl::session::{XnlOpcode, XnlSession};
use cps_core::xnl::XnlFrame;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

async fn recv_one(stream: &mut DuplexStream) -> XnlFrame {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await.unwrap();
    let total = u16::from_be_bytes(len) as usize;
    let mut rest = vec![0u8; total - 2];
    stream.read_exact(&mut rest).await.unwrap();
    let mut full = len.to_vec();
    full.extend(rest);
    XnlFrame::decode(&full).unwrap()
}

async fn send_frame(stream: &mut DuplexStream, frame: XnlFrame) {
    stream.write_all(&frame.encode()).await.unwrap();
}

/// Drives the XNL handshake as a compliant radio, then hands control to
/// `after_auth` to answer whatever XCMP exchanges the test needs.
async fn drive_handshake_then(
    mut radio: DuplexStream,
    master_address: u16,
    assigned_address: u16,
    after_auth: impl FnOnce(DuplexStream) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
) {
    recv_one(&mut radio).await; // DeviceMasterQuery
    send_frame(
        &mut radio,
        XnlFrame::new(XnlOpcode::MasterStatusBroadcast as u8, 0, master_address, 0, vec![]),
    )
    .await;

    recv_one(&mut radio).await; // DeviceAuthKeyRequest
    let challenge = [0u8; 8];
    let mut auth_payload = 0x0100u16.to_be_bytes().to_vec();
    auth_payload.extend_from_slice(&challenge);
    send_frame(
        &mut radio,
        XnlFrame::new(XnlOpcode::DeviceAuthKeyReply as u8, 0x0001, master_address, 1, auth_payload),
    )
    .await;

    recv_one(&mut radio).await; // DeviceConnectionRequest
    let mut reply_payload = vec![0x00];
    reply_payload.extend_from_slice(&assigned_address.to_be_bytes());
    send_frame(
        &mut radio,
        XnlFrame::new(XnlOpcode::DeviceConnectionReply as u8, 0x0001, master_address, 2, reply_payload),
    )
    .await;

    after_auth(radio).await;
}

async fn recv_xcmp(radio: &mut DuplexStream) -> (u16, Vec<u8>) {
    let frame = recv_one(radio).await;
    let opcode = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    (opcode, frame.payload[2..].to_vec())
}

async fn reply_xcmp(radio: &mut DuplexStream, master_address: u16, assigned_address: u16, txid: u16, opcode: u16, payload: &[u8]) {
    let mut full_payload = opcode.to_be_bytes().to_vec();
    full_payload.extend_from_slice(payload);
    send_frame(
        &mut *radio,
        XnlFrame::new(XnlOpcode::DataMessage as u8, assigned_address, master_address, txid, full_payload),
    )
    .await;
}

#[tokio::test]
async fn mototrbo_identify_reports_model_serial_firmware_and_family() {
    let (client_stream, radio_stream) = duplex(8192);
    let master_address = 0x0064;
    let assigned_address = 0x0A55;

    let radio_task = tokio::spawn(drive_handshake_then(
        radio_stream,
        master_address,
        assigned_address,
        |mut radio| {
            Box::pin(async move {
                // model_number
                let (_opcode, _payload) = recv_xcmp(&mut radio).await;
                let mut model_reply = vec![0x00];
                model_reply.extend_from_slice(b"H02RDH9VA1AN\0");
                reply_xcmp(&mut radio, master_address, assigned_address, 1, 0x800E, &model_reply).await;

                // serial_number
                recv_xcmp(&mut radio).await;
                let mut serial_reply = vec![0x00];
                serial_reply.extend_from_slice(b"12345");
                reply_xcmp(&mut radio, master_address, assigned_address, 2, 0x800E, &serial_reply).await;

                // firmware_version
                recv_xcmp(&mut radio).await;
                let mut firmware_reply = vec![0x00];
                firmware_reply.extend_from_slice(b"R02.50");
                reply_xcmp(&mut radio, master_address, assigned_address, 3, 0x800F, &firmware_reply).await;

                // codeplug_id
                recv_xcmp(&mut radio).await;
                let mut codeplug_reply = vec![0x00];
                codeplug_reply.extend_from_slice(b"CP0001");
                reply_xcmp(&mut radio, master_address, assigned_address, 4, 0x800F, &codeplug_reply).await;
            })
        },
    ));

    let mut session = XnlSession::new(client_stream);
    session.authenticate().await.unwrap();
    let mut engine = MototrboEngine::new(session);
    let identification = engine.identify().await.unwrap();

    assert_eq!(identification.model.as_deref(), Some("H02RDH9VA1AN"));
    assert_eq!(identification.serial.as_deref(), Some("12345"));
    assert_eq!(identification.firmware.as_deref(), Some("R02.50"));
    assert_eq!(identification.family, "xpr");

    radio_task.await.unwrap();
}

#[tokio::test]
async fn psdt_range_rejects_a_zero_width_partition() {
    let (client_stream, radio_stream) = duplex(8192);
    let master_address = 0x0064;
    let assigned_address = 0x0A55;

    let radio_task = tokio::spawn(drive_handshake_then(
        radio_stream,
        master_address,
        assigned_address,
        |mut radio| {
            Box::pin(async move {
                // GetStartAddress -> 0
                recv_xcmp(&mut radio).await;
                let mut start_reply = vec![0x00];
                start_reply.extend_from_slice(&0u32.to_be_bytes());
                reply_xcmp(&mut radio, master_address, assigned_address, 1, 0x810B, &start_reply).await;

                // GetEndAddress -> 0 (end <= start)
                recv_xcmp(&mut radio).await;
                let mut end_reply = vec![0x00];
                end_reply.extend_from_slice(&0u32.to_be_bytes());
                reply_xcmp(&mut radio, master_address, assigned_address, 2, 0x810B, &end_reply).await;
            })
        },
    ));

    let mut session = XnlSession::new(client_stream);
    session.authenticate().await.unwrap();
    let mut client = cps_core::xcmp::XcmpClient::new(&mut session);
    let err = client.psdt_range("CP").await.unwrap_err();
    assert!(matches!(err, cps_core::xcmp::XcmpError::InvalidReply(_)));

    radio_task.await.unwrap();
}
