//! XCMP packet encode/decode and the deterministic request-builder
//! helpers of spec.md §4.4.

/// Radio status sub-selectors for opcode `0x000E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RadioStatusSelector {
    Rssi = 0x00,
    LowBattery = 0x01,
    ModelNumber = 0x10,
    SerialNumber = 0x11,
    RadioId = 0x12,
    RadioName = 0x13,
    PhysicalSerialNumber = 0x14,
}

/// Version-info sub-selectors for opcode `0x000F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VersionInfoSelector {
    Firmware = 0x00,
    Codeplug = 0x01,
    CodeplugCps = 0x02,
    Bootloader = 0x03,
}

/// PSDT partition actions (spec.md §3/§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PsdtAction {
    GetStartAddress = 0x00,
    GetEndAddress = 0x01,
    Lock = 0x02,
    Unlock = 0x03,
    Erase = 0x04,
    Copy = 0x05,
    ImageReorg = 0x06,
}

bitflags::bitflags! {
    /// Component-session action bit-set (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ComponentSessionActions: u16 {
        const RESET = 0x0001;
        const START_SESSION = 0x0002;
        const SNAPSHOT = 0x0004;
        const VALIDATE_CRC = 0x0008;
        const UNPACK_FILES = 0x0010;
        const DEPLOY = 0x0020;
        const DELAY_TOD = 0x0040;
        const SUPPRESS_PN = 0x0080;
        const STATUS = 0x0100;
        const READ_WRITE = 0x0200;
        const CREATE_ARCHIVE = 0x0400;
        const PROGRAMMING_INDICATOR = 0x0800;
    }
}

/// A decoded XCMP packet: a 16-bit opcode plus an opaque payload.
/// Unknown opcodes are preserved, never dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcmpPacket {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

impl XcmpPacket {
    pub fn new(opcode: u16, payload: Vec<u8>) -> Self {
        XcmpPacket { opcode, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.extend_from_slice(&self.opcode.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Option<XcmpPacket> {
        if data.len() < 2 {
            return None;
        }
        let opcode = u16::from_be_bytes([data[0], data[1]]);
        Some(XcmpPacket {
            opcode,
            payload: data[2..].to_vec(),
        })
    }

    /// Reply opcodes equal `request | 0x8000`.
    pub fn is_reply(&self) -> bool {
        self.opcode & 0x8000 != 0
    }

    /// Broadcasts have the top nibble `0xB`.
    pub fn is_broadcast(&self) -> bool {
        (self.opcode >> 12) == 0xB
    }
}

pub const OPCODE_RADIO_STATUS_REQUEST: u16 = 0x000E;
pub const OPCODE_VERSION_INFO_REQUEST: u16 = 0x000F;
pub const OPCODE_CPS_READ_REQUEST: u16 = 0x0104;
pub const OPCODE_CLONE_READ_REQUEST: u16 = 0x010A;
pub const OPCODE_PSDT_ACCESS: u16 = 0x010B;
pub const OPCODE_RADIO_UPDATE_CONTROL: u16 = 0x010C;
pub const OPCODE_COMPONENT_SESSION: u16 = 0x010F;
pub const OPCODE_TRANSFER_DATA: u16 = 0x0446;
pub const OPCODE_CODEPLUG_READ: u16 = 0x002E;

fn ascii_id_padded(id: &str) -> [u8; 4] {
    let mut out = [0u8; 4];
    let bytes = id.as_bytes();
    let n = bytes.len().min(4);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

pub fn radio_status_request(selector: RadioStatusSelector) -> XcmpPacket {
    XcmpPacket::new(OPCODE_RADIO_STATUS_REQUEST, vec![selector as u8])
}

pub fn version_info_request(selector: VersionInfoSelector) -> XcmpPacket {
    XcmpPacket::new(OPCODE_VERSION_INFO_REQUEST, vec![selector as u8])
}

pub fn cps_read_request(addr: u32, len: u16) -> XcmpPacket {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&addr.to_be_bytes());
    payload.extend_from_slice(&len.to_be_bytes());
    XcmpPacket::new(OPCODE_CPS_READ_REQUEST, payload)
}

pub fn clone_read_request(zone: u16, channel: u16, data_type: u8) -> XcmpPacket {
    let mut payload = Vec::with_capacity(10);
    payload.extend_from_slice(&[0x80, 0x01]);
    payload.extend_from_slice(&zone.to_be_bytes());
    payload.extend_from_slice(&[0x80, 0x02]);
    payload.extend_from_slice(&channel.to_be_bytes());
    payload.push(0x00);
    payload.push(data_type);
    XcmpPacket::new(OPCODE_CLONE_READ_REQUEST, payload)
}

pub fn psdt_access(action: PsdtAction, src_id: &str, tgt_id: &str) -> XcmpPacket {
    let mut payload = Vec::with_capacity(9);
    payload.push(action as u8);
    payload.extend_from_slice(&ascii_id_padded(src_id));
    payload.extend_from_slice(&ascii_id_padded(tgt_id));
    XcmpPacket::new(OPCODE_PSDT_ACCESS, payload)
}

pub fn component_session(
    actions: ComponentSessionActions,
    session_id: u16,
    extra: Option<u32>,
) -> XcmpPacket {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&actions.bits().to_be_bytes());
    payload.extend_from_slice(&session_id.to_be_bytes());
    if let Some(extra) = extra {
        payload.extend_from_slice(&extra.to_be_bytes());
    }
    XcmpPacket::new(OPCODE_COMPONENT_SESSION, payload)
}

pub fn radio_update_control(action: u8) -> XcmpPacket {
    XcmpPacket::new(OPCODE_RADIO_UPDATE_CONTROL, vec![action])
}

pub fn transfer_data(kind: u8, bytes: &[u8]) -> XcmpPacket {
    let mut payload = Vec::with_capacity(1 + bytes.len());
    payload.push(kind);
    payload.extend_from_slice(bytes);
    XcmpPacket::new(OPCODE_TRANSFER_DATA, payload)
}

pub fn codeplug_read_request(record_ids: &[u16]) -> XcmpPacket {
    let mut payload = Vec::with_capacity(record_ids.len() * 2);
    for id in record_ids {
        payload.extend_from_slice(&id.to_be_bytes());
    }
    XcmpPacket::new(OPCODE_CODEPLUG_READ, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_for_known_opcodes() {
        let packet = radio_status_request(RadioStatusSelector::ModelNumber);
        let encoded = packet.encode();
        assert_eq!(encoded, vec![0x00, 0x0E, 0x10]);
        let decoded = XcmpPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn encode_decode_round_trips_for_unknown_opcode() {
        let packet = XcmpPacket::new(0x1234, vec![9, 9, 9]);
        let decoded = XcmpPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn clone_read_request_has_the_documented_layout() {
        let packet = clone_read_request(0x0001, 0x0002, 0x05);
        assert_eq!(
            packet.encode(),
            vec![0x01, 0x0A, 0x80, 0x01, 0x00, 0x01, 0x80, 0x02, 0x00, 0x02, 0x00, 0x05]
        );
    }

    #[test]
    fn psdt_access_pads_ids_with_nulls() {
        let packet = psdt_access(PsdtAction::GetStartAddress, "CP", "ISH");
        assert_eq!(
            packet.encode(),
            vec![0x01, 0x0B, 0x00, b'C', b'P', 0, 0, b'I', b'S', b'H', 0]
        );
    }

    #[test]
    fn component_session_omits_extra_when_absent() {
        let packet = component_session(
            ComponentSessionActions::START_SESSION | ComponentSessionActions::READ_WRITE,
            7,
            None,
        );
        assert_eq!(packet.encode(), vec![0x01, 0x0F, 0x02, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn reply_and_broadcast_classification() {
        assert!(XcmpPacket::new(0x800E, vec![]).is_reply());
        assert!(!XcmpPacket::new(0x000E, vec![]).is_reply());
        assert!(XcmpPacket::new(0xB001, vec![]).is_broadcast());
        assert!(!XcmpPacket::new(0x000E, vec![]).is_broadcast());
    }
}
