//! Frame-level codec for the pre-defined CANopen connection set. The 11-bit
//! COB-ID splits into a 4-bit function code (bits 10..7) and a 7-bit node id
//! (bits 6..0); the NMT master services of CiA 302-2 claim dedicated CAN-IDs
//! inside the NMT function-code block.

use crate::prelude::*;

pub const FUNCTION_CODE_BITNUM: u16 = 7;
pub const FUNCTION_CODE_MASK: u16 = 0x780;
pub const NODE_ID_MASK: u16 = 0x7F;

pub const FUNCTION_CODE_NMT: u16 = 0x0;
pub const FUNCTION_CODE_SYNC: u16 = 0x1;
pub const FUNCTION_CODE_EMCY: u16 = 0x1;
pub const FUNCTION_CODE_TIME: u16 = 0x2;
pub const FUNCTION_CODE_TPDO1: u16 = 0x3;
pub const FUNCTION_CODE_RPDO1: u16 = 0x4;
pub const FUNCTION_CODE_TPDO2: u16 = 0x5;
pub const FUNCTION_CODE_RPDO2: u16 = 0x6;
pub const FUNCTION_CODE_TPDO3: u16 = 0x7;
pub const FUNCTION_CODE_RPDO3: u16 = 0x8;
pub const FUNCTION_CODE_TPDO4: u16 = 0x9;
pub const FUNCTION_CODE_RPDO4: u16 = 0xA;
pub const FUNCTION_CODE_SDO_TX: u16 = 0xB;
pub const FUNCTION_CODE_SDO_RX: u16 = 0xC;
pub const FUNCTION_CODE_NMT_ERROR_CONTROL: u16 = 0xE;

pub const BROADCAST_NODE_ID: u8 = 0;

/// CAN-IDs of the NMT master services (fc = 0, CiA 302-2).
pub const NMT_GFC: u16 = 0x01;
pub const NMT_MASTER_NODE_ID: u16 = 0x71;
pub const NMT_FLYING_MASTER_REQUEST: u16 = 0x72;
pub const NMT_ACTIVE_MASTER_REQUEST: u16 = 0x73;
pub const NMT_MASTER_RESPONSE: u16 = 0x74;
pub const NMT_MASTER_REQUEST: u16 = 0x75;
pub const NMT_FORCE_FLYING_MASTER: u16 = 0x76;
pub const NMT_ACTIVE_INTERFACE_INDICATION: u16 = 0x77;

/// NMT node control command specifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl NmtCommand {
    pub fn from_u8(cs: u8) -> Option<Self> {
        match cs {
            0x01 => Some(NmtCommand::Start),
            0x02 => Some(NmtCommand::Stop),
            0x80 => Some(NmtCommand::EnterPreOperational),
            0x81 => Some(NmtCommand::ResetNode),
            0x82 => Some(NmtCommand::ResetCommunication),
            _ => None,
        }
    }
}

/// A classified inbound frame. SDO and PDO payloads stay raw; their routing
/// depends on object dictionary state the factory cannot see.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NmtNodeControl { command: NmtCommand, target: u8 },
    NmtGlobalFailsafe,
    NmtMasterNodeId { priority: u8, node_id: u8 },
    NmtFlyingMasterRequest,
    NmtActiveMasterRequest,
    NmtMasterResponse,
    NmtMasterRequest,
    NmtForceFlyingMaster,
    NmtActiveInterfaceIndication { interface: u8, node_id: u8 },
    Sync { counter: Option<u8> },
    Emcy { node_id: u8, eec: u16, error_register: u8, msef: [u8; 5] },
    Time { millis: u32, days: u16 },
    /// State 0 is the boot-up indication.
    Heartbeat { node_id: u8, state: u8 },
    Pdo { cob_id: u16, data: Vec<u8> },
    SdoRequest { node_id: u8, data: [u8; 8] },
    SdoResponse { node_id: u8, data: [u8; 8] },
    /// Remote request for a restricted COB-ID (heartbeat poll or TPDO RTR).
    Remote { cob_id: u16 },
    Unknown { cob_id: u16 },
}

impl Message {
    pub fn parse(cob_id: u16, data: &[u8], is_remote: bool) -> Message {
        if is_remote {
            return Message::Remote { cob_id };
        }
        let fc = (cob_id & FUNCTION_CODE_MASK) >> FUNCTION_CODE_BITNUM;
        let node_id = (cob_id & NODE_ID_MASK) as u8;
        match fc {
            FUNCTION_CODE_NMT => match cob_id {
                0x000 if data.len() == 2 => match NmtCommand::from_u8(data[0]) {
                    Some(command) => Message::NmtNodeControl { command, target: data[1] },
                    None => Message::Unknown { cob_id },
                },
                NMT_GFC => Message::NmtGlobalFailsafe,
                NMT_MASTER_NODE_ID if data.len() >= 2 => {
                    Message::NmtMasterNodeId { priority: data[0], node_id: data[1] }
                }
                NMT_FLYING_MASTER_REQUEST => Message::NmtFlyingMasterRequest,
                NMT_ACTIVE_MASTER_REQUEST => Message::NmtActiveMasterRequest,
                NMT_MASTER_RESPONSE => Message::NmtMasterResponse,
                NMT_MASTER_REQUEST => Message::NmtMasterRequest,
                NMT_FORCE_FLYING_MASTER => Message::NmtForceFlyingMaster,
                NMT_ACTIVE_INTERFACE_INDICATION if data.len() >= 2 => {
                    Message::NmtActiveInterfaceIndication { interface: data[0], node_id: data[1] }
                }
                _ => Message::Unknown { cob_id },
            },
            FUNCTION_CODE_SYNC if node_id == BROADCAST_NODE_ID => {
                Message::Sync { counter: data.first().copied() }
            }
            FUNCTION_CODE_EMCY if data.len() == 8 => Message::Emcy {
                node_id,
                eec: u16::from_le_bytes([data[0], data[1]]),
                error_register: data[2],
                msef: [data[3], data[4], data[5], data[6], data[7]],
            },
            FUNCTION_CODE_TIME if data.len() >= 6 => Message::Time {
                millis: u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & 0x0FFF_FFFF,
                days: u16::from_le_bytes([data[4], data[5]]),
            },
            FUNCTION_CODE_TPDO1 | FUNCTION_CODE_RPDO1 | FUNCTION_CODE_TPDO2
            | FUNCTION_CODE_RPDO2 | FUNCTION_CODE_TPDO3 | FUNCTION_CODE_RPDO3
            | FUNCTION_CODE_TPDO4 | FUNCTION_CODE_RPDO4 => {
                Message::Pdo { cob_id, data: data.to_vec() }
            }
            FUNCTION_CODE_SDO_RX if data.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(data);
                Message::SdoRequest { node_id, data: bytes }
            }
            FUNCTION_CODE_SDO_TX if data.len() == 8 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(data);
                Message::SdoResponse { node_id, data: bytes }
            }
            FUNCTION_CODE_NMT_ERROR_CONTROL if !data.is_empty() => {
                Message::Heartbeat { node_id, state: data[0] }
            }
            _ => Message::Unknown { cob_id },
        }
    }
}

// Outbound frame payloads; the node materialises them through
// `util::create_frame`.

pub fn node_control(command: NmtCommand, target: u8) -> (u16, Vec<u8>) {
    (0x000, vec![command as u8, target])
}

pub fn master_node_id(priority: u8, node_id: u8) -> (u16, Vec<u8>) {
    (NMT_MASTER_NODE_ID, vec![priority, node_id])
}

pub fn flying_master_request() -> (u16, Vec<u8>) {
    (NMT_FLYING_MASTER_REQUEST, Vec::new())
}

pub fn active_master_request() -> (u16, Vec<u8>) {
    (NMT_ACTIVE_MASTER_REQUEST, Vec::new())
}

pub fn master_response() -> (u16, Vec<u8>) {
    (NMT_MASTER_RESPONSE, Vec::new())
}

pub fn force_flying_master() -> (u16, Vec<u8>) {
    (NMT_FORCE_FLYING_MASTER, Vec::new())
}

pub fn active_interface_indication(interface: u8, node_id: u8) -> (u16, Vec<u8>) {
    (NMT_ACTIVE_INTERFACE_INDICATION, vec![interface, node_id])
}

pub fn heartbeat(node_id: u8, state_code: u8) -> (u16, Vec<u8>) {
    (
        (FUNCTION_CODE_NMT_ERROR_CONTROL << FUNCTION_CODE_BITNUM) | node_id as u16,
        vec![state_code],
    )
}

pub fn bootup(node_id: u8) -> (u16, Vec<u8>) {
    heartbeat(node_id, 0)
}

pub fn sync(cob_id: u16, counter: Option<u8>) -> (u16, Vec<u8>) {
    (cob_id, counter.map(|c| vec![c]).unwrap_or_default())
}

pub fn emcy(cob_id: u16, eec: u16, error_register: u8, msef: [u8; 5]) -> (u16, Vec<u8>) {
    let mut data = eec.to_le_bytes().to_vec();
    data.push(error_register);
    data.extend_from_slice(&msef);
    (cob_id, data)
}

pub fn time(cob_id: u16, millis: u32, days: u16) -> (u16, Vec<u8>) {
    let mut data = (millis & 0x0FFF_FFFF).to_le_bytes().to_vec();
    data.extend_from_slice(&days.to_le_bytes());
    (cob_id, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_control() {
        assert_eq!(
            Message::parse(0x000, &[0x01, 0x00], false),
            Message::NmtNodeControl { command: NmtCommand::Start, target: 0 }
        );
        assert_eq!(
            Message::parse(0x000, &[0x82, 0x05], false),
            Message::NmtNodeControl { command: NmtCommand::ResetCommunication, target: 5 }
        );
        assert_eq!(Message::parse(0x000, &[0x42, 0x00], false), Message::Unknown { cob_id: 0 });
    }

    #[test]
    fn test_parse_master_services() {
        assert_eq!(
            Message::parse(0x71, &[3, 9], false),
            Message::NmtMasterNodeId { priority: 3, node_id: 9 }
        );
        assert_eq!(Message::parse(0x73, &[], false), Message::NmtActiveMasterRequest);
        assert_eq!(Message::parse(0x76, &[], false), Message::NmtForceFlyingMaster);
    }

    #[test]
    fn test_parse_sync_and_heartbeat() {
        assert_eq!(Message::parse(0x080, &[], false), Message::Sync { counter: None });
        assert_eq!(Message::parse(0x080, &[7], false), Message::Sync { counter: Some(7) });
        assert_eq!(
            Message::parse(0x705, &[0x7F], false),
            Message::Heartbeat { node_id: 5, state: 0x7F }
        );
        assert_eq!(
            Message::parse(0x705, &[0x00], false),
            Message::Heartbeat { node_id: 5, state: 0 }
        );
    }

    #[test]
    fn test_parse_sdo() {
        let req = [0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0];
        assert_eq!(
            Message::parse(0x602, &req, false),
            Message::SdoRequest { node_id: 2, data: req }
        );
        assert_eq!(
            Message::parse(0x582, &req, false),
            Message::SdoResponse { node_id: 2, data: req }
        );
    }

    #[test]
    fn test_time_round_trip() {
        let (cob, data) = time(0x100, 43_200_000, 15_000);
        match Message::parse(cob, &data, false) {
            Message::Time { millis, days } => {
                assert_eq!(millis, 43_200_000);
                assert_eq!(days, 15_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
