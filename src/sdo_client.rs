//! Outbound expedited SDO requests, used while this node acts as NMT
//! master (device type and identity reads during slave boot, configuration
//! writes). One request per slave may be in flight; the receive dispatcher
//! resolves it, a scheduler timeout expires it.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::message::{FUNCTION_CODE_BITNUM, FUNCTION_CODE_SDO_RX, FUNCTION_CODE_SDO_TX};
use crate::node::Node;
use crate::object_dictionary::{ODI_SDO_CLIENT_HIGH, ODI_SDO_CLIENT_LOW};
use crate::prelude::*;
use crate::timers::{TimerEvent, TimerHandle};
use crate::{error, info};

pub const SDO_CLIENT_TIMEOUT_MS: u64 = 5_000;

/// Result of a completed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum SdoClientOutcome {
    /// Expedited upload data (or empty for a confirmed download).
    Ok(Vec<u8>),
    Abort(u32),
    Timeout,
}

#[derive(Debug, Clone)]
pub(crate) struct SdoClientRequest {
    pub index: u16,
    pub subindex: u8,
    pub is_upload: bool,
    pub timer: TimerHandle,
}

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    /// COB-ID pair toward a slave's SDO server: a configured client entry
    /// (0x1280..0x12FF) wins over the pre-defined connection set.
    fn sdo_client_cobs(&self, slave_id: u8) -> (u16, u16) {
        for index in ODI_SDO_CLIENT_LOW..=ODI_SDO_CLIENT_HIGH {
            let Some(object) = self.od.get(index) else { continue };
            let node = object.get(3).and_then(|s| s.value().as_u64());
            if node == Some(slave_id as u64) {
                let tx = object.get(1).and_then(|s| s.value().as_u64());
                let rx = object.get(2).and_then(|s| s.value().as_u64());
                if let (Some(tx), Some(rx)) = (tx, rx) {
                    if tx & 0x8000_0000 == 0 && rx & 0x8000_0000 == 0 {
                        return ((tx & 0x7FF) as u16, (rx & 0x7FF) as u16);
                    }
                }
            }
        }
        (
            (FUNCTION_CODE_SDO_RX << FUNCTION_CODE_BITNUM) | slave_id as u16,
            (FUNCTION_CODE_SDO_TX << FUNCTION_CODE_BITNUM) | slave_id as u16,
        )
    }

    /// Expedited upload request toward `slave_id`. Any request already in
    /// flight for the slave is dropped as timed out.
    pub fn sdo_upload_request(&mut self, slave_id: u8, index: u16, subindex: u8) {
        self.start_sdo_request(slave_id, index, subindex, true, &[0u8; 4], 0x40);
    }

    /// Expedited download request (up to 4 bytes) toward `slave_id`.
    pub fn sdo_download_request(&mut self, slave_id: u8, index: u16, subindex: u8, data: &[u8]) {
        let len = data.len().min(4);
        let mut payload = [0u8; 4];
        payload[..len].copy_from_slice(&data[..len]);
        let cmd = 0x23 | (((4 - len) as u8) << 2);
        self.start_sdo_request(slave_id, index, subindex, false, &payload, cmd);
    }

    fn start_sdo_request(
        &mut self,
        slave_id: u8,
        index: u16,
        subindex: u8,
        is_upload: bool,
        payload: &[u8; 4],
        cmd: u8,
    ) {
        if let Some(stale) = self.sdo_requests.remove(&slave_id) {
            self.timers.cancel(stale.timer);
            self.on_sdo_client_result(slave_id, stale, SdoClientOutcome::Timeout);
        }
        let (request_cob, _) = self.sdo_client_cobs(slave_id);
        let mut frame_data = vec![cmd];
        frame_data.extend_from_slice(&index.to_le_bytes());
        frame_data.push(subindex);
        frame_data.extend_from_slice(payload);
        match crate::util::create_frame_with_padding::<CAN::Frame>(request_cob, &frame_data) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating SDO client frame: {:?}", ec);
                return;
            }
        }
        let timer = self
            .timers
            .one_shot(self.now_ms, SDO_CLIENT_TIMEOUT_MS, TimerEvent::SdoClientTimeout(slave_id));
        self.sdo_requests
            .insert(slave_id, SdoClientRequest { index, subindex, is_upload, timer });
    }

    /// Frame on a slave's server-to-client COB-ID.
    pub(crate) fn process_sdo_client_response(&mut self, slave_id: u8, data: [u8; 8]) {
        let Some(request) = self.sdo_requests.get(&slave_id) else { return };
        let index = u16::from_le_bytes([data[1], data[2]]);
        let subindex = data[3];
        let scs = data[0] >> 5;
        if scs != 4 && (index != request.index || subindex != request.subindex) {
            return;
        }
        let request = self.sdo_requests.remove(&slave_id).unwrap();
        self.timers.cancel(request.timer);

        let outcome = match scs {
            4 => SdoClientOutcome::Abort(u32::from_le_bytes([data[4], data[5], data[6], data[7]])),
            2 if request.is_upload => {
                let n = if data[0] & 0x03 == 0x03 { ((data[0] >> 2) & 0x3) as usize } else { 0 };
                SdoClientOutcome::Ok(data[4..8 - n].to_vec())
            }
            3 if !request.is_upload => SdoClientOutcome::Ok(Vec::new()),
            _ => {
                info!("Unexpected SDO response from node {}: {:x?}", slave_id, data);
                return;
            }
        };
        self.on_sdo_client_result(slave_id, request, outcome);
    }

    pub(crate) fn on_sdo_client_timeout(&mut self, slave_id: u8) {
        if let Some(request) = self.sdo_requests.remove(&slave_id) {
            info!("SDO request to node {} timed out ({:#06x}:{})", slave_id, request.index, request.subindex);
            self.on_sdo_client_result(slave_id, request, SdoClientOutcome::Timeout);
        }
    }
}
