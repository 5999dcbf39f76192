//! PDO engine. Communication and mapping parameters live in the object
//! dictionary (0x1800+i / 0x1A00+i for TPDOs, 0x1400+i / 0x1600+i for
//! RPDOs); this module keeps a decoded copy refreshed after every relevant
//! download and drives transmission-type dispatch.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::error::ErrorCode;
use crate::node::Node;
use crate::object_dictionary::{
    ObjectDictionary, ODI_RPDO_COMM_BASE, ODI_RPDO_MAPPING_BASE, ODI_TPDO_COMM_BASE,
    ODI_TPDO_MAPPING_BASE,
};
use crate::prelude::*;
use crate::timers::TimerEvent;
use crate::{debug, error, info};

pub(crate) const MAX_PDO_MAPPINGS: u64 = 64;

pub(crate) const EMCY_PDO_NOT_PROCESSED: u16 = 0x8210;

/// Decoded communication + mapping parameters of one PDO.
#[derive(Debug, Clone, Default)]
pub struct PdoConfig {
    pub valid: bool,
    pub rtr_allowed: bool,
    pub cob_id: u16,
    pub transmission_type: u8,
    pub inhibit_time_100us: u16,
    pub event_timer_ms: u16,
    pub sync_start: u8,
    /// `(index, subindex, bit length)` per mapped application object.
    pub mappings: Vec<(u16, u8, u8)>,
}

impl PdoConfig {
    fn from_od(od: &ObjectDictionary, comm_index: u16, mapping_index: u16) -> Option<PdoConfig> {
        let comm = od.get(comm_index)?;
        let cob = comm.get(1)?.value().as_u64()? as u32;
        let mut config = PdoConfig {
            valid: cob >> 31 & 1 == 0,
            rtr_allowed: cob >> 30 & 1 == 0,
            cob_id: (cob & 0x1FFF_FFFF) as u16 & 0x7FF,
            transmission_type: comm.get(2).and_then(|s| s.value().as_u64()).unwrap_or(0xFF) as u8,
            inhibit_time_100us: comm.get(3).and_then(|s| s.value().as_u64()).unwrap_or(0) as u16,
            event_timer_ms: comm.get(5).and_then(|s| s.value().as_u64()).unwrap_or(0) as u16,
            sync_start: comm.get(6).and_then(|s| s.value().as_u64()).unwrap_or(0) as u8,
            mappings: Vec::new(),
        };
        let mapping = od.get(mapping_index)?;
        let count = mapping.value()?.as_u64()?.min(MAX_PDO_MAPPINGS);
        for sub in 1..=count as u8 {
            let entry = mapping.get(sub)?.value().as_u64()? as u32;
            config.mappings.push((
                (entry >> 16) as u16,
                ((entry >> 8) & 0xFF) as u8,
                (entry & 0xFF) as u8,
            ));
        }
        Some(config)
    }

    /// Byte length of the assembled payload.
    pub fn total_bytes(&self) -> usize {
        self.mappings.iter().map(|&(_, _, bits)| bits as usize / 8).sum()
    }
}

/// Per-TPDO transmission bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TpdoRuntime {
    /// Application or RTR trigger waiting for the send condition.
    pub triggered: bool,
    pub last_tx_ms: Option<u64>,
    /// A send deferred by the inhibit window is pending on a timer.
    pub inhibit_pending: bool,
}

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    /// Re-reads every PDO parameter set from the object dictionary.
    pub(crate) fn refresh_pdo_configuration(&mut self) {
        for i in 0..4u16 {
            self.tpdo_configs[i as usize] =
                PdoConfig::from_od(&self.od, ODI_TPDO_COMM_BASE + i, ODI_TPDO_MAPPING_BASE + i)
                    .unwrap_or_default();
            self.rpdo_configs[i as usize] =
                PdoConfig::from_od(&self.od, ODI_RPDO_COMM_BASE + i, ODI_RPDO_MAPPING_BASE + i)
                    .unwrap_or_default();
        }
    }

    /// Concatenates the encoded bytes of every mapped sub-object; the result
    /// must match the mapped bit lengths exactly.
    fn assemble_tpdo(&self, pdo: usize) -> Result<Vec<u8>, ErrorCode> {
        let config = &self.tpdo_configs[pdo];
        let mut data = Vec::with_capacity(8);
        for &(index, subindex, bits) in &config.mappings {
            let sub = self
                .od
                .get(index)
                .and_then(|o| o.get(subindex))
                .ok_or(ErrorCode::MissingObject { index })?;
            let bytes = sub.to_bytes();
            if bytes.len() != bits as usize / 8 {
                return Err(ErrorCode::PdoMappingLengthMismatch { index });
            }
            data.extend_from_slice(&bytes);
        }
        if data.len() > 8 {
            return Err(ErrorCode::PdoMappingLengthMismatch {
                index: ODI_TPDO_MAPPING_BASE + pdo as u16,
            });
        }
        Ok(data)
    }

    /// Sends TPDO `pdo` (0-based) now, or defers it into the inhibit window.
    pub(crate) fn send_tpdo(&mut self, pdo: usize) {
        let config = &self.tpdo_configs[pdo];
        if !config.valid {
            return;
        }
        let inhibit_ms = config.inhibit_time_100us as u64 / 10;
        let cob_id = config.cob_id;
        if inhibit_ms > 0 {
            if let Some(last) = self.tpdo_runtime[pdo].last_tx_ms {
                let allowed_at = last + inhibit_ms;
                if self.now_ms < allowed_at {
                    if !self.tpdo_runtime[pdo].inhibit_pending {
                        self.tpdo_runtime[pdo].inhibit_pending = true;
                        self.timers.one_shot(
                            self.now_ms,
                            allowed_at - self.now_ms,
                            TimerEvent::TpdoInhibitElapsed(pdo as u8),
                        );
                    }
                    self.tpdo_runtime[pdo].triggered = true;
                    return;
                }
            }
        }
        match self.assemble_tpdo(pdo) {
            Ok(data) => match crate::util::create_frame::<CAN::Frame>(cob_id, &data) {
                Ok(frame) => {
                    self.transmit(&frame);
                    self.tpdo_runtime[pdo].last_tx_ms = Some(self.now_ms);
                    self.tpdo_runtime[pdo].triggered = false;
                    self.tpdo_runtime[pdo].inhibit_pending = false;
                }
                Err(ec) => {
                    error!("Errors in creating TPDO frame: {:?}", ec);
                }
            },
            Err(ec) => {
                error!("TPDO{} not sent: {:?}", pdo + 1, ec);
            }
        }
    }

    pub(crate) fn on_tpdo_inhibit_elapsed(&mut self, pdo: usize) {
        self.tpdo_runtime[pdo].inhibit_pending = false;
        if self.tpdo_runtime[pdo].triggered && self.is_operational() {
            self.send_tpdo(pdo);
        }
    }

    /// SYNC reception while Operational: bump the counter and serve the
    /// synchronous transmission types, lowest PDO first.
    pub(crate) fn dispatch_synchronous_tpdos(&mut self) {
        self.sync_counter = (self.sync_counter + 1) % 241;
        for pdo in 0..4 {
            let config = &self.tpdo_configs[pdo];
            if !config.valid {
                continue;
            }
            let tt = config.transmission_type;
            let send = match tt {
                0x00 | 0xFC => self.tpdo_runtime[pdo].triggered,
                1..=240 => self.sync_counter % tt == 0,
                _ => false,
            };
            if send {
                debug!("SYNC #{} triggers TPDO{}", self.sync_counter, pdo + 1);
                self.send_tpdo(pdo);
            }
        }
    }

    /// Event-driven TPDO trigger (application API). Synchronous types defer
    /// to the next SYNC window.
    pub fn trigger_tpdo(&mut self, tpdo: usize) {
        if tpdo == 0 || tpdo > 4 {
            return;
        }
        let pdo = tpdo - 1;
        let config = &self.tpdo_configs[pdo];
        if !config.valid {
            return;
        }
        match config.transmission_type {
            0xFE | 0xFF => {
                if self.is_operational() {
                    self.send_tpdo(pdo);
                }
            }
            _ => self.tpdo_runtime[pdo].triggered = true,
        }
    }

    /// Remote request for one of our TPDO COB-IDs.
    pub(crate) fn process_tpdo_rtr(&mut self, cob_id: u16) {
        if !self.is_operational() {
            return;
        }
        for pdo in 0..4 {
            let config = &self.tpdo_configs[pdo];
            if !config.valid || !config.rtr_allowed || config.cob_id != cob_id {
                continue;
            }
            match config.transmission_type {
                0xFC => self.tpdo_runtime[pdo].triggered = true,
                0xFD => self.send_tpdo(pdo),
                _ => {}
            }
            return;
        }
    }

    /// Distributes a received RPDO payload into the mapped sub-objects.
    pub(crate) fn process_rpdo(&mut self, cob_id: u16, data: &[u8]) {
        let Some(pdo) = self
            .rpdo_configs
            .iter()
            .position(|c| c.valid && c.cob_id == cob_id)
        else {
            return;
        };
        let config = self.rpdo_configs[pdo].clone();
        if data.len() != config.total_bytes() {
            info!(
                "RPDO{} length mismatch: got {} bytes, mapping wants {}",
                pdo + 1,
                data.len(),
                config.total_bytes()
            );
            self.emcy(EMCY_PDO_NOT_PROCESSED, [0; 5]);
            return;
        }
        let mut offset = 0usize;
        for &(index, subindex, bits) in &config.mappings {
            let len = bits as usize / 8;
            let chunk = &data[offset..offset + len];
            offset += len;
            match self.od.sub_mut(index, subindex) {
                Ok(sub) => {
                    if let Err(code) = sub.write_bytes(chunk) {
                        info!("RPDO write to {:#06x}:{} rejected: {:?}", index, subindex, code);
                    }
                }
                Err(_) => {
                    info!("RPDO maps missing object {:#06x}:{}", index, subindex);
                }
            }
        }
    }
}
