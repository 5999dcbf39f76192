//! Emergency object and TIME service. EMCY frames carry the active error
//! register and feed the pre-defined error field FIFO at 0x1003.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::data_type::DataType;
use crate::message;
use crate::node::{NmtState, Node};
use crate::object_dictionary::{
    AccessType, SubObject, ODI_EMCY_COB_ID, ODI_EMCY_INHIBIT_TIME, ODI_ERROR_REGISTER,
    ODI_PREDEFINED_ERROR_FIELD, ODI_TIME_COB_ID,
};
use crate::prelude::*;
use crate::timers::TimerEvent;
use crate::value::Value;
use crate::{error, info};

pub const EMCY_RESET: u16 = 0x0000;
pub const EMCY_HEARTBEAT_BY_NODE: u16 = 0x8F00;

/// The error field holds at most 254 entries (sub-indices 1..=0xFE).
const ERROR_FIFO_CAP: u8 = 0xFE;

const MS_PER_DAY: u64 = 86_400_000;

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    /// Emits an emergency message and records it in the error history.
    pub fn emcy(&mut self, eec: u16, msef: [u8; 5]) {
        self.push_error_history(eec, msef);
        self.send_emcy(eec, msef);
    }

    /// "Error reset / no error" frame; the history keeps its entries.
    pub fn reset_emcy(&mut self) {
        self.send_emcy(EMCY_RESET, [0; 5]);
    }

    fn emcy_cob_id(&self) -> Option<u16> {
        let cob = self.od.unsigned_value(ODI_EMCY_COB_ID, 0)? as u32;
        if cob >> 31 & 1 == 1 {
            return None;
        }
        Some((cob & 0x1FFF_FFFF) as u16 & 0x7FF)
    }

    /// Newest error lands at sub-index 1; older entries shift down, capped
    /// at 254. Sub-index 0 tracks the current depth.
    fn push_error_history(&mut self, eec: u16, msef: [u8; 5]) {
        let Some(object) = self.od.get_mut(ODI_PREDEFINED_ERROR_FIELD) else { return };
        let old_len = object.value().and_then(|v| v.as_u64()).unwrap_or(0) as u8;
        let new_len = (old_len + 1).min(ERROR_FIFO_CAP);
        for si in (1..=old_len.min(ERROR_FIFO_CAP - 1)).rev() {
            if let Some(value) = object.get(si).map(|s| s.value().clone()) {
                match object.get_mut(si + 1) {
                    Some(sub) => sub.set_value(value),
                    None => object.insert(
                        si + 1,
                        SubObject::new("Standard error field", DataType::Unsigned32, AccessType::Ro, value),
                    ),
                }
            }
        }
        let msef_low = u16::from_le_bytes([msef[0], msef[1]]);
        let entry = Value::Unsigned32(((msef_low as u32) << 16) | eec as u32);
        match object.get_mut(1) {
            Some(sub) => sub.set_value(entry),
            None => object.insert(
                1,
                SubObject::new("Standard error field", DataType::Unsigned32, AccessType::Ro, entry),
            ),
        }
        if let Some(count) = object.get_mut(0) {
            count.set_value(Value::Unsigned8(new_len));
        }
    }

    /// Clears the error history (SDO download of 0 to 0x1003:0).
    pub(crate) fn clear_error_history(&mut self) {
        let Some(object) = self.od.get_mut(ODI_PREDEFINED_ERROR_FIELD) else { return };
        let len = object.value().and_then(|v| v.as_u64()).unwrap_or(0) as u8;
        for si in 1..=len {
            if let Some(sub) = object.get_mut(si) {
                sub.set_value(Value::Unsigned32(0));
            }
        }
        if let Some(count) = object.get_mut(0) {
            count.set_value(Value::Unsigned8(0));
        }
    }

    fn send_emcy(&mut self, eec: u16, msef: [u8; 5]) {
        if self.state == NmtState::Stopped {
            // Queued until the node leaves Stopped.
            self.pending_emcy.push((eec, msef));
            return;
        }
        let Some(cob) = self.emcy_cob_id() else { return };
        let Some(er) = self.od.unsigned_value(ODI_ERROR_REGISTER, 0) else { return };

        let inhibit_ms = self
            .od
            .unsigned_value(ODI_EMCY_INHIBIT_TIME, 0)
            .unwrap_or(0)
            / 10;
        if inhibit_ms > 0 {
            if let Some(last) = self.last_emcy_ms {
                let allowed_at = last + inhibit_ms;
                if self.now_ms < allowed_at {
                    info!("EMCY inhibit window active, delaying message");
                    self.deferred_emcy.push((eec, msef));
                    self.timers.one_shot(
                        self.now_ms,
                        allowed_at - self.now_ms,
                        TimerEvent::EmcyInhibitElapsed,
                    );
                    return;
                }
            }
        }
        let (cob_id, payload) = message::emcy(cob, eec, er as u8, msef);
        match crate::util::create_frame_with_padding::<CAN::Frame>(cob_id, &payload) {
            Ok(frame) => {
                self.transmit(&frame);
                self.last_emcy_ms = Some(self.now_ms);
            }
            Err(ec) => {
                error!("Errors in creating EMCY frame: {:?}", ec);
            }
        }
    }

    pub(crate) fn on_emcy_inhibit_elapsed(&mut self) {
        if !self.deferred_emcy.is_empty() {
            let (eec, msef) = self.deferred_emcy.remove(0);
            self.send_emcy(eec, msef);
        }
    }

    /// Flushes emergencies queued while the node was Stopped.
    pub(crate) fn flush_pending_emcy(&mut self) {
        let pending = core::mem::take(&mut self.pending_emcy);
        for (eec, msef) in pending {
            self.send_emcy(eec, msef);
        }
    }

    // TIME service.

    /// Emits a TIME frame when OD 0x1012 flags this node as TIME producer
    /// (bit 30). Without an explicit timestamp the node's network time is
    /// used.
    pub fn send_time(&mut self, ts: Option<(u16, u32)>) {
        let Some(cob) = self.od.unsigned_value(ODI_TIME_COB_ID, 0) else { return };
        if cob >> 30 & 1 == 0 {
            return;
        }
        let Some((days, millis)) = ts.or_else(|| self.timestamp()) else {
            info!("TIME production requested without a known timestamp");
            return;
        };
        let (cob_id, payload) = message::time((cob & 0x1FFF_FFFF) as u16 & 0x7FF, millis, days);
        match crate::util::create_frame::<CAN::Frame>(cob_id, &payload) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating TIME frame: {:?}", ec);
            }
        }
    }

    /// Network time `(days since 1984-01-01, ms after midnight)` projected
    /// to the current poll instant.
    pub fn timestamp(&self) -> Option<(u16, u32)> {
        let base = self.time_base?;
        let elapsed = self.now_ms - base.local_ms;
        let total = base.millis as u64 + elapsed;
        let days = base.days as u64 + total / MS_PER_DAY;
        Some((days as u16, (total % MS_PER_DAY) as u32))
    }

    pub fn set_timestamp(&mut self, days: u16, millis: u32) {
        self.time_base = Some(crate::node::TimeBase {
            local_ms: self.now_ms,
            days,
            millis: millis % MS_PER_DAY as u32,
        });
    }

    /// A TIME frame observed on the bus; honoured when OD 0x1012 flags the
    /// node as TIME consumer (bit 31).
    pub(crate) fn process_time_frame(&mut self, cob_id: u16, millis: u32, days: u16) {
        let Some(cob) = self.od.unsigned_value(ODI_TIME_COB_ID, 0) else { return };
        if cob >> 31 & 1 == 0 {
            return;
        }
        if (cob & 0x1FFF_FFFF) as u16 & 0x7FF != cob_id {
            return;
        }
        self.set_timestamp(days, millis);
    }
}
