//! NMT engine: slave state machine, fixed and flying master roles, the CiA
//! 302-2 slave boot pipeline, heartbeat production/consumption and the
//! dual-bus redundancy evaluation.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::emergency::EMCY_HEARTBEAT_BY_NODE;
use crate::error::NmtBootErrorCode;
use crate::message::{self, NmtCommand};
use crate::node::{ActiveInterface, NmtState, Node};
use crate::object_dictionary::{
    ODI_BOOT_TIME, ODI_DEVICE_TYPE_IDENTIFICATION, ODI_EXPECTED_CONFIGURATION_DATE,
    ODI_EXPECTED_CONFIGURATION_TIME, ODI_HEARTBEAT_CONSUMER_TIME, ODI_HEARTBEAT_PRODUCER_TIME,
    ODI_NMT_FLYING_MASTER_TIMING_PARAMETERS, ODI_NMT_INHIBIT_TIME, ODI_NMT_SLAVE_ASSIGNMENT,
    ODI_NMT_STARTUP, ODI_REDUNDANCY_CONFIGURATION, ODI_REQUEST_NMT,
    ODSI_FLYING_MASTER_DELAY, ODSI_FLYING_MASTER_DETECT_TIME, ODSI_FLYING_MASTER_DEVICE_TIME_SLOT,
    ODSI_FLYING_MASTER_PRIORITY, ODSI_FLYING_MASTER_PRIORITY_TIME_SLOT,
    ODSI_FLYING_MASTER_TIMEOUT, ODSI_REDUNDANCY_ERROR_COUNT, ODSI_REDUNDANCY_ERROR_THRESHOLD,
    ODSI_REDUNDANCY_HB_EVAL_POWER_ON, ODSI_REDUNDANCY_HB_EVAL_RESET_COMM,
};
use crate::prelude::*;
use crate::sdo_client::{SdoClientOutcome, SdoClientRequest};
use crate::timers::TimerEvent;
use crate::value::Value;
use crate::{info, warn};

/// Retry backoff for the device-type upload during slave boot (route B).
const BOOT_SLAVE_RETRY_MS: u64 = 1_000;

/// NMT master role, driven by flying-master negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterRole {
    /// Not master capable, or capability not yet exercised.
    Slave,
    /// Negotiation in progress.
    CandidateActive,
    ActiveMaster,
    InactiveMaster,
}

/// Decoded OD 0x1F80.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NmtStartupBits(pub u32);

impl NmtStartupBits {
    pub fn is_master(&self) -> bool {
        self.0 & 0x01 != 0
    }
    pub fn start_all_with_broadcast(&self) -> bool {
        self.0 & 0x02 != 0
    }
    pub fn self_starting(&self) -> bool {
        self.0 & 0x04 == 0
    }
    pub fn start_only_explicitly(&self) -> bool {
        self.0 & 0x08 != 0
    }
    pub fn flying_master(&self) -> bool {
        self.0 & 0x20 != 0
    }
    pub fn do_not_start_slaves(&self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// Per-slave boot pipeline state (CiA 302-2 routes A..O).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BootSlaveState {
    DeviceType,
    Identity { subindex: u8 },
    ConfigDate,
    ConfigTime { date: u32 },
    WaitHeartbeat,
    Done,
    Failed(NmtBootErrorCode),
}

#[derive(Debug, Clone)]
pub(crate) struct BootSlave {
    pub state: BootSlaveState,
    pub mandatory: bool,
}

/// Which redundancy evaluation window is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HbEvalKind {
    PowerOn,
    ResetComm,
}

/// Heartbeat census on the default bus during an evaluation window.
#[derive(Debug, Clone)]
pub(crate) struct HbEvaluation {
    pub kind: HbEvalKind,
    pub counts: HashMap<u8, u32>,
}

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    fn startup_bits(&self) -> NmtStartupBits {
        NmtStartupBits(self.od.unsigned_value(ODI_NMT_STARTUP, 0).unwrap_or(0) as u32)
    }

    pub fn is_nmt_master_capable(&self) -> bool {
        self.startup_bits().is_master()
    }

    pub fn is_active_nmt_master(&self) -> bool {
        self.role == MasterRole::ActiveMaster
    }

    pub fn master_role(&self) -> MasterRole {
        self.role
    }

    fn flying_master_timing(&self, subindex: u8) -> u64 {
        self.od
            .unsigned_value(ODI_NMT_FLYING_MASTER_TIMING_PARAMETERS, subindex)
            .unwrap_or(0)
    }

    // NMT slave side.

    pub(crate) fn process_nmt_node_control(&mut self, command: NmtCommand, target: u8) {
        if target != self.node_id && target != message::BROADCAST_NODE_ID {
            return;
        }
        match command {
            NmtCommand::Start => {
                info!("NMT: entering OPERATIONAL");
                self.set_nmt_state(NmtState::Operational);
            }
            NmtCommand::Stop => {
                info!("NMT: entering STOPPED");
                self.set_nmt_state(NmtState::Stopped);
            }
            NmtCommand::EnterPreOperational => {
                info!("NMT: entering PRE-OPERATIONAL");
                self.set_nmt_state(NmtState::PreOperational);
            }
            NmtCommand::ResetNode => {
                info!("NMT: reset node");
                self.reset();
            }
            NmtCommand::ResetCommunication => {
                info!("NMT: reset communication");
                self.reset_communication();
            }
        }
    }

    /// Runs the CiA 302 startup process after the boot-up frame.
    pub(crate) fn nmt_startup(&mut self) {
        if !self.od.contains(ODI_NMT_STARTUP) {
            info!("Entering NMT slave mode");
            return;
        }
        let bits = self.startup_bits();
        if bits.is_master() {
            if bits.flying_master() {
                self.flying_master_startup();
            } else {
                self.become_active_master();
            }
        } else if bits.self_starting() {
            info!("Self-starting into OPERATIONAL");
            self.set_nmt_state(NmtState::Operational);
        }
    }

    // Flying master negotiation.

    fn flying_master_startup(&mut self) {
        self.role = MasterRole::CandidateActive;
        let delay = self.flying_master_timing(ODSI_FLYING_MASTER_DELAY);
        self.cancel_timer_slot(|node| &mut node.flying_master_delay_timer);
        let handle = self
            .timers
            .one_shot(self.now_ms, delay, TimerEvent::FlyingMasterDelayElapsed);
        self.flying_master_delay_timer = Some(handle);
    }

    /// Negotiation delay elapsed: ask whether an active master exists.
    pub(crate) fn on_flying_master_delay_elapsed(&mut self) {
        info!("Service active NMT master detection");
        let (cob, data) = message::active_master_request();
        self.send_nmt_frame(cob, &data);
        let timeout = self.flying_master_timing(ODSI_FLYING_MASTER_TIMEOUT);
        self.cancel_timer_slot(|node| &mut node.active_master_timer);
        let handle = self
            .timers
            .one_shot(self.now_ms, timeout, TimerEvent::ActiveMasterDetectTimeout);
        self.active_master_timer = Some(handle);
    }

    /// No active master answered inside the detection window.
    pub(crate) fn on_active_master_timeout(&mut self) {
        self.active_master_timer = None;
        if self.first_boot {
            info!("Active NMT master timeout after power-on");
            self.first_boot = false;
            self.send_nmt_node_control(NmtCommand::ResetCommunication, message::BROADCAST_NODE_ID);
            self.flying_master_startup();
        } else {
            info!("Active NMT master timeout, requesting negotiation");
            self.flying_master_negotiation_request();
        }
    }

    fn flying_master_negotiation_request(&mut self) {
        let (cob, data) = message::flying_master_request();
        self.send_nmt_frame(cob, &data);
        self.flying_master_negotiation();
    }

    /// Arms the per-device negotiation window
    /// `priority * priority_slot + node_id * device_slot`.
    pub(crate) fn flying_master_negotiation(&mut self) {
        let priority = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY);
        let priority_slot = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY_TIME_SLOT);
        let device_slot = self.flying_master_timing(ODSI_FLYING_MASTER_DEVICE_TIME_SLOT);
        let wait = priority * priority_slot + self.node_id as u64 * device_slot;
        self.role = MasterRole::CandidateActive;
        self.cancel_timer_slot(|node| &mut node.flying_master_negotiation_timer);
        let handle = self
            .timers
            .one_shot(self.now_ms, wait, TimerEvent::FlyingMasterNegotiationTimeout);
        self.flying_master_negotiation_timer = Some(handle);
    }

    /// Own negotiation slot expired unanswered: claim mastership.
    pub(crate) fn on_flying_master_negotiation_timeout(&mut self) {
        self.flying_master_negotiation_timer = None;
        let priority = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY) as u8;
        let (cob, data) = message::master_node_id(priority, self.node_id);
        self.send_nmt_frame(cob, &data);
        self.become_active_master();
    }

    /// Periodic multiple-master detection while active.
    pub(crate) fn on_multiple_master_detect(&mut self) {
        let (cob, data) = message::force_flying_master();
        self.send_nmt_frame(cob, &data);
    }

    fn compare_flying_master_priority(&mut self, priority: u8) {
        let own = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY) as u8;
        if priority <= own {
            info!("Active NMT master priority wins, yielding");
            self.become_inactive_master();
        } else {
            info!("Active NMT master priority is lower, forcing renegotiation");
            let (cob, data) = message::force_flying_master();
            self.send_nmt_frame(cob, &data);
            self.flying_master_startup();
        }
    }

    pub(crate) fn handle_master_node_id(&mut self, priority: u8, node_id: u8) {
        if !self.is_nmt_master_capable() {
            return;
        }
        info!("Active NMT master announced with node-ID {}", node_id);
        self.active_master_id = Some(node_id);
        let mut compare = false;
        if self.cancel_timer_slot(|node| &mut node.active_master_timer) {
            self.first_boot = false;
            compare = true;
        }
        if self.cancel_timer_slot(|node| &mut node.flying_master_negotiation_timer) {
            compare = true;
        }
        if self.cancel_timer_slot(|node| &mut node.multiple_master_timer) {
            compare = true;
        }
        if compare {
            self.compare_flying_master_priority(priority);
        }
    }

    pub(crate) fn handle_active_master_request(&mut self) {
        if self.is_active_nmt_master() {
            let priority = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY) as u8;
            let (cob, data) = message::master_node_id(priority, self.node_id);
            self.send_nmt_frame(cob, &data);
        }
    }

    pub(crate) fn handle_flying_master_request(&mut self) {
        let bits = self.startup_bits();
        if bits.is_master() && bits.flying_master() {
            self.flying_master_negotiation();
        }
    }

    pub(crate) fn handle_master_request(&mut self) {
        if self.is_nmt_master_capable() {
            let (cob, data) = message::master_response();
            self.send_nmt_frame(cob, &data);
        }
    }

    pub(crate) fn handle_force_flying_master(&mut self) {
        if self.is_nmt_master_capable() {
            info!("Force flying master negotiation indicated");
            self.become_inactive_master();
            self.flying_master_startup();
        }
    }

    fn become_active_master(&mut self) {
        info!("Device is active NMT master");
        let was_active = self.role == MasterRole::ActiveMaster;
        self.role = MasterRole::ActiveMaster;
        self.active_master_id = Some(self.node_id);
        if !was_active {
            self.hooks.on_active_nmt_master_won();
        }

        let detect = self.flying_master_timing(ODSI_FLYING_MASTER_DETECT_TIME);
        self.cancel_timer_slot(|node| &mut node.multiple_master_timer);
        if detect > 0 && self.startup_bits().flying_master() {
            let handle = self
                .timers
                .interval(self.now_ms, detect, TimerEvent::MultipleMasterDetect);
            self.multiple_master_timer = Some(handle);
        }

        // Reset communication for slaves without the keep-alive bit, then
        // walk the boot pipeline for the mandatory ones.
        let assignments = self.slave_assignments();
        let mut mandatory = Vec::new();
        let mut keep_alive = 0usize;
        for &(slave_id, assignment) in &assignments {
            if assignment & 0x09 == 0x09 {
                mandatory.push(slave_id);
            }
            if assignment & 0x10 != 0 {
                keep_alive += 1;
            }
        }
        if assignments.is_empty() || keep_alive == 0 {
            info!("No keep-alive slaves, resetting communication for all");
            self.send_nmt_node_control(NmtCommand::ResetCommunication, message::BROADCAST_NODE_ID);
        } else {
            for &(slave_id, assignment) in &assignments {
                if assignment & 0x10 == 0 {
                    self.send_nmt_node_control(NmtCommand::ResetCommunication, slave_id);
                }
            }
        }

        self.boot_time_expired = false;
        self.startup_finalized = false;
        self.cancel_timer_slot(|node| &mut node.boot_timer);
        let boot_time = self.od.unsigned_value(ODI_BOOT_TIME, 0).unwrap_or(0);
        if boot_time > 0 {
            let handle = self.timers.one_shot(self.now_ms, boot_time, TimerEvent::BootTimeExpired);
            self.boot_timer = Some(handle);
        }

        self.boot_slaves.clear();
        for slave_id in mandatory {
            self.start_boot_slave(slave_id, true);
        }
        self.try_finalize_master_startup();
    }

    fn become_inactive_master(&mut self) {
        info!("Device is not active NMT master, running in NMT slave mode");
        let was_active = self.role == MasterRole::ActiveMaster;
        self.role = MasterRole::InactiveMaster;
        if was_active {
            self.hooks.on_active_nmt_master_lost();
        }
        self.cancel_timer_slot(|node| &mut node.multiple_master_timer);
        self.cancel_timer_slot(|node| &mut node.active_master_timer);
        let master_watched = self
            .active_master_id
            .map(|id| self.heartbeat_consumer_timers.contains_key(&id))
            .unwrap_or(false);
        if !master_watched {
            // Not a configured heartbeat consumer of the winner; fall back
            // to twice our own producer period as the master watchdog.
            let producer = self
                .od
                .unsigned_value(ODI_HEARTBEAT_PRODUCER_TIME, 0)
                .unwrap_or(0);
            if producer > 0 {
                self.first_boot = true;
                let handle = self.timers.one_shot(
                    self.now_ms,
                    producer * 2,
                    TimerEvent::ActiveMasterDetectTimeout,
                );
                self.active_master_timer = Some(handle);
            }
        }
    }

    fn slave_assignments(&self) -> Vec<(u8, u32)> {
        let mut out = Vec::new();
        if let Some(object) = self.od.get(ODI_NMT_SLAVE_ASSIGNMENT) {
            let len = object.value().and_then(|v| v.as_u64()).unwrap_or(0) as u8;
            for slave_id in 1..=len {
                if slave_id == self.node_id {
                    continue;
                }
                if let Some(value) = object.get(slave_id).and_then(|s| s.value().as_u64()) {
                    out.push((slave_id, value as u32));
                }
            }
        }
        out
    }

    fn slave_assignment(&self, slave_id: u8) -> u32 {
        self.od
            .unsigned_value(ODI_NMT_SLAVE_ASSIGNMENT, slave_id)
            .unwrap_or(0) as u32
    }

    // Boot slave pipeline.

    pub(crate) fn start_boot_slave(&mut self, slave_id: u8, mandatory: bool) {
        let assignment = self.slave_assignment(slave_id);
        if assignment & 0x01 == 0 {
            // Route A: not in the network list.
            self.boot_slaves
                .insert(slave_id, BootSlave { state: BootSlaveState::Failed(NmtBootErrorCode::A), mandatory });
            self.report_boot_error(slave_id, NmtBootErrorCode::A);
            return;
        }
        if assignment & 0x02 != 0 {
            info!("Boot slave process for node-ID {}", slave_id);
            self.boot_slaves
                .insert(slave_id, BootSlave { state: BootSlaveState::DeviceType, mandatory });
            self.sdo_upload_request(slave_id, 0x1000, 0x00);
        } else {
            self.boot_slaves
                .insert(slave_id, BootSlave { state: BootSlaveState::WaitHeartbeat, mandatory });
            self.enter_heartbeat_wait(slave_id);
        }
    }

    /// Result of an SDO client transaction, fed into the boot pipeline.
    pub(crate) fn on_sdo_client_result(
        &mut self,
        slave_id: u8,
        request: SdoClientRequest,
        outcome: SdoClientOutcome,
    ) {
        let Some(slave) = self.boot_slaves.get(&slave_id) else { return };
        match slave.state.clone() {
            BootSlaveState::DeviceType => match outcome {
                SdoClientOutcome::Ok(data) => {
                    let device_type = u32::from_le_bytes([
                        *data.first().unwrap_or(&0),
                        *data.get(1).unwrap_or(&0),
                        *data.get(2).unwrap_or(&0),
                        *data.get(3).unwrap_or(&0),
                    ]);
                    let expected = self
                        .od
                        .unsigned_value(ODI_DEVICE_TYPE_IDENTIFICATION, slave_id)
                        .unwrap_or(0) as u32;
                    if expected != 0 && expected != device_type {
                        self.fail_boot_slave(slave_id, NmtBootErrorCode::C);
                    } else {
                        self.next_identity_check(slave_id, 1);
                    }
                }
                _ => {
                    // Route B: retry with backoff until the boot window
                    // closes, then give up for mandatory slaves.
                    if self.boot_time_expired {
                        self.fail_boot_slave(slave_id, NmtBootErrorCode::B);
                    } else {
                        self.timers.one_shot(
                            self.now_ms,
                            BOOT_SLAVE_RETRY_MS,
                            TimerEvent::BootSlaveTick(slave_id),
                        );
                    }
                }
            },
            BootSlaveState::Identity { subindex } => match outcome {
                SdoClientOutcome::Ok(data) => {
                    let got = u32::from_le_bytes([
                        *data.first().unwrap_or(&0),
                        *data.get(1).unwrap_or(&0),
                        *data.get(2).unwrap_or(&0),
                        *data.get(3).unwrap_or(&0),
                    ]);
                    let expected = self
                        .od
                        .unsigned_value(ODI_DEVICE_TYPE_IDENTIFICATION + subindex as u16, slave_id)
                        .unwrap_or(0) as u32;
                    if expected != 0 && expected != got {
                        let code = NmtBootErrorCode::from_identity_subindex(subindex)
                            .unwrap_or(NmtBootErrorCode::D);
                        self.fail_boot_slave(slave_id, code);
                    } else {
                        self.next_identity_check(slave_id, subindex + 1);
                    }
                }
                _ => {
                    let code = NmtBootErrorCode::from_identity_subindex(subindex)
                        .unwrap_or(NmtBootErrorCode::D);
                    self.fail_boot_slave(slave_id, code);
                }
            },
            BootSlaveState::ConfigDate => match outcome {
                SdoClientOutcome::Ok(data) => {
                    let date = u32::from_le_bytes([
                        *data.first().unwrap_or(&0),
                        *data.get(1).unwrap_or(&0),
                        *data.get(2).unwrap_or(&0),
                        *data.get(3).unwrap_or(&0),
                    ]);
                    self.set_boot_state(slave_id, BootSlaveState::ConfigTime { date });
                    self.sdo_upload_request(slave_id, 0x1020, 0x02);
                }
                _ => self.request_configuration_update(slave_id),
            },
            BootSlaveState::ConfigTime { date } => {
                let expected_date = self
                    .od
                    .unsigned_value(ODI_EXPECTED_CONFIGURATION_DATE, slave_id)
                    .unwrap_or(0) as u32;
                let expected_time = self
                    .od
                    .unsigned_value(ODI_EXPECTED_CONFIGURATION_TIME, slave_id)
                    .unwrap_or(0) as u32;
                let time = match outcome {
                    SdoClientOutcome::Ok(data) => u32::from_le_bytes([
                        *data.first().unwrap_or(&0),
                        *data.get(1).unwrap_or(&0),
                        *data.get(2).unwrap_or(&0),
                        *data.get(3).unwrap_or(&0),
                    ]),
                    _ => 0,
                };
                if date == expected_date && time == expected_time {
                    self.enter_heartbeat_wait(slave_id);
                } else {
                    self.request_configuration_update(slave_id);
                }
            }
            _ => {
                let _ = request;
            }
        }
    }

    /// Walks 0x1F85..0x1F88; only sub-entries with a non-zero expectation
    /// are checked against the slave's identity object.
    fn next_identity_check(&mut self, slave_id: u8, from_subindex: u8) {
        for subindex in from_subindex..=4 {
            let expected = self
                .od
                .unsigned_value(ODI_DEVICE_TYPE_IDENTIFICATION + subindex as u16, slave_id)
                .unwrap_or(0);
            if expected != 0 {
                self.set_boot_state(slave_id, BootSlaveState::Identity { subindex });
                self.sdo_upload_request(slave_id, 0x1018, subindex);
                return;
            }
        }
        // Route C: configuration version check.
        let expected_date = self
            .od
            .unsigned_value(ODI_EXPECTED_CONFIGURATION_DATE, slave_id)
            .unwrap_or(0);
        let expected_time = self
            .od
            .unsigned_value(ODI_EXPECTED_CONFIGURATION_TIME, slave_id)
            .unwrap_or(0);
        if expected_date != 0 && expected_time != 0 {
            self.set_boot_state(slave_id, BootSlaveState::ConfigDate);
            self.sdo_upload_request(slave_id, 0x1020, 0x01);
        } else {
            self.request_configuration_update(slave_id);
        }
    }

    fn request_configuration_update(&mut self, slave_id: u8) {
        self.hooks.update_configuration(slave_id);
        self.enter_heartbeat_wait(slave_id);
    }

    /// Routes D/E: expect a heartbeat inside the configured consumer window.
    fn enter_heartbeat_wait(&mut self, slave_id: u8) {
        let window = self.heartbeat_consumer_time(slave_id);
        match window {
            Some(window_ms) if window_ms > 0 => {
                if self.heartbeat_seen(slave_id) {
                    self.finish_boot_slave(slave_id);
                } else {
                    self.set_boot_state(slave_id, BootSlaveState::WaitHeartbeat);
                    self.timers
                        .one_shot(self.now_ms, window_ms, TimerEvent::BootSlaveTick(slave_id));
                }
            }
            _ => self.finish_boot_slave(slave_id),
        }
    }

    fn heartbeat_seen(&self, slave_id: u8) -> bool {
        self.heartbeat_consumer_timers
            .get(&slave_id)
            .map(|&handle| self.timers.is_armed(handle))
            .unwrap_or(false)
    }

    pub(crate) fn on_boot_slave_tick(&mut self, slave_id: u8) {
        let Some(slave) = self.boot_slaves.get(&slave_id) else { return };
        match slave.state.clone() {
            BootSlaveState::DeviceType => {
                self.sdo_upload_request(slave_id, 0x1000, 0x00);
            }
            BootSlaveState::WaitHeartbeat => {
                if self.heartbeat_seen(slave_id) {
                    self.finish_boot_slave(slave_id);
                } else {
                    // Route K: the slave never produced a heartbeat.
                    self.fail_boot_slave(slave_id, NmtBootErrorCode::K);
                }
            }
            _ => {}
        }
    }

    fn set_boot_state(&mut self, slave_id: u8, state: BootSlaveState) {
        if let Some(slave) = self.boot_slaves.get_mut(&slave_id) {
            slave.state = state;
        }
    }

    fn finish_boot_slave(&mut self, slave_id: u8) {
        info!("Slave with node-ID {} booted", slave_id);
        self.set_boot_state(slave_id, BootSlaveState::Done);
        let bits = self.startup_bits();
        if !bits.do_not_start_slaves()
            && (!bits.start_all_with_broadcast() || self.state == NmtState::Operational)
        {
            self.send_nmt_node_control(NmtCommand::Start, slave_id);
        }
        self.try_finalize_master_startup();
    }

    fn fail_boot_slave(&mut self, slave_id: u8, code: NmtBootErrorCode) {
        warn!("Boot slave process for node-ID {} failed with status {}", slave_id, code.letter());
        self.set_boot_state(slave_id, BootSlaveState::Failed(code));
        self.report_boot_error(slave_id, code);
        self.try_finalize_master_startup();
    }

    fn report_boot_error(&mut self, slave_id: u8, code: NmtBootErrorCode) {
        self.hooks
            .on_error("nmt_boot_error", &[slave_id as u32, code.letter() as u32]);
    }

    pub(crate) fn on_boot_time_expired(&mut self) {
        self.boot_time_expired = true;
        let pending_mandatory = self.boot_slaves.values().any(|s| {
            s.mandatory && !matches!(s.state, BootSlaveState::Done | BootSlaveState::Failed(_))
        });
        if pending_mandatory {
            warn!("NMT boot time expired before all mandatory slaves booted, halting NMT boot");
            self.hooks.on_error("nmt_boot_timeout", &[]);
        }
    }

    /// Self-start and start-remote-slaves once every mandatory slave is
    /// through its boot pipeline.
    fn try_finalize_master_startup(&mut self) {
        if self.startup_finalized || self.role != MasterRole::ActiveMaster {
            return;
        }
        let all_mandatory_done = self
            .boot_slaves
            .values()
            .filter(|s| s.mandatory)
            .all(|s| matches!(s.state, BootSlaveState::Done | BootSlaveState::Failed(_)));
        if !all_mandatory_done {
            return;
        }
        let failed = self
            .boot_slaves
            .values()
            .any(|s| s.mandatory && matches!(s.state, BootSlaveState::Failed(_)));
        if failed {
            warn!("Mandatory slave failed to boot, master startup halted");
            return;
        }
        self.startup_finalized = true;
        let bits = self.startup_bits();
        if bits.self_starting() {
            info!("Self-starting into OPERATIONAL");
            self.set_nmt_state(NmtState::Operational);
        }
        if !bits.start_only_explicitly() {
            if bits.start_all_with_broadcast() {
                info!("Starting all NMT slaves");
                self.send_nmt_node_control(NmtCommand::Start, message::BROADCAST_NODE_ID);
            } else {
                for (slave_id, _) in self.slave_assignments() {
                    self.send_nmt_node_control(NmtCommand::Start, slave_id);
                }
            }
        }
    }

    // Heartbeat consumer / producer.

    fn heartbeat_consumer_time(&self, producer_id: u8) -> Option<u64> {
        let object = self.od.get(ODI_HEARTBEAT_CONSUMER_TIME)?;
        let len = object.value()?.as_u64()? as u8;
        for subindex in 1..=len {
            let entry = object.get(subindex)?.value().as_u64()?;
            if (entry >> 16) as u8 & 0x7F == producer_id {
                return Some(entry & 0xFFFF);
            }
        }
        None
    }

    pub(crate) fn process_heartbeat(&mut self, interface: ActiveInterface, producer_id: u8, state_code: u8) {
        if producer_id == self.node_id {
            return;
        }
        if interface == ActiveInterface::Default {
            if let Some(eval) = &mut self.hb_eval {
                *eval.counts.entry(producer_id).or_insert(0) += 1;
            }
        }

        let was_consumed = if let Some(&handle) = self.heartbeat_consumer_timers.get(&producer_id) {
            self.timers.cancel(handle);
            true
        } else {
            false
        };
        if !was_consumed
            && self.is_nmt_master_capable()
            && self.active_master_id == Some(producer_id)
        {
            // CiA 302-2 5.5.2: without a consumer entry the master watchdog
            // runs at 1.5x our own producer period.
            self.cancel_timer_slot(|node| &mut node.active_master_timer);
            let producer = self
                .od
                .unsigned_value(ODI_HEARTBEAT_PRODUCER_TIME, 0)
                .unwrap_or(0);
            if producer > 0 {
                self.first_boot = true;
                let handle = self.timers.one_shot(
                    self.now_ms,
                    producer * 3 / 2,
                    TimerEvent::ActiveMasterDetectTimeout,
                );
                self.active_master_timer = Some(handle);
            }
        }

        if let Some(window_ms) = self.heartbeat_consumer_time(producer_id) {
            if window_ms > 0 {
                let handle = self.timers.one_shot(
                    self.now_ms,
                    window_ms,
                    TimerEvent::HeartbeatConsumerTimeout(producer_id),
                );
                self.heartbeat_consumer_timers.insert(producer_id, handle);
                if self.is_nmt_master_capable() && self.active_master_id == Some(producer_id) {
                    self.cancel_timer_slot(|node| &mut node.active_master_timer);
                    let watchdog = self.timers.one_shot(
                        self.now_ms,
                        window_ms,
                        TimerEvent::ActiveMasterDetectTimeout,
                    );
                    self.active_master_timer = Some(watchdog);
                }
            }
        }

        // 0x1F82 mirrors the last observed NMT state per node.
        if self.od.contains(ODI_REQUEST_NMT) {
            let _ = self
                .od
                .set_value(ODI_REQUEST_NMT, producer_id, Value::Unsigned8(state_code));
        }

        if state_code == 0 {
            self.on_slave_bootup(producer_id);
        }
    }

    /// A boot-up frame from another node.
    fn on_slave_bootup(&mut self, producer_id: u8) {
        let assignment = self.slave_assignment(producer_id);
        let in_network = assignment & 0x01 != 0;
        self.hooks.on_node_bootup(producer_id, in_network);
        if self.is_active_nmt_master() {
            let priority = self.flying_master_timing(ODSI_FLYING_MASTER_PRIORITY) as u8;
            let (cob, data) = message::master_node_id(priority, self.node_id);
            self.send_nmt_frame(cob, &data);
            if in_network {
                let mandatory = assignment & 0x09 == 0x09;
                self.start_boot_slave(producer_id, mandatory);
            }
        }
    }

    pub(crate) fn on_heartbeat_consumer_timeout(&mut self, producer_id: u8) {
        info!("Heartbeat from node-ID {} missing", producer_id);
        self.heartbeat_consumer_timers.remove(&producer_id);
        self.emcy(EMCY_HEARTBEAT_BY_NODE + producer_id as u16, [0; 5]);
        if self.od.contains(ODI_REQUEST_NMT) {
            // 0x01 marks the device as missing.
            let _ = self
                .od
                .set_value(ODI_REQUEST_NMT, producer_id, Value::Unsigned8(0x01));
        }
    }

    // NMT inhibit time (0x102A, multiples of 100 us).

    pub(crate) fn send_nmt_node_control(&mut self, command: NmtCommand, target: u8) {
        let (cob, data) = message::node_control(command, target);
        self.send_nmt_frame(cob, &data);
    }

    pub(crate) fn send_nmt_frame(&mut self, cob_id: u16, data: &[u8]) {
        let inhibit_ms = self.od.unsigned_value(ODI_NMT_INHIBIT_TIME, 0).unwrap_or(0) / 10;
        if inhibit_ms > 0 {
            if let Some(last) = self.last_nmt_ms {
                let allowed_at = last + inhibit_ms;
                if self.now_ms < allowed_at {
                    info!("NMT inhibit window active, delaying message");
                    self.deferred_nmt.push((cob_id, data.to_vec()));
                    self.timers
                        .one_shot(self.now_ms, allowed_at - self.now_ms, TimerEvent::NmtInhibitElapsed);
                    return;
                }
            }
        }
        match crate::util::create_frame::<CAN::Frame>(cob_id, data) {
            Ok(frame) => {
                self.transmit(&frame);
                self.last_nmt_ms = Some(self.now_ms);
            }
            Err(ec) => {
                warn!("Errors in creating NMT frame: {:?}", ec);
            }
        }
    }

    pub(crate) fn on_nmt_inhibit_elapsed(&mut self) {
        if !self.deferred_nmt.is_empty() {
            let (cob_id, data) = self.deferred_nmt.remove(0);
            self.send_nmt_frame(cob_id, &data);
        }
    }

    // Dual-bus redundancy (OD 0x1F60).

    pub(crate) fn arm_redundancy_evaluation(&mut self, kind: HbEvalKind) {
        if !self.has_redundant_bus() {
            return;
        }
        let subindex = match kind {
            HbEvalKind::PowerOn => ODSI_REDUNDANCY_HB_EVAL_POWER_ON,
            HbEvalKind::ResetComm => ODSI_REDUNDANCY_HB_EVAL_RESET_COMM,
        };
        let window = self
            .od
            .unsigned_value(ODI_REDUNDANCY_CONFIGURATION, subindex)
            .unwrap_or(0);
        if window == 0 {
            return;
        }
        self.hb_eval = Some(HbEvaluation { kind, counts: HashMap::new() });
        self.cancel_timer_slot(|node| &mut node.redundancy_timer);
        let handle = self
            .timers
            .one_shot(self.now_ms, window, TimerEvent::RedundancyEvaluation);
        self.redundancy_timer = Some(handle);
    }

    /// Evaluation window closed: judge the default bus by the heartbeat
    /// census. Power-on wants a live bus (max count >= 3); after a reset
    /// every watched producer must have been heard at least once.
    pub(crate) fn on_redundancy_evaluation(&mut self) {
        self.redundancy_timer = None;
        let Some(eval) = self.hb_eval.take() else { return };
        let unhealthy = match eval.kind {
            HbEvalKind::PowerOn => eval.counts.values().copied().max().unwrap_or(0) < 3,
            HbEvalKind::ResetComm => {
                let watched = self.watched_producers();
                !watched.is_empty()
                    && watched
                        .iter()
                        .map(|id| eval.counts.get(id).copied().unwrap_or(0))
                        .min()
                        .unwrap_or(0)
                        == 0
            }
        };
        if unhealthy {
            warn!("Default CAN interface judged unhealthy by heartbeat evaluation");
            self.switch_to_redundant_bus();
        }
    }

    fn watched_producers(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(object) = self.od.get(ODI_HEARTBEAT_CONSUMER_TIME) {
            let len = object.value().and_then(|v| v.as_u64()).unwrap_or(0) as u8;
            for subindex in 1..=len {
                if let Some(entry) = object.get(subindex).and_then(|s| s.value().as_u64()) {
                    if entry & 0xFFFF > 0 {
                        out.push((entry >> 16) as u8 & 0x7F);
                    }
                }
            }
        }
        out
    }

    /// Bookkeeping for every transmission attempt on the default bus:
    /// +4 per failure, -1 per success, threshold crossing forces the
    /// switchover.
    pub(crate) fn note_default_bus_tx(&mut self, ok: bool) {
        if !self.has_redundant_bus() || !self.od.contains(ODI_REDUNDANCY_CONFIGURATION) {
            return;
        }
        let count = self
            .od
            .unsigned_value(ODI_REDUNDANCY_CONFIGURATION, ODSI_REDUNDANCY_ERROR_COUNT)
            .unwrap_or(0);
        let new_count = if ok { count.saturating_sub(1) } else { count + 4 };
        let _ = self.od.set_value(
            ODI_REDUNDANCY_CONFIGURATION,
            ODSI_REDUNDANCY_ERROR_COUNT,
            Value::Unsigned8(new_count.min(0xFF) as u8),
        );
        let threshold = self
            .od
            .unsigned_value(ODI_REDUNDANCY_CONFIGURATION, ODSI_REDUNDANCY_ERROR_THRESHOLD)
            .unwrap_or(0);
        if threshold > 0 && new_count >= threshold {
            warn!("Default CAN interface error counter crossed threshold");
            self.heartbeat_on_default_disabled = true;
            self.switch_to_redundant_bus();
        }
    }

    pub(crate) fn switch_to_redundant_bus(&mut self) {
        if self.active_interface == ActiveInterface::Redundant || !self.has_redundant_bus() {
            return;
        }
        warn!("Switching active CAN interface to the redundant bus");
        self.active_interface = ActiveInterface::Redundant;
        let (cob, data) = message::active_interface_indication(1, self.node_id);
        self.send_nmt_frame(cob, &data);
        self.hooks.on_error("bus_switchover", &[1]);
    }
}
