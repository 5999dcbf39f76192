//! The node: owns the object dictionary, both CAN interfaces, the timer
//! scheduler and every protocol engine. A single `poll` drives due timers
//! and drains both buses, so all object dictionary access is serialized on
//! one lane.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::error::ErrorCode;
use crate::message::{self, Message, FUNCTION_CODE_BITNUM, FUNCTION_CODE_NMT_ERROR_CONTROL};
use crate::nmt::{BootSlave, HbEvalKind, HbEvaluation, MasterRole};
use crate::object_dictionary::{
    ObjectDictionary, ODI_HEARTBEAT_PRODUCER_TIME, ODI_SYNC_COB_ID, ODI_SYNC_OVERFLOW,
    ODI_SYNC_PERIOD,
};
use crate::pdo::{PdoConfig, TpdoRuntime};
use crate::prelude::*;
use crate::sdo_client::SdoClientRequest;
use crate::sdo_server::SdoState;
use crate::timers::{TimerEvent, TimerHandle, TimerScheduler};
use crate::{error, info};

/// NMT device state (CiA 301 state machine).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum NmtState {
    Initialising,
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    /// State byte carried in heartbeat frames; boot-up uses 0.
    pub fn heartbeat_code(&self) -> u8 {
        match *self {
            NmtState::Initialising => 0,
            NmtState::PreOperational => 127,
            NmtState::Operational => 5,
            NmtState::Stopped => 4,
        }
    }
}

/// Which CAN interface carries traffic right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveInterface {
    Default,
    Redundant,
}

/// Network time reference: `(days, millis)` as observed at `local_ms`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeBase {
    pub local_ms: u64,
    pub days: u16,
    pub millis: u32,
}

/// Application callbacks. Every method has a no-op default, so embedders
/// implement only what they care about.
pub trait NodeHooks {
    fn on_active_nmt_master_won(&mut self) {}
    fn on_active_nmt_master_lost(&mut self) {}
    fn on_node_bootup(&mut self, _node_id: u8, _in_network: bool) {}
    fn on_emcy(&mut self, _can_id: u16, _eec: u16, _error_register: u8, _msef: [u8; 5]) {}
    fn on_sdo_download(&mut self, _index: u16, _subindex: u8) {}
    fn on_sync(&mut self) {}
    fn on_message(&mut self, _cob_id: u16, _data: &[u8]) {}
    fn on_error(&mut self, _tag: &str, _args: &[u32]) {}
    fn update_configuration(&mut self, _slave_id: u8) {}
}

/// The default hook set: ignore everything.
pub struct DefaultHooks;

impl NodeHooks for DefaultHooks {}

pub struct Node<CAN>
where
    CAN: Can,
    CAN::Frame: Frame + Debug,
{
    pub(crate) node_id: u8,
    pub(crate) default_bus: CAN,
    pub(crate) redundant_bus: Option<CAN>,
    pub(crate) active_interface: ActiveInterface,
    pub(crate) od: ObjectDictionary,
    pub(crate) default_od: ObjectDictionary,
    pub(crate) hooks: Box<dyn NodeHooks>,
    pub(crate) timers: TimerScheduler,
    pub(crate) now_ms: u64,

    pub(crate) state: NmtState,
    pub(crate) role: MasterRole,
    pub(crate) first_boot: bool,
    pub(crate) active_master_id: Option<u8>,

    // Timer handles, one slot per timer class.
    pub(crate) heartbeat_producer_timer: Option<TimerHandle>,
    pub(crate) sync_producer_timer: Option<TimerHandle>,
    pub(crate) heartbeat_consumer_timers: HashMap<u8, TimerHandle>,
    pub(crate) active_master_timer: Option<TimerHandle>,
    pub(crate) flying_master_delay_timer: Option<TimerHandle>,
    pub(crate) flying_master_negotiation_timer: Option<TimerHandle>,
    pub(crate) multiple_master_timer: Option<TimerHandle>,
    pub(crate) boot_timer: Option<TimerHandle>,
    pub(crate) redundancy_timer: Option<TimerHandle>,

    // SDO server and client.
    pub(crate) sdo_session: SdoState,
    pub(crate) sdo_session_timer: Option<TimerHandle>,
    pub(crate) sdo_requests: HashMap<u8, SdoClientRequest>,

    // NMT master bookkeeping.
    pub(crate) boot_slaves: HashMap<u8, BootSlave>,
    pub(crate) boot_time_expired: bool,
    pub(crate) startup_finalized: bool,

    // PDO engine.
    pub(crate) tpdo_configs: [PdoConfig; 4],
    pub(crate) rpdo_configs: [PdoConfig; 4],
    pub(crate) tpdo_runtime: [TpdoRuntime; 4],
    pub(crate) sync_counter: u8,
    pub(crate) sync_produce_counter: u8,

    // EMCY queues.
    pub(crate) pending_emcy: Vec<(u16, [u8; 5])>,
    pub(crate) deferred_emcy: Vec<(u16, [u8; 5])>,
    pub(crate) last_emcy_ms: Option<u64>,

    // NMT inhibit queue.
    pub(crate) deferred_nmt: Vec<(u16, Vec<u8>)>,
    pub(crate) last_nmt_ms: Option<u64>,

    // TIME service.
    pub(crate) time_base: Option<TimeBase>,

    // Redundancy.
    pub(crate) hb_eval: Option<HbEvaluation>,
    pub(crate) heartbeat_on_default_disabled: bool,
    power_on_eval_done: bool,
}

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    pub fn new(bus: CAN, node_id: u8, od: ObjectDictionary) -> Result<Self, ErrorCode> {
        if node_id == 0 || node_id > 0x7F {
            return Err(ErrorCode::InvalidNodeId { node_id });
        }
        Ok(Node {
            node_id,
            default_bus: bus,
            redundant_bus: None,
            active_interface: ActiveInterface::Default,
            default_od: od.clone(),
            od,
            hooks: Box::new(DefaultHooks),
            timers: TimerScheduler::new(),
            now_ms: 0,
            state: NmtState::Initialising,
            role: MasterRole::Slave,
            first_boot: true,
            active_master_id: None,
            heartbeat_producer_timer: None,
            sync_producer_timer: None,
            heartbeat_consumer_timers: HashMap::new(),
            active_master_timer: None,
            flying_master_delay_timer: None,
            flying_master_negotiation_timer: None,
            multiple_master_timer: None,
            boot_timer: None,
            redundancy_timer: None,
            sdo_session: SdoState::Idle,
            sdo_session_timer: None,
            sdo_requests: HashMap::new(),
            boot_slaves: HashMap::new(),
            boot_time_expired: false,
            startup_finalized: false,
            tpdo_configs: Default::default(),
            rpdo_configs: Default::default(),
            tpdo_runtime: Default::default(),
            sync_counter: 0,
            sync_produce_counter: 0,
            pending_emcy: Vec::new(),
            deferred_emcy: Vec::new(),
            last_emcy_ms: None,
            deferred_nmt: Vec::new(),
            last_nmt_ms: None,
            time_base: None,
            hb_eval: None,
            heartbeat_on_default_disabled: false,
            power_on_eval_done: false,
        })
    }

    /// Attaches the redundant CAN interface (CiA 302-6 style dual bus).
    pub fn with_redundant_bus(mut self, bus: CAN) -> Self {
        self.redundant_bus = Some(bus);
        self
    }

    pub fn with_hooks(mut self, hooks: Box<dyn NodeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.state
    }

    pub fn active_interface(&self) -> ActiveInterface {
        self.active_interface
    }

    /// Node-ID of the NMT master this node last observed (itself included).
    pub fn active_nmt_master_id(&self) -> Option<u8> {
        self.active_master_id
    }

    pub fn od(&self) -> &ObjectDictionary {
        &self.od
    }

    pub fn od_mut(&mut self) -> &mut ObjectDictionary {
        &mut self.od
    }

    pub(crate) fn is_operational(&self) -> bool {
        self.state == NmtState::Operational
    }

    pub(crate) fn has_redundant_bus(&self) -> bool {
        self.redundant_bus.is_some()
    }

    /// Boots the node: reset, boot-up frame, NMT startup. Call once before
    /// polling.
    pub fn start(&mut self) {
        self.reset();
    }

    /// Full device reset: the whole object dictionary returns to its
    /// defaults.
    pub fn reset(&mut self) {
        info!("Device reset");
        self.od = self.default_od.clone();
        self.reset_communication();
    }

    /// Communication reset: restore 0x1000..=0x1FFF, drop every timer and
    /// session, boot again.
    pub fn reset_communication(&mut self) {
        info!("Device reset communication");
        self.timers.cancel_all();
        self.heartbeat_producer_timer = None;
        self.sync_producer_timer = None;
        self.heartbeat_consumer_timers.clear();
        self.active_master_timer = None;
        self.flying_master_delay_timer = None;
        self.flying_master_negotiation_timer = None;
        self.multiple_master_timer = None;
        self.boot_timer = None;
        self.redundancy_timer = None;
        self.sdo_session = SdoState::Idle;
        self.sdo_session_timer = None;
        self.sdo_requests.clear();
        self.boot_slaves.clear();
        self.boot_time_expired = false;
        self.startup_finalized = false;
        self.role = MasterRole::Slave;
        self.sync_counter = 0;
        self.sync_produce_counter = 0;
        self.tpdo_runtime = Default::default();
        self.pending_emcy.clear();
        self.deferred_emcy.clear();
        self.deferred_nmt.clear();
        self.hb_eval = None;

        self.od.reset_range(&self.default_od, 0x1000..=0x1FFF);
        self.boot();
    }

    fn boot(&mut self) {
        info!("Booting with node-ID {}", self.node_id);
        let (cob, data) = message::bootup(self.node_id);
        match crate::util::create_frame::<CAN::Frame>(cob, &data) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating boot-up frame: {:?}", ec);
            }
        }
        self.set_nmt_state(NmtState::PreOperational);
        self.refresh_pdo_configuration();
        self.process_timers();
        let kind = if self.power_on_eval_done {
            HbEvalKind::ResetComm
        } else {
            self.power_on_eval_done = true;
            HbEvalKind::PowerOn
        };
        self.arm_redundancy_evaluation(kind);
        self.nmt_startup();
    }

    pub(crate) fn set_nmt_state(&mut self, state: NmtState) {
        self.state = state;
        if state != NmtState::Stopped {
            self.flush_pending_emcy();
        }
    }

    /// Advances the node to `now_ms`: fires due timers, then drains both
    /// buses frame by frame.
    pub fn poll(&mut self, now_ms: u64) {
        if now_ms > self.now_ms {
            self.now_ms = now_ms;
        }
        let events = self.timers.poll(self.now_ms);
        for event in events {
            self.dispatch_timer_event(event);
        }
        self.drain_default_bus();
        self.drain_redundant_bus();
    }

    fn drain_default_bus(&mut self) {
        loop {
            let frame = match self.default_bus.receive() {
                Ok(frame) => frame,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => {
                    info!("Errors in reading CAN frame: {:?}", err);
                    break;
                }
            };
            self.process_can_frame(ActiveInterface::Default, &frame);
        }
    }

    fn drain_redundant_bus(&mut self) {
        loop {
            let frame = match self.redundant_bus.as_mut() {
                None => break,
                Some(bus) => match bus.receive() {
                    Ok(frame) => frame,
                    Err(nb::Error::WouldBlock) => break,
                    Err(nb::Error::Other(err)) => {
                        info!("Errors in reading CAN frame: {:?}", err);
                        break;
                    }
                },
            };
            self.process_can_frame(ActiveInterface::Redundant, &frame);
        }
    }

    fn dispatch_timer_event(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::HeartbeatProduce => self.produce_heartbeat(),
            TimerEvent::SyncProduce => self.produce_sync(),
            TimerEvent::HeartbeatConsumerTimeout(id) => self.on_heartbeat_consumer_timeout(id),
            TimerEvent::EmcyInhibitElapsed => self.on_emcy_inhibit_elapsed(),
            TimerEvent::NmtInhibitElapsed => self.on_nmt_inhibit_elapsed(),
            TimerEvent::FlyingMasterDelayElapsed => self.on_flying_master_delay_elapsed(),
            TimerEvent::ActiveMasterDetectTimeout => self.on_active_master_timeout(),
            TimerEvent::FlyingMasterNegotiationTimeout => {
                self.on_flying_master_negotiation_timeout()
            }
            TimerEvent::MultipleMasterDetect => self.on_multiple_master_detect(),
            TimerEvent::BootSlaveTick(id) => self.on_boot_slave_tick(id),
            TimerEvent::BootTimeExpired => self.on_boot_time_expired(),
            TimerEvent::SdoClientTimeout(id) => self.on_sdo_client_timeout(id),
            TimerEvent::SdoServerTimeout => self.on_sdo_session_timeout(),
            TimerEvent::TpdoInhibitElapsed(i) => self.on_tpdo_inhibit_elapsed(i as usize),
            TimerEvent::RedundancyEvaluation => self.on_redundancy_evaluation(),
        }
    }

    fn configured_sync_cob(&self) -> u16 {
        self.od
            .unsigned_value(ODI_SYNC_COB_ID, 0)
            .map(|v| (v & 0x1FFF_FFFF) as u16 & 0x7FF)
            .unwrap_or(0x080)
    }

    fn process_can_frame(&mut self, interface: ActiveInterface, frame: &CAN::Frame) {
        let Some(cob_id) = crate::util::get_cob_id(frame) else { return };
        let data = frame.data();
        self.hooks.on_message(cob_id, data);

        if frame.is_remote_frame() {
            let fc = cob_id >> FUNCTION_CODE_BITNUM;
            let target = (cob_id & 0x7F) as u8;
            if fc == FUNCTION_CODE_NMT_ERROR_CONTROL
                && (target == self.node_id || target == message::BROADCAST_NODE_ID)
            {
                self.produce_heartbeat();
            } else {
                self.process_tpdo_rtr(cob_id);
            }
            return;
        }

        // COB-IDs configured in the dictionary take precedence over the
        // pre-defined connection set.
        if cob_id == self.configured_sync_cob() {
            self.process_sync_frame(data.first().copied());
            return;
        }
        if cob_id == self.sdo_server_rx_cob() && data.len() == 8 {
            if self.state != NmtState::Stopped {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(data);
                self.process_sdo_request(bytes);
            }
            return;
        }

        match Message::parse(cob_id, data, false) {
            Message::NmtNodeControl { command, target } => {
                self.process_nmt_node_control(command, target)
            }
            Message::NmtMasterNodeId { priority, node_id } => {
                self.handle_master_node_id(priority, node_id)
            }
            Message::NmtFlyingMasterRequest => self.handle_flying_master_request(),
            Message::NmtActiveMasterRequest => self.handle_active_master_request(),
            Message::NmtMasterRequest => self.handle_master_request(),
            Message::NmtForceFlyingMaster => self.handle_force_flying_master(),
            Message::NmtActiveInterfaceIndication { interface: active, .. } => {
                if active == 1 {
                    self.switch_to_redundant_bus();
                }
            }
            Message::Heartbeat { node_id, state } => {
                self.process_heartbeat(interface, node_id, state)
            }
            Message::Emcy { eec, error_register, msef, .. } => {
                self.hooks.on_emcy(cob_id, eec, error_register, msef);
            }
            Message::Time { millis, days } => {
                if self.state != NmtState::Stopped {
                    self.process_time_frame(cob_id, millis, days);
                }
            }
            Message::Pdo { cob_id, data } => {
                if self.is_operational() {
                    self.process_rpdo(cob_id, &data);
                }
            }
            Message::SdoResponse { node_id, data } => {
                if self.state != NmtState::Stopped {
                    self.process_sdo_client_response(node_id, data);
                }
            }
            Message::NmtGlobalFailsafe
            | Message::NmtMasterResponse
            | Message::Sync { .. }
            | Message::SdoRequest { .. }
            | Message::Remote { .. }
            | Message::Unknown { .. } => {}
        }
    }

    fn process_sync_frame(&mut self, _counter: Option<u8>) {
        if self.is_operational() {
            self.dispatch_synchronous_tpdos();
            self.hooks.on_sync();
        }
    }

    /// Transmits on the active interface; default-bus outcomes feed the
    /// redundancy error counter.
    pub(crate) fn transmit(&mut self, frame: &CAN::Frame) {
        match self.active_interface {
            ActiveInterface::Default => {
                let ok = match self.default_bus.transmit(frame) {
                    Ok(_) => {
                        info!("Sent frame {:x?}", frame);
                        true
                    }
                    Err(err) => {
                        error!("Errors in transmit frame {:x?}, err: {:?}", frame, err);
                        false
                    }
                };
                self.note_default_bus_tx(ok);
            }
            ActiveInterface::Redundant => {
                if let Some(bus) = self.redundant_bus.as_mut() {
                    match bus.transmit(frame) {
                        Ok(_) => {
                            info!("Sent frame {:x?}", frame);
                        }
                        Err(err) => {
                            error!("Errors in transmit frame {:x?}, err: {:?}", frame, err);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn cancel_timer_slot<F>(&mut self, slot: F) -> bool
    where
        F: FnOnce(&mut Self) -> &mut Option<TimerHandle>,
    {
        let handle = slot(self).take();
        match handle {
            Some(handle) => self.timers.cancel(handle),
            None => false,
        }
    }

    // Heartbeat and SYNC production.

    pub(crate) fn process_timers(&mut self) {
        self.refresh_heartbeat_producer();
        self.refresh_sync_producer();
    }

    pub(crate) fn refresh_heartbeat_producer(&mut self) {
        self.cancel_timer_slot(|node| &mut node.heartbeat_producer_timer);
        let period = self
            .od
            .unsigned_value(ODI_HEARTBEAT_PRODUCER_TIME, 0)
            .unwrap_or(0);
        if period > 0 {
            let handle = self
                .timers
                .interval(self.now_ms, period, TimerEvent::HeartbeatProduce);
            self.heartbeat_producer_timer = Some(handle);
        }
    }

    fn produce_heartbeat(&mut self) {
        if self.active_interface == ActiveInterface::Default && self.heartbeat_on_default_disabled {
            return;
        }
        let (cob, data) = message::heartbeat(self.node_id, self.state.heartbeat_code());
        match crate::util::create_frame::<CAN::Frame>(cob, &data) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating heartbeat frame: {:?}", ec);
            }
        }
    }

    pub(crate) fn refresh_sync_producer(&mut self) {
        self.cancel_timer_slot(|node| &mut node.sync_producer_timer);
        let cob = self.od.unsigned_value(ODI_SYNC_COB_ID, 0).unwrap_or(0);
        let is_producer = cob & 0x4000_0000 != 0;
        let period_ms = self.od.unsigned_value(ODI_SYNC_PERIOD, 0).unwrap_or(0) / 1000;
        if is_producer && period_ms > 0 {
            let handle = self
                .timers
                .interval(self.now_ms, period_ms, TimerEvent::SyncProduce);
            self.sync_producer_timer = Some(handle);
        }
    }

    fn produce_sync(&mut self) {
        if self.state == NmtState::Stopped {
            return;
        }
        let cob = self.configured_sync_cob();
        let overflow = self.od.unsigned_value(ODI_SYNC_OVERFLOW, 0).unwrap_or(0);
        let counter = if (2..=240).contains(&overflow) {
            self.sync_produce_counter = self.sync_produce_counter % overflow as u8 + 1;
            Some(self.sync_produce_counter)
        } else {
            None
        };
        let (cob_id, data) = message::sync(cob, counter);
        match crate::util::create_frame::<CAN::Frame>(cob_id, &data) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating SYNC frame: {:?}", ec);
            }
        }
    }

    /// Reacts to a committed SDO download: services whose parameters live in
    /// the written entry pick up the change immediately.
    pub(crate) fn on_od_written(&mut self, index: u16, subindex: u8) {
        match index {
            ODI_HEARTBEAT_PRODUCER_TIME => self.refresh_heartbeat_producer(),
            ODI_SYNC_COB_ID | ODI_SYNC_PERIOD | ODI_SYNC_OVERFLOW => self.refresh_sync_producer(),
            0x1400..=0x1BFF => self.refresh_pdo_configuration(),
            _ => {}
        }
        self.hooks.on_sdo_download(index, subindex);
    }
}
