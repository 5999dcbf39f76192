//! Shared test plumbing: an in-memory CAN bus with inspectable traffic and
//! a baseline object dictionary.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use canopen::data_type::DataType;
use canopen::object_dictionary::{AccessType, Object, ObjectDictionary, SubObject};
use canopen::value::Value;
use embedded_can::{Frame, Id, StandardId};

#[derive(Clone, Debug, PartialEq)]
pub struct MockFrame {
    id: Id,
    data: Vec<u8>,
    remote: bool,
    dlc: usize,
}

impl Frame for MockFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        Some(MockFrame { id: id.into(), data: data.to_vec(), remote: false, dlc: data.len() })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        Some(MockFrame { id: id.into(), data: Vec::new(), remote: true, dlc })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
pub struct MockError;

impl embedded_can::Error for MockError {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

#[derive(Default)]
struct BusInner {
    rx: VecDeque<MockFrame>,
    tx: Vec<MockFrame>,
    fail_tx: bool,
}

/// One end of an in-memory CAN bus. Frames transmitted here land in the
/// `tx` log and in the receive queue of every linked peer.
pub struct MockBus {
    inner: Rc<RefCell<BusInner>>,
    peers: Vec<Rc<RefCell<BusInner>>>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus { inner: Rc::new(RefCell::new(BusInner::default())), peers: Vec::new() }
    }

    /// Cross-wires two bus ends so each sees the other's transmissions.
    pub fn link(a: &mut MockBus, b: &mut MockBus) {
        a.peers.push(Rc::clone(&b.inner));
        b.peers.push(Rc::clone(&a.inner));
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle(Rc::clone(&self.inner))
    }
}

/// Inspection/injection handle that stays usable after the node takes the
/// bus by value.
#[derive(Clone)]
pub struct BusHandle(Rc<RefCell<BusInner>>);

impl BusHandle {
    pub fn push_rx(&self, cob_id: u16, data: &[u8]) {
        let frame = MockFrame::new(StandardId::new(cob_id).unwrap(), data).unwrap();
        self.0.borrow_mut().rx.push_back(frame);
    }

    pub fn push_remote(&self, cob_id: u16, dlc: usize) {
        let frame = MockFrame::new_remote(StandardId::new(cob_id).unwrap(), dlc).unwrap();
        self.0.borrow_mut().rx.push_back(frame);
    }

    /// Drains and returns everything transmitted so far as `(cob, data)`.
    pub fn take_sent(&self) -> Vec<(u16, Vec<u8>)> {
        self.0
            .borrow_mut()
            .tx
            .drain(..)
            .map(|f| (raw_cob(&f), f.data().to_vec()))
            .collect()
    }

    pub fn set_fail_tx(&self, fail: bool) {
        self.0.borrow_mut().fail_tx = fail;
    }
}

pub fn raw_cob(frame: &MockFrame) -> u16 {
    match frame.id() {
        Id::Standard(sid) => sid.as_raw(),
        Id::Extended(eid) => eid.as_raw() as u16,
    }
}

impl embedded_can::nb::Can for MockBus {
    type Frame = MockFrame;
    type Error = MockError;

    fn transmit(&mut self, frame: &Self::Frame) -> nb::Result<Option<Self::Frame>, Self::Error> {
        if self.inner.borrow().fail_tx {
            return Err(nb::Error::Other(MockError));
        }
        self.inner.borrow_mut().tx.push(frame.clone());
        for peer in &self.peers {
            peer.borrow_mut().rx.push_back(frame.clone());
        }
        Ok(None)
    }

    fn receive(&mut self) -> nb::Result<Self::Frame, Self::Error> {
        self.inner
            .borrow_mut()
            .rx
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

fn u32_var(name: &str, access: AccessType, value: u32) -> Object {
    Object::new_var(name, DataType::Unsigned32, access, Value::Unsigned32(value))
}

/// Communication-profile baseline used by most tests: device type, error
/// register, error history, SYNC/EMCY COB-IDs, heartbeat objects, SDO
/// server parameters and the request-NMT array.
pub fn base_od(node_id: u8) -> ObjectDictionary {
    let mut od = ObjectDictionary::new(node_id);
    od.insert(0x1000, u32_var("Device type", AccessType::Ro, 0x000F_0191));
    od.insert(
        0x1001,
        Object::new_var("Error register", DataType::Unsigned8, AccessType::Ro, Value::Unsigned8(0)),
    );
    od.insert(
        0x1003,
        Object::new_array("Pre-defined error field", DataType::Unsigned32).with_sub(
            0,
            SubObject::new("Number of errors", DataType::Unsigned8, AccessType::Rw, Value::Unsigned8(0)),
        ),
    );
    od.insert(0x1005, u32_var("COB-ID SYNC", AccessType::Rw, 0x0000_0080));
    od.insert(0x1006, u32_var("Communication cycle period", AccessType::Rw, 0));
    od.insert(0x1014, u32_var("COB-ID EMCY", AccessType::Ro, 0x80 + node_id as u32));
    od.insert(
        0x1015,
        Object::new_var("Inhibit time EMCY", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(0)),
    );
    od.insert(
        0x1016,
        Object::new_array("Consumer heartbeat time", DataType::Unsigned32).with_sub(
            1,
            SubObject::new("Consumer heartbeat time", DataType::Unsigned32, AccessType::Rw, Value::Unsigned32(0)),
        ),
    );
    od.insert(
        0x1017,
        Object::new_var("Producer heartbeat time", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(0)),
    );
    od.insert(
        0x1008,
        Object::new_var(
            "Manufacturer device name",
            DataType::VisibleString,
            AccessType::Const,
            Value::VisibleString("CANopenNode".to_string()),
        ),
    );
    od.insert(
        0x1200,
        Object::new_record("Server SDO parameter", DataType::Unknown)
            .with_sub(
                1,
                SubObject::new("COB-ID Client->Server (rx)", DataType::Unsigned32, AccessType::Ro,
                    Value::Unsigned32(0x600 + node_id as u32)),
            )
            .with_sub(
                2,
                SubObject::new("COB-ID Server->Client (tx)", DataType::Unsigned32, AccessType::Ro,
                    Value::Unsigned32(0x580 + node_id as u32)),
            ),
    );
    let mut request_nmt = Object::new_array("Request NMT", DataType::Unsigned8);
    for sub in 1..=8u8 {
        request_nmt.insert(
            sub,
            SubObject::new("Request NMT", DataType::Unsigned8, AccessType::Rw, Value::Unsigned8(0)),
        );
    }
    od.insert(0x1F82, request_nmt);
    od
}

pub fn mapping_entry(index: u16, subindex: u8, bits: u8) -> u32 {
    ((index as u32) << 16) | ((subindex as u32) << 8) | bits as u32
}

/// Adds a TPDO1 configuration with the given transmission type and mapping.
pub fn add_tpdo1(od: &mut ObjectDictionary, node_id: u8, transmission_type: u8, mappings: &[(u16, u8, u8)]) {
    od.insert(
        0x1800,
        Object::new_record("TPDO1 communication parameter", DataType::Unknown)
            .with_sub(
                1,
                SubObject::new("COB-ID used by PDO", DataType::Unsigned32, AccessType::Rw,
                    Value::Unsigned32(0x180 + node_id as u32)),
            )
            .with_sub(
                2,
                SubObject::new("Transmission type", DataType::Unsigned8, AccessType::Rw,
                    Value::Unsigned8(transmission_type)),
            )
            .with_sub(
                3,
                SubObject::new("Inhibit time", DataType::Unsigned16, AccessType::Rw, Value::Unsigned16(0)),
            ),
    );
    let mut mapping = Object::new_record("TPDO1 mapping parameter", DataType::Unknown);
    for (i, &(index, subindex, bits)) in mappings.iter().enumerate() {
        mapping.insert(
            i as u8 + 1,
            SubObject::new("Mapped object", DataType::Unsigned32, AccessType::Rw,
                Value::Unsigned32(mapping_entry(index, subindex, bits))),
        );
    }
    od.insert(0x1A00, mapping);
}

/// Adds an RPDO1 configuration mirroring `add_tpdo1`.
pub fn add_rpdo1(od: &mut ObjectDictionary, node_id: u8, mappings: &[(u16, u8, u8)]) {
    od.insert(
        0x1400,
        Object::new_record("RPDO1 communication parameter", DataType::Unknown)
            .with_sub(
                1,
                SubObject::new("COB-ID used by PDO", DataType::Unsigned32, AccessType::Rw,
                    Value::Unsigned32(0x200 + node_id as u32)),
            )
            .with_sub(
                2,
                SubObject::new("Transmission type", DataType::Unsigned8, AccessType::Rw, Value::Unsigned8(0xFF)),
            ),
    );
    let mut mapping = Object::new_record("RPDO1 mapping parameter", DataType::Unknown);
    for (i, &(index, subindex, bits)) in mappings.iter().enumerate() {
        mapping.insert(
            i as u8 + 1,
            SubObject::new("Mapped object", DataType::Unsigned32, AccessType::Rw,
                Value::Unsigned32(mapping_entry(index, subindex, bits))),
        );
    }
    od.insert(0x1600, mapping);
}

/// Picks the frames with a given COB-ID out of a transmission log.
pub fn frames_with_cob(sent: &[(u16, Vec<u8>)], cob_id: u16) -> Vec<Vec<u8>> {
    sent.iter()
        .filter(|(cob, _)| *cob == cob_id)
        .map(|(_, data)| data.clone())
        .collect()
}
