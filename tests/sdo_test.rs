//! SDO server behavior against the wire: expedited, segmented and block
//! transfers plus the abort taxonomy.

mod testing;

use canopen::data_type::DataType;
use canopen::node::Node;
use canopen::object_dictionary::{AccessType, Object, ObjectDictionary};
use canopen::util::crc16_canopen_with_lut;
use canopen::value::Value;
use testing::{base_od, frames_with_cob, BusHandle, MockBus};

fn make_node(node_id: u8, od: ObjectDictionary) -> (Node<MockBus>, BusHandle) {
    let bus = MockBus::new();
    let handle = bus.handle();
    let mut node = Node::new(bus, node_id, od).unwrap();
    node.start();
    handle.take_sent();
    (node, handle)
}

fn od_with_scratch(node_id: u8) -> ObjectDictionary {
    let mut od = base_od(node_id);
    od.insert(
        0x2000,
        Object::new_var("Scratch string", DataType::VisibleString, AccessType::Rw,
            Value::VisibleString(String::new())),
    );
    od
}

#[test]
fn test_expedited_upload_of_device_type() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x43, 0x00, 0x10, 0x00, 0x91, 0x01, 0x0F, 0x00]]
    );
}

#[test]
fn test_expedited_download_starts_heartbeat() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x2B, 0x17, 0x10, 0x00, 0xE8, 0x03, 0x00, 0x00]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]]
    );
    assert_eq!(node.od().unsigned_value(0x1017, 0), Some(0x03E8));

    // Heartbeat producer picks the new period up immediately.
    node.poll(1010);
    let sent = handle.take_sent();
    assert_eq!(frames_with_cob(&sent, 0x701), vec![vec![0x7F]]);
    node.poll(2010);
    let sent = handle.take_sent();
    assert_eq!(frames_with_cob(&sent, 0x701), vec![vec![0x7F]]);
}

#[test]
fn test_download_to_read_only_object_aborts() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x23, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x10, 0x00, 0x02, 0x00, 0x01, 0x06]]
    );
}

#[test]
fn test_unknown_index_and_subindex_abort_codes() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x40, 0x00, 0x50, 0x00, 0, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x50, 0x00, 0x00, 0x00, 0x02, 0x06]]
    );

    handle.push_rx(0x601, &[0x40, 0x00, 0x10, 0x05, 0, 0, 0, 0]);
    node.poll(20);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x10, 0x05, 0x11, 0x00, 0x09, 0x06]]
    );
}

#[test]
fn test_segmented_upload() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    // "CANopenNode" is 11 bytes: segmented, size announced up front.
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x41, 0x08, 0x10, 0x00, 11, 0, 0, 0]]
    );

    handle.push_rx(0x601, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
    node.poll(20);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x00, b'C', b'A', b'N', b'o', b'p', b'e', b'n']]
    );

    handle.push_rx(0x601, &[0x70, 0, 0, 0, 0, 0, 0, 0]);
    node.poll(30);
    let sent = handle.take_sent();
    // 4 bytes left: n = 3, c = 1, toggle echoed.
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x17, b'N', b'o', b'd', b'e', 0, 0, 0]]
    );
}

#[test]
fn test_segmented_upload_toggle_mismatch() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(10);
    handle.take_sent();

    // First segment request must carry toggle 0.
    handle.push_rx(0x601, &[0x70, 0, 0, 0, 0, 0, 0, 0]);
    node.poll(20);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x08, 0x10, 0x00, 0x00, 0x00, 0x03, 0x05]]
    );
}

#[test]
fn test_segmented_download() {
    let (mut node, handle) = make_node(1, od_with_scratch(1));
    handle.push_rx(0x601, &[0x21, 0x00, 0x20, 0x00, 6, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]]
    );

    // Single final segment: toggle 0, n = 1 unused byte, c = 1.
    handle.push_rx(0x601, &[0x03, b'M', b'O', b'T', b'O', b'R', b'X', 0]);
    node.poll(20);
    let sent = handle.take_sent();
    assert_eq!(frames_with_cob(&sent, 0x581), vec![vec![0x20, 0, 0, 0, 0, 0, 0, 0]]);
    assert_eq!(
        node.od().sub(0x2000, 0).unwrap().value(),
        &Value::VisibleString("MOTORX".to_string())
    );
}

#[test]
fn test_block_download_with_crc() {
    let payload = b"ABCDEFGHIJ";
    let (mut node, handle) = make_node(1, od_with_scratch(1));

    // Initiate: cc = 1, s = 1, size = 10.
    handle.push_rx(0x601, &[0xC6, 0x00, 0x20, 0x00, 10, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0xA4, 0x00, 0x20, 0x00, 0x7F, 0, 0, 0]]
    );

    // Two segments; only the last one is acknowledged.
    handle.push_rx(0x601, &[0x01, b'A', b'B', b'C', b'D', b'E', b'F', b'G']);
    node.poll(20);
    assert!(handle.take_sent().is_empty());
    handle.push_rx(0x601, &[0x82, b'H', b'I', b'J', 0, 0, 0, 0]);
    node.poll(30);
    let sent = handle.take_sent();
    assert_eq!(frames_with_cob(&sent, 0x581), vec![vec![0xA2, 2, 0x7F, 0, 0, 0, 0, 0]]);

    // End: n = 4 padding bytes, CRC over the 10 payload bytes.
    let crc = crc16_canopen_with_lut(payload);
    let mut end = vec![0xD1, crc as u8, (crc >> 8) as u8];
    end.resize(8, 0);
    handle.push_rx(0x601, &end);
    node.poll(40);
    let sent = handle.take_sent();
    assert_eq!(frames_with_cob(&sent, 0x581), vec![vec![0xA1, 0, 0, 0, 0, 0, 0, 0]]);
    assert_eq!(
        node.od().sub(0x2000, 0).unwrap().value(),
        &Value::VisibleString("ABCDEFGHIJ".to_string())
    );
}

#[test]
fn test_block_download_bad_crc_aborts() {
    let (mut node, handle) = make_node(1, od_with_scratch(1));
    handle.push_rx(0x601, &[0xC6, 0x00, 0x20, 0x00, 3, 0, 0, 0]);
    node.poll(10);
    handle.take_sent();
    handle.push_rx(0x601, &[0x81, b'X', b'Y', b'Z', 0, 0, 0, 0]);
    node.poll(20);
    handle.take_sent();
    // n = 4, deliberately wrong CRC.
    handle.push_rx(0x601, &[0xD1, 0xDE, 0xAD, 0, 0, 0, 0, 0]);
    node.poll(30);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x20, 0x00, 0x04, 0x00, 0x04, 0x05]]
    );
}

#[test]
fn test_block_upload() {
    let mut od = base_od(1);
    od.insert(
        0x2001,
        Object::new_var("Blob", DataType::VisibleString, AccessType::Ro,
            Value::VisibleString("0123456789ABCDE".to_string())),
    );
    let (mut node, handle) = make_node(1, od);

    // Initiate with CRC support, client block size 127.
    handle.push_rx(0x601, &[0xA4, 0x01, 0x20, 0x00, 0x7F, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0xC6, 0x01, 0x20, 0x00, 15, 0, 0, 0]]
    );

    // Start: the server streams all three segments of the block.
    handle.push_rx(0x601, &[0xA3, 0, 0, 0, 0, 0, 0, 0]);
    node.poll(20);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![
            vec![0x01, b'0', b'1', b'2', b'3', b'4', b'5', b'6'],
            vec![0x02, b'7', b'8', b'9', b'A', b'B', b'C', b'D'],
            vec![0x83, b'E', 0, 0, 0, 0, 0, 0],
        ]
    );

    // Acknowledge all three: the server finishes with n = 6 and the CRC.
    handle.push_rx(0x601, &[0xA2, 3, 0x7F, 0, 0, 0, 0, 0]);
    node.poll(30);
    let sent = handle.take_sent();
    let crc = crc16_canopen_with_lut(b"0123456789ABCDE");
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0xC1 | (6 << 2), crc as u8, (crc >> 8) as u8, 0, 0, 0, 0, 0]]
    );

    // Client end: silence.
    handle.push_rx(0x601, &[0xA1, 0, 0, 0, 0, 0, 0, 0]);
    node.poll(40);
    assert!(handle.take_sent().is_empty());
}

#[test]
fn test_block_upload_invalid_blksize() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x601, &[0xA4, 0x00, 0x10, 0x00, 0x80, 0, 0, 0]);
    node.poll(10);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x10, 0x00, 0x02, 0x00, 0x04, 0x05]]
    );
}

#[test]
fn test_new_initiate_aborts_stale_session() {
    let (mut node, handle) = make_node(1, od_with_scratch(1));
    handle.push_rx(0x601, &[0x21, 0x00, 0x20, 0x00, 12, 0, 0, 0]);
    node.poll(10);
    handle.take_sent();

    // A fresh initiate while the segmented download is still open.
    handle.push_rx(0x601, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(20);
    let sent = frames_with_cob(&handle.take_sent(), 0x581);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], vec![0x80, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x08]);
    assert_eq!(sent[1], vec![0x43, 0x00, 0x10, 0x00, 0x91, 0x01, 0x0F, 0x00]);
}

#[test]
fn test_session_timeout_aborts() {
    let (mut node, handle) = make_node(1, od_with_scratch(1));
    handle.push_rx(0x601, &[0x21, 0x00, 0x20, 0x00, 12, 0, 0, 0]);
    node.poll(10);
    handle.take_sent();

    node.poll(6000);
    let sent = handle.take_sent();
    assert_eq!(
        frames_with_cob(&sent, 0x581),
        vec![vec![0x80, 0x00, 0x20, 0x00, 0x00, 0x00, 0x04, 0x05]]
    );
}

#[test]
fn test_sdo_ignored_while_stopped() {
    let (mut node, handle) = make_node(1, base_od(1));
    handle.push_rx(0x000, &[0x02, 0x01]);
    node.poll(10);
    handle.take_sent();

    handle.push_rx(0x601, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    node.poll(20);
    assert!(frames_with_cob(&handle.take_sent(), 0x581).is_empty());
}
