//! SDO server. One session at a time, multiplexed by `(index, subindex)`;
//! the in-flight buffer travels with the state variant so an abort drops it
//! wholesale.

use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::cmd_header::{
    SdoBlockDownloadInitiateCmd, SdoBlockUploadCmd, SdoDownloadInitiateCmd, SdoDownloadSegmentCmd,
    SdoEndBlockDownloadCmd, SdoInitBlockUploadCmd, SdoUploadSegmentCmd,
};
use crate::error::AbortCode;
use crate::message::NmtCommand;
use crate::node::Node;
use crate::object_dictionary::{
    ODI_PREDEFINED_ERROR_FIELD, ODI_REQUEST_NMT, ODI_SDO_SERVER, ODSI_SDO_SERVER_RX_COB_ID,
    ODSI_SDO_SERVER_TX_COB_ID,
};
use crate::prelude::*;
use crate::timers::TimerEvent;
use crate::util::crc16_canopen_with_lut;
use crate::{error, info};

/// Inactivity window after which an in-flight session aborts with
/// `SdoProtocolTimedOut`.
pub const SDO_SERVER_TIMEOUT_MS: u64 = 5_000;

/// Block size granted to downloading clients.
const SERVER_BLOCK_SIZE: u8 = 0x7F;

/// Session state. `Idle` between transfers; every other variant owns the
/// partial data it is accumulating or serving.
pub enum SdoState {
    Idle,
    DownloadSegmented {
        index: u16,
        subindex: u8,
        toggle: u8,
        expected_len: usize,
        buf: Vec<u8>,
    },
    UploadSegmented {
        index: u16,
        subindex: u8,
        toggle: u8,
        buf: Vec<u8>,
        pos: usize,
    },
    BlockDownload {
        index: u16,
        subindex: u8,
        next_seqno: u8,
        blksize: u8,
        expected_len: usize,
        crc_enabled: bool,
        buf: Vec<u8>,
        /// All segments received, waiting for the end sub-command.
        awaiting_end: bool,
    },
    BlockUpload {
        index: u16,
        subindex: u8,
        blksize: u8,
        crc_enabled: bool,
        data: Vec<u8>,
        /// Bytes acknowledged by the client so far.
        confirmed: usize,
    },
}

impl SdoState {
    fn mux(&self) -> Option<(u16, u8)> {
        match *self {
            SdoState::Idle => None,
            SdoState::DownloadSegmented { index, subindex, .. }
            | SdoState::UploadSegmented { index, subindex, .. }
            | SdoState::BlockDownload { index, subindex, .. }
            | SdoState::BlockUpload { index, subindex, .. } => Some((index, subindex)),
        }
    }
}

type SdoResult = Result<Option<Vec<u8>>, (u16, u8, AbortCode)>;

impl<CAN: Can> Node<CAN>
where
    CAN::Frame: Frame + Debug,
{
    /// COB-ID this server answers on, OD 0x1200:2 with the pre-defined
    /// connection set as fallback.
    pub(crate) fn sdo_server_tx_cob(&self) -> u16 {
        self.od
            .unsigned_value(ODI_SDO_SERVER, ODSI_SDO_SERVER_TX_COB_ID)
            .map(|v| (v & 0x1FFF_FFFF) as u16 & 0x7FF)
            .unwrap_or(0x580 | self.node_id as u16)
    }

    /// COB-ID this server listens on, OD 0x1200:1.
    pub(crate) fn sdo_server_rx_cob(&self) -> u16 {
        self.od
            .unsigned_value(ODI_SDO_SERVER, ODSI_SDO_SERVER_RX_COB_ID)
            .map(|v| (v & 0x1FFF_FFFF) as u16 & 0x7FF)
            .unwrap_or(0x600 | self.node_id as u16)
    }

    pub(crate) fn process_sdo_request(&mut self, data: [u8; 8]) {
        let result = self.sdo_transition(data);
        match result {
            Ok(Some(payload)) => self.send_sdo_response(&payload),
            Ok(None) => {}
            Err((index, subindex, code)) => self.send_sdo_abort(index, subindex, code),
        }
        self.rearm_sdo_session_timer();
    }

    /// Session inactivity expiry.
    pub(crate) fn on_sdo_session_timeout(&mut self) {
        if let Some((index, subindex)) = self.sdo_session.mux() {
            self.send_sdo_abort(index, subindex, AbortCode::SdoProtocolTimedOut);
        }
    }

    fn rearm_sdo_session_timer(&mut self) {
        if let Some(handle) = self.sdo_session_timer.take() {
            self.timers.cancel(handle);
        }
        if !matches!(self.sdo_session, SdoState::Idle) {
            self.sdo_session_timer =
                Some(self.timers.one_shot(self.now_ms, SDO_SERVER_TIMEOUT_MS, TimerEvent::SdoServerTimeout));
        }
    }

    pub(crate) fn send_sdo_abort(&mut self, index: u16, subindex: u8, code: AbortCode) {
        info!("SDO abort for mux {:#06x}:{}, code {:#010x}", index, subindex, code.code());
        self.sdo_session = SdoState::Idle;
        let mut payload = vec![0x80];
        payload.extend_from_slice(&index.to_le_bytes());
        payload.push(subindex);
        payload.extend_from_slice(&code.code().to_le_bytes());
        self.send_sdo_response(&payload);
    }

    fn send_sdo_response(&mut self, payload: &[u8]) {
        let cob = self.sdo_server_tx_cob();
        match crate::util::create_frame_with_padding::<CAN::Frame>(cob, payload) {
            Ok(frame) => self.transmit(&frame),
            Err(ec) => {
                error!("Errors in creating SDO response frame: {:x?}, error_code = {:?}", payload, ec);
            }
        }
    }

    fn sdo_transition(&mut self, data: [u8; 8]) -> SdoResult {
        // Mid-block download segments carry a sequence number where the
        // command specifier normally sits; they bypass ccs dispatch.
        if let SdoState::BlockDownload { awaiting_end: false, .. } = self.sdo_session {
            return self.block_download_segment(data);
        }

        let ccs = data[0] >> 5;
        let index = u16::from_le_bytes([data[1], data[2]]);
        let subindex = data[3];

        match ccs {
            4 => {
                // Client abort: drop the session without a reply.
                if let Some((i, si)) = self.sdo_session.mux() {
                    info!("SDO transfer aborted by client, mux {:#06x}:{}", i, si);
                }
                self.sdo_session = SdoState::Idle;
                Ok(None)
            }
            1 => {
                self.abort_stale_session();
                self.initiate_download(index, subindex, data)
            }
            2 => {
                self.abort_stale_session();
                self.initiate_upload(index, subindex)
            }
            0 => self.download_segment(data),
            3 => self.upload_segment(data[0]),
            6 => {
                let cmd = SdoBlockDownloadInitiateCmd::from(data[0]);
                if !cmd.cs() {
                    self.abort_stale_session();
                    self.init_block_download(index, subindex, data)
                } else {
                    self.end_block_download(data)
                }
            }
            5 => {
                let cmd = SdoBlockUploadCmd::from(data[0]);
                match cmd.cs() {
                    0 => {
                        self.abort_stale_session();
                        self.init_block_upload(index, subindex, data)
                    }
                    3 => self.start_block_upload(),
                    2 => self.ack_block_upload(data),
                    _ => self.end_block_upload(),
                }
            }
            _ => Err((index, subindex, AbortCode::CommandSpecifierNotValidOrUnknown)),
        }
    }

    /// A new initiate while a session is active implicitly aborts the old
    /// session first.
    fn abort_stale_session(&mut self) {
        if let Some((index, subindex)) = self.sdo_session.mux() {
            self.send_sdo_abort(index, subindex, AbortCode::GeneralError);
        }
    }

    fn initiate_download(&mut self, index: u16, subindex: u8, data: [u8; 8]) -> SdoResult {
        let fail = |code| (index, subindex, code);
        let sub = self.od.sub(index, subindex).map_err(|c| fail(c))?;
        if !sub.access_type().is_writable() {
            return Err(fail(AbortCode::AttemptToWriteReadOnlyObject));
        }
        let data_type = sub.data_type();
        let cmd = SdoDownloadInitiateCmd::from(data[0]);

        if cmd.e() {
            let n = if cmd.s() {
                cmd.n() as usize
            } else {
                // Size not indicated; fall back to the data-type width.
                data_type.size().map(|s| 4 - s.clamp(1, 4)).unwrap_or(0)
            };
            self.commit_download(index, subindex, &data[4..8 - n].to_vec())
                .map_err(|c| fail(c))?;
            return Ok(Some(download_initiate_response(index, subindex)));
        }
        if !cmd.s() {
            // e = 0, s = 0 is reserved.
            return Err(fail(AbortCode::GeneralError));
        }
        let expected_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if expected_len == 0 {
            return Err(fail(AbortCode::ParameterLengthMismatch));
        }
        info!("SDO segmented download initiated for mux {:#06x}:{}, {} bytes", index, subindex, expected_len);
        self.sdo_session = SdoState::DownloadSegmented {
            index,
            subindex,
            toggle: 0,
            expected_len,
            buf: Vec::with_capacity(expected_len),
        };
        Ok(Some(download_initiate_response(index, subindex)))
    }

    fn download_segment(&mut self, data: [u8; 8]) -> SdoResult {
        let cmd = SdoDownloadSegmentCmd::from(data[0]);
        let (index, subindex, commit) = match &mut self.sdo_session {
            SdoState::DownloadSegmented { index, subindex, toggle, expected_len, buf } => {
                let (index, subindex) = (*index, *subindex);
                if cmd.t() != *toggle {
                    return Err((index, subindex, AbortCode::ToggleBitNotAlternated));
                }
                *toggle ^= 1;
                buf.extend_from_slice(&data[1..8 - cmd.n() as usize]);
                if cmd.c() {
                    if *expected_len > 0 && buf.len() != *expected_len {
                        return Err((index, subindex, AbortCode::GeneralError));
                    }
                    (index, subindex, Some(core::mem::take(buf)))
                } else {
                    (index, subindex, None)
                }
            }
            _ => return Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        };
        if let Some(buf) = commit {
            self.sdo_session = SdoState::Idle;
            self.commit_download(index, subindex, &buf)
                .map_err(|c| (index, subindex, c))?;
        }
        Ok(Some(vec![0x20 | (cmd.t() << 4)]))
    }

    fn initiate_upload(&mut self, index: u16, subindex: u8) -> SdoResult {
        let fail = |code| (index, subindex, code);
        let sub = self.od.read(index, subindex).map_err(|c| fail(c))?;
        let data = sub.to_bytes();
        if data.is_empty() {
            return Err(fail(AbortCode::NoDataAvailable));
        }

        if data.len() <= 4 {
            let cmd = 0x43 | (((4 - data.len()) as u8) << 2);
            let mut payload = vec![cmd];
            payload.extend_from_slice(&index.to_le_bytes());
            payload.push(subindex);
            payload.extend_from_slice(&data);
            return Ok(Some(payload));
        }

        let mut payload = vec![0x41];
        payload.extend_from_slice(&index.to_le_bytes());
        payload.push(subindex);
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        info!("SDO segmented upload initiated for mux {:#06x}:{}, {} bytes", index, subindex, data.len());
        self.sdo_session = SdoState::UploadSegmented { index, subindex, toggle: 0, buf: data, pos: 0 };
        Ok(Some(payload))
    }

    fn upload_segment(&mut self, cmd_byte: u8) -> SdoResult {
        let cmd = SdoUploadSegmentCmd::from(cmd_byte);
        match &mut self.sdo_session {
            SdoState::UploadSegmented { index, subindex, toggle, buf, pos } => {
                if cmd.t() != *toggle {
                    return Err((*index, *subindex, AbortCode::ToggleBitNotAlternated));
                }
                // The reply carries the received toggle; the expectation
                // flips for the next segment.
                *toggle ^= 1;
                let remaining = buf.len() - *pos;
                let l = remaining.min(7);
                let n = (7 - l) as u8;
                let done = remaining <= 7;
                let mut payload = vec![(cmd.t() << 4) | (n << 1) | done as u8];
                payload.extend_from_slice(&buf[*pos..*pos + l]);
                *pos += l;
                if done {
                    self.sdo_session = SdoState::Idle;
                }
                Ok(Some(payload))
            }
            _ => Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        }
    }

    fn init_block_download(&mut self, index: u16, subindex: u8, data: [u8; 8]) -> SdoResult {
        let fail = |code| (index, subindex, code);
        let sub = self.od.sub(index, subindex).map_err(|c| fail(c))?;
        if !sub.access_type().is_writable() {
            return Err(fail(AbortCode::AttemptToWriteReadOnlyObject));
        }
        let cmd = SdoBlockDownloadInitiateCmd::from(data[0]);
        let expected_len = if cmd.s() {
            let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
            if size == 0 {
                return Err(fail(AbortCode::ParameterLengthMismatch));
            }
            size
        } else {
            0
        };
        info!("SDO block download initiated for mux {:#06x}:{}", index, subindex);
        self.sdo_session = SdoState::BlockDownload {
            index,
            subindex,
            next_seqno: 1,
            blksize: SERVER_BLOCK_SIZE,
            expected_len,
            crc_enabled: cmd.cc(),
            buf: Vec::with_capacity(expected_len),
            awaiting_end: false,
        };
        // Server mirrors the client's CRC capability.
        let mut payload = vec![0xA0 | (cmd.cc() as u8) << 2];
        payload.extend_from_slice(&index.to_le_bytes());
        payload.push(subindex);
        payload.push(SERVER_BLOCK_SIZE);
        Ok(Some(payload))
    }

    fn block_download_segment(&mut self, data: [u8; 8]) -> SdoResult {
        match &mut self.sdo_session {
            SdoState::BlockDownload { index, subindex, next_seqno, blksize, buf, awaiting_end, .. } => {
                let last = data[0] >> 7 == 1;
                let seqno = data[0] & 0x7F;
                let ackseq;
                if seqno != *next_seqno {
                    if *next_seqno > 1 {
                        return Err((*index, *subindex, AbortCode::InvalidSequenceNumber));
                    }
                    // First segment of the block went missing; ask for a
                    // retransmission of the whole block.
                    ackseq = 0;
                } else {
                    buf.extend_from_slice(&data[1..8]);
                    ackseq = seqno;
                    if last {
                        *awaiting_end = true;
                    } else if seqno == *blksize {
                        *next_seqno = 1;
                    } else {
                        *next_seqno += 1;
                        return Ok(None);
                    }
                }
                Ok(Some(vec![0xA2, ackseq, *blksize]))
            }
            _ => Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        }
    }

    fn end_block_download(&mut self, data: [u8; 8]) -> SdoResult {
        let cmd = SdoEndBlockDownloadCmd::from(data[0]);
        let (index, subindex, buf) = match &mut self.sdo_session {
            SdoState::BlockDownload { index, subindex, crc_enabled, buf, awaiting_end: true, .. } => {
                let unused = cmd.n() as usize;
                buf.truncate(buf.len().saturating_sub(unused));
                if *crc_enabled {
                    let crc = u16::from_le_bytes([data[1], data[2]]);
                    if crc != crc16_canopen_with_lut(buf) {
                        return Err((*index, *subindex, AbortCode::CrcError));
                    }
                }
                (*index, *subindex, core::mem::take(buf))
            }
            _ => return Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        };
        self.sdo_session = SdoState::Idle;
        self.commit_download(index, subindex, &buf)
            .map_err(|c| (index, subindex, c))?;
        Ok(Some(vec![0xA1]))
    }

    fn init_block_upload(&mut self, index: u16, subindex: u8, data: [u8; 8]) -> SdoResult {
        let fail = |code| (index, subindex, code);
        let cmd = SdoInitBlockUploadCmd::from(data[0]);
        let blksize = data[4];
        if blksize == 0 || blksize >= 0x80 {
            return Err(fail(AbortCode::InvalidBlockSize));
        }
        let sub = self.od.read(index, subindex).map_err(|c| fail(c))?;
        let upload = sub.to_bytes();

        let mut payload = vec![0xC0 | (cmd.cc() as u8) << 2 | 0x02];
        payload.extend_from_slice(&index.to_le_bytes());
        payload.push(subindex);
        payload.extend_from_slice(&(upload.len() as u32).to_le_bytes());
        info!("SDO block upload initiated for mux {:#06x}:{}, {} bytes", index, subindex, upload.len());
        self.sdo_session = SdoState::BlockUpload {
            index,
            subindex,
            blksize,
            crc_enabled: cmd.cc(),
            data: upload,
            confirmed: 0,
        };
        Ok(Some(payload))
    }

    fn start_block_upload(&mut self) -> SdoResult {
        match self.sdo_session {
            SdoState::BlockUpload { .. } => {
                self.send_block_upload_segments();
                Ok(None)
            }
            _ => Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        }
    }

    fn ack_block_upload(&mut self, data: [u8; 8]) -> SdoResult {
        let (done, n, crc) = match &mut self.sdo_session {
            SdoState::BlockUpload { index, subindex, blksize, crc_enabled, data: upload, confirmed } => {
                let ackseq = data[1] as usize;
                let new_blksize = data[2];
                if new_blksize == 0 || new_blksize >= 0x80 {
                    return Err((*index, *subindex, AbortCode::InvalidBlockSize));
                }
                *blksize = new_blksize;
                let remaining = upload.len() - *confirmed;
                *confirmed += (7 * ackseq).min(remaining);
                if *confirmed >= upload.len() {
                    let tail = upload.len() % 7;
                    let n = if tail == 0 { 0 } else { (7 - tail) as u8 };
                    let crc = if *crc_enabled { crc16_canopen_with_lut(upload) } else { 0 };
                    (true, n, crc)
                } else {
                    (false, 0, 0)
                }
            }
            _ => return Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        };
        if done {
            let mut payload = vec![0xC1 | (n << 2)];
            payload.extend_from_slice(&crc.to_le_bytes());
            Ok(Some(payload))
        } else {
            self.send_block_upload_segments();
            Ok(None)
        }
    }

    fn end_block_upload(&mut self) -> SdoResult {
        match self.sdo_session {
            SdoState::BlockUpload { .. } => {
                self.sdo_session = SdoState::Idle;
                Ok(None)
            }
            _ => Err((0, 0, AbortCode::CommandSpecifierNotValidOrUnknown)),
        }
    }

    /// Emits one block of upload segments, 7 data bytes each.
    fn send_block_upload_segments(&mut self) {
        let frames: Vec<Vec<u8>> = match &self.sdo_session {
            SdoState::BlockUpload { blksize, data, confirmed, .. } => {
                let mut out = Vec::new();
                let mut offset = *confirmed;
                for seqno in 1..=*blksize {
                    if offset >= data.len() {
                        break;
                    }
                    let l = (data.len() - offset).min(7);
                    let last = offset + l >= data.len();
                    let mut payload = vec![((last as u8) << 7) | seqno];
                    payload.extend_from_slice(&data[offset..offset + l]);
                    out.push(payload);
                    offset += l;
                }
                out
            }
            _ => return,
        };
        for payload in frames {
            self.send_sdo_response(&payload);
        }
    }

    /// Decodes and stores a downloaded value, then lets the node react to
    /// the write (timers, PDO parameters, request-NMT relay).
    fn commit_download(&mut self, index: u16, subindex: u8, raw: &[u8]) -> Result<(), AbortCode> {
        if index == ODI_PREDEFINED_ERROR_FIELD && subindex == 0 {
            // Only zero may be written here, and it clears the history.
            if raw.iter().any(|&b| b != 0) {
                return Err(AbortCode::InvalidValue);
            }
            self.clear_error_history();
            return Ok(());
        }
        if index == ODI_REQUEST_NMT {
            return self.request_nmt_via_sdo(subindex, raw);
        }
        self.od.write(index, subindex, raw, false)?;
        self.on_od_written(index, subindex);
        Ok(())
    }

    /// Download to 0x1F82: the active NMT master relays node control.
    fn request_nmt_via_sdo(&mut self, subindex: u8, raw: &[u8]) -> Result<(), AbortCode> {
        if !self.is_active_nmt_master() {
            return Err(AbortCode::GeneralError);
        }
        let target = subindex & 0x7F;
        let command = match raw.first().map(|v| v & 0x7F) {
            Some(0x04) => NmtCommand::Stop,
            Some(0x05) => NmtCommand::Start,
            Some(0x06) => NmtCommand::ResetNode,
            Some(0x07) => NmtCommand::ResetCommunication,
            Some(0x7F) => NmtCommand::EnterPreOperational,
            _ => return Err(AbortCode::InvalidValue),
        };
        self.send_nmt_node_control(command, target);
        let _ = self.od.write(ODI_REQUEST_NMT, subindex, raw, true);
        Ok(())
    }
}

fn download_initiate_response(index: u16, subindex: u8) -> Vec<u8> {
    let mut payload = vec![0x60];
    payload.extend_from_slice(&index.to_le_bytes());
    payload.push(subindex);
    payload
}
