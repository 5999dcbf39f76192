//! SDO command byte layouts, MSB-first as they appear in byte 0 of every
//! SDO frame.

use bitfield_struct::bitfield;

/// Download initiate request: ccs=1, `n` unused bytes valid when `s`,
/// `e` selects expedited transfer.
#[bitfield(u8, order = Msb)]
pub struct SdoDownloadInitiateCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(1)]
    _reserved_0: u8,
    #[bits(2)]
    pub n: u8,
    #[bits(1)]
    pub e: bool,
    #[bits(1)]
    pub s: bool,
}

/// Download segment request: toggle `t`, `n` unused bytes of the 7-byte
/// payload, `c` marks the final segment.
#[bitfield(u8, order = Msb)]
pub struct SdoDownloadSegmentCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(1)]
    pub t: u8,
    #[bits(3)]
    pub n: u8,
    #[bits(1)]
    pub c: bool,
}

/// Upload segment request carries only ccs and the toggle.
#[bitfield(u8, order = Msb)]
pub struct SdoUploadSegmentCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(1)]
    pub t: u8,
    #[bits(4)]
    _reserved: u8,
}

/// Block download initiate: `cc` advertises client CRC support, `s` says the
/// total size is present, `cs` is the sub-command bit.
#[bitfield(u8, order = Msb)]
pub struct SdoBlockDownloadInitiateCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(2)]
    _reserved_0: u8,
    #[bits(1)]
    pub cc: bool,
    #[bits(1)]
    pub s: bool,
    #[bits(1)]
    pub cs: bool,
}

/// Block download end: `n` counts the padding bytes of the last segment.
#[bitfield(u8, order = Msb)]
pub struct SdoEndBlockDownloadCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(3)]
    pub n: u8,
    #[bits(1)]
    _reserved_0: bool,
    #[bits(1)]
    pub cs: bool,
}

/// Block upload initiate (cs=0 of the two-bit sub-command space).
#[bitfield(u8, order = Msb)]
pub struct SdoInitBlockUploadCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(2)]
    _reserved: u8,
    #[bits(1)]
    pub cc: bool,
    #[bits(2)]
    pub cs: u8,
}

/// Block upload follow-ups: start (cs=3), ack response (cs=2), end (cs=1).
#[bitfield(u8, order = Msb)]
pub struct SdoBlockUploadCmd {
    #[bits(3)]
    pub ccs: u8,
    #[bits(3)]
    _reserved: u8,
    #[bits(2)]
    pub cs: u8,
}
