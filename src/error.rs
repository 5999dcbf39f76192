use core::fmt::Formatter;

use crate::data_type::DataType;
use crate::prelude::*;
use core::fmt;

/// Crate-internal failures that never travel on the wire.
#[derive(Clone, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    InvalidNodeId { node_id: u8 },
    InvalidStandardId { cob_id: u16 },
    FrameCreationFailed { data: Vec<u8> },
    NoCobIdInFrame,
    NoPdoForCobId { cob_id: u16 },
    PdoMappingLengthMismatch { index: u16 },
    StringToValueFailed { data_type: DataType, str: String },
    ProcessedSectionFailed { section_name: String, more_info: String },
    AbortCodeWrapper { abort_code: AbortCode, more_info: String },
    MissingObject { index: u16 },
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidNodeId { node_id } => write!(f, "Invalid node id: {}", node_id),
            ErrorCode::InvalidStandardId { cob_id } => write!(f, "Invalid standard ID: {:#x}", cob_id),
            ErrorCode::FrameCreationFailed { data } => write!(f, "Frame creation failed, data: {:x?}", data),
            ErrorCode::NoCobIdInFrame => write!(f, "No cob id"),
            ErrorCode::NoPdoForCobId { cob_id } => write!(f, "No PDO configured for cob id {:#x}", cob_id),
            ErrorCode::PdoMappingLengthMismatch { index } => {
                write!(f, "PDO mapping length mismatch on object {:#06x}", index)
            }
            ErrorCode::StringToValueFailed { data_type, str } => {
                write!(f, "String conversion failed, data_type = {:?}, str = {:?}", data_type, str)
            }
            ErrorCode::ProcessedSectionFailed { section_name, more_info } => {
                write!(f, "Processing EDS section {:?} failed: {}", section_name, more_info)
            }
            ErrorCode::AbortCodeWrapper { abort_code, more_info } => {
                write!(f, "SDO abort {:x?}: {:?}", abort_code, more_info)
            }
            ErrorCode::MissingObject { index } => write!(f, "Object {:#06x} not present", index),
        }
    }
}

/// SDO abort taxonomy, CiA 301 table 22.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    SdoProtocolTimedOut,
    CommandSpecifierNotValidOrUnknown,
    InvalidBlockSize,
    InvalidSequenceNumber,
    CrcError,
    UnsupportedAccessToObject,
    AttemptToReadWriteOnlyObject,
    AttemptToWriteReadOnlyObject,
    ObjectDoesNotExistInObjectDictionary,
    ObjectCannotBeMappedToPdo,
    ExceedPdoSize,
    ParameterLengthMismatch,
    DataTypeMismatchLengthTooHigh,
    DataTypeMismatchLengthTooLow,
    SubIndexDoesNotExist,
    InvalidValue,
    ValueWrittenTooHigh,
    ValueWrittenTooLow,
    GeneralError,
    NoDataAvailable,
}

impl AbortCode {
    pub fn code(&self) -> u32 {
        match *self {
            AbortCode::ToggleBitNotAlternated => 0x0503_0000,
            AbortCode::SdoProtocolTimedOut => 0x0504_0000,
            AbortCode::CommandSpecifierNotValidOrUnknown => 0x0504_0001,
            AbortCode::InvalidBlockSize => 0x0504_0002,
            AbortCode::InvalidSequenceNumber => 0x0504_0003,
            AbortCode::CrcError => 0x0504_0004,
            AbortCode::UnsupportedAccessToObject => 0x0601_0000,
            AbortCode::AttemptToReadWriteOnlyObject => 0x0601_0001,
            AbortCode::AttemptToWriteReadOnlyObject => 0x0601_0002,
            AbortCode::ObjectDoesNotExistInObjectDictionary => 0x0602_0000,
            AbortCode::ObjectCannotBeMappedToPdo => 0x0604_0041,
            AbortCode::ExceedPdoSize => 0x0604_0042,
            AbortCode::ParameterLengthMismatch => 0x0607_0010,
            AbortCode::DataTypeMismatchLengthTooHigh => 0x0607_0012,
            AbortCode::DataTypeMismatchLengthTooLow => 0x0607_0013,
            AbortCode::SubIndexDoesNotExist => 0x0609_0011,
            AbortCode::InvalidValue => 0x0609_0030,
            AbortCode::ValueWrittenTooHigh => 0x0609_0031,
            AbortCode::ValueWrittenTooLow => 0x0609_0032,
            AbortCode::GeneralError => 0x0800_0000,
            AbortCode::NoDataAvailable => 0x0800_0020,
        }
    }

    pub fn description(&self) -> &'static str {
        match *self {
            AbortCode::ToggleBitNotAlternated => "Toggle bit not alternated",
            AbortCode::SdoProtocolTimedOut => "SDO protocol timed out",
            AbortCode::CommandSpecifierNotValidOrUnknown => "Client/server command specifier not valid or unknown",
            AbortCode::InvalidBlockSize => "Invalid block size (block mode only)",
            AbortCode::InvalidSequenceNumber => "Invalid sequence number (block mode only)",
            AbortCode::CrcError => "CRC error (block mode only)",
            AbortCode::UnsupportedAccessToObject => "Unsupported access to an object",
            AbortCode::AttemptToReadWriteOnlyObject => "Attempt to read a write only object",
            AbortCode::AttemptToWriteReadOnlyObject => "Attempt to write a read only object",
            AbortCode::ObjectDoesNotExistInObjectDictionary => "Object does not exist in the object dictionary",
            AbortCode::ObjectCannotBeMappedToPdo => "Object cannot be mapped to the PDO",
            AbortCode::ExceedPdoSize => "The number and length of the objects to be mapped would exceed PDO length",
            AbortCode::ParameterLengthMismatch => "Data type does not match; length of service parameter does not match",
            AbortCode::DataTypeMismatchLengthTooHigh => "Data type does not match; length of service parameter too high",
            AbortCode::DataTypeMismatchLengthTooLow => "Data type does not match; length of service parameter too low",
            AbortCode::SubIndexDoesNotExist => "Sub-index does not exist",
            AbortCode::InvalidValue => "Invalid value for parameter (write access only)",
            AbortCode::ValueWrittenTooHigh => "Value of parameter written too high",
            AbortCode::ValueWrittenTooLow => "Value of parameter written too low",
            AbortCode::GeneralError => "General error",
            AbortCode::NoDataAvailable => "No data available",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0503_0000 => Some(AbortCode::ToggleBitNotAlternated),
            0x0504_0000 => Some(AbortCode::SdoProtocolTimedOut),
            0x0504_0001 => Some(AbortCode::CommandSpecifierNotValidOrUnknown),
            0x0504_0002 => Some(AbortCode::InvalidBlockSize),
            0x0504_0003 => Some(AbortCode::InvalidSequenceNumber),
            0x0504_0004 => Some(AbortCode::CrcError),
            0x0601_0000 => Some(AbortCode::UnsupportedAccessToObject),
            0x0601_0001 => Some(AbortCode::AttemptToReadWriteOnlyObject),
            0x0601_0002 => Some(AbortCode::AttemptToWriteReadOnlyObject),
            0x0602_0000 => Some(AbortCode::ObjectDoesNotExistInObjectDictionary),
            0x0604_0041 => Some(AbortCode::ObjectCannotBeMappedToPdo),
            0x0604_0042 => Some(AbortCode::ExceedPdoSize),
            0x0607_0010 => Some(AbortCode::ParameterLengthMismatch),
            0x0607_0012 => Some(AbortCode::DataTypeMismatchLengthTooHigh),
            0x0607_0013 => Some(AbortCode::DataTypeMismatchLengthTooLow),
            0x0609_0011 => Some(AbortCode::SubIndexDoesNotExist),
            0x0609_0030 => Some(AbortCode::InvalidValue),
            0x0609_0031 => Some(AbortCode::ValueWrittenTooHigh),
            0x0609_0032 => Some(AbortCode::ValueWrittenTooLow),
            0x0800_0000 => Some(AbortCode::GeneralError),
            0x0800_0020 => Some(AbortCode::NoDataAvailable),
            _ => None,
        }
    }
}

/// CiA 302-2 boot NMT slave error status, routes A..O.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NmtBootErrorCode {
    /// Slave no longer in the network list.
    A,
    /// No response to the device type upload.
    B,
    /// Device type mismatch.
    C,
    /// Vendor id mismatch.
    D,
    /// No heartbeat received inside the consumer window.
    K,
    /// Slave not in the expected NMT state.
    L,
    /// Product code mismatch.
    M,
    /// Revision number mismatch.
    N,
    /// Serial number mismatch.
    O,
}

impl NmtBootErrorCode {
    pub fn letter(&self) -> char {
        match *self {
            NmtBootErrorCode::A => 'A',
            NmtBootErrorCode::B => 'B',
            NmtBootErrorCode::C => 'C',
            NmtBootErrorCode::D => 'D',
            NmtBootErrorCode::K => 'K',
            NmtBootErrorCode::L => 'L',
            NmtBootErrorCode::M => 'M',
            NmtBootErrorCode::N => 'N',
            NmtBootErrorCode::O => 'O',
        }
    }

    /// Identity check sub-index (0x1018) behind each identity route.
    pub fn from_identity_subindex(subindex: u8) -> Option<Self> {
        match subindex {
            1 => Some(NmtBootErrorCode::D),
            2 => Some(NmtBootErrorCode::M),
            3 => Some(NmtBootErrorCode::N),
            4 => Some(NmtBootErrorCode::O),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_code_round_trip() {
        let all = [
            AbortCode::ToggleBitNotAlternated,
            AbortCode::SdoProtocolTimedOut,
            AbortCode::CommandSpecifierNotValidOrUnknown,
            AbortCode::InvalidBlockSize,
            AbortCode::InvalidSequenceNumber,
            AbortCode::CrcError,
            AbortCode::UnsupportedAccessToObject,
            AbortCode::AttemptToReadWriteOnlyObject,
            AbortCode::AttemptToWriteReadOnlyObject,
            AbortCode::ObjectDoesNotExistInObjectDictionary,
            AbortCode::ObjectCannotBeMappedToPdo,
            AbortCode::ExceedPdoSize,
            AbortCode::ParameterLengthMismatch,
            AbortCode::DataTypeMismatchLengthTooHigh,
            AbortCode::DataTypeMismatchLengthTooLow,
            AbortCode::SubIndexDoesNotExist,
            AbortCode::InvalidValue,
            AbortCode::ValueWrittenTooHigh,
            AbortCode::ValueWrittenTooLow,
            AbortCode::GeneralError,
            AbortCode::NoDataAvailable,
        ];
        for code in all {
            assert_eq!(AbortCode::from_code(code.code()), Some(code));
            assert!(!code.description().is_empty());
        }
        assert_eq!(AbortCode::from_code(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_spec_fixed_codes() {
        assert_eq!(AbortCode::ObjectDoesNotExistInObjectDictionary.code(), 0x0602_0000);
        assert_eq!(AbortCode::SubIndexDoesNotExist.code(), 0x0609_0011);
        assert_eq!(AbortCode::ToggleBitNotAlternated.code(), 0x0503_0000);
        assert_eq!(AbortCode::AttemptToWriteReadOnlyObject.code(), 0x0601_0002);
    }

    #[test]
    fn test_boot_error_letters() {
        assert_eq!(NmtBootErrorCode::from_identity_subindex(1), Some(NmtBootErrorCode::D));
        assert_eq!(NmtBootErrorCode::from_identity_subindex(4), Some(NmtBootErrorCode::O));
        assert_eq!(NmtBootErrorCode::from_identity_subindex(5), None);
        assert_eq!(NmtBootErrorCode::K.letter(), 'K');
    }
}
