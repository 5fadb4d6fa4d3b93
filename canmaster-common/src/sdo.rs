//! Wire encoding of SDO requests, responses and block segments
//!
//! Every SDO frame is 8 bytes. The top three bits of the first byte carry the command specifier
//! (ccs for client requests, scs for server responses), and the meaning of the remaining bits
//! depends on it. Block transfer segments are the exception: they carry a continuation flag and a
//! 7-bit sequence number in the first byte and can only be told apart from other frames by
//! context.

use int_enum::IntEnum;

/// SDO abort codes, as defined by CiA-301
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC error (block mode only)
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of the objects to be mapped would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// General internal incompatibility in the device
    InternalIncompatibility = 0x0604_0047,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    MaxLessThanMin = 0x0609_0036,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the present device state
    CantStoreDeviceState = 0x0800_0022,
    /// Object dictionary dynamic generation fails or no object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl AbortCode {
    /// A human readable description of the abort reason
    pub fn description(&self) -> &'static str {
        use AbortCode::*;
        match self {
            ToggleNotAlternated => "toggle bit not alternated",
            SdoTimeout => "SDO protocol timed out",
            InvalidCommandSpecifier => "invalid or unknown command specifier",
            InvalidBlockSize => "invalid block size",
            InvalidSequenceNumber => "invalid sequence number",
            CrcError => "CRC error",
            OutOfMemory => "out of memory",
            UnsupportedAccess => "unsupported access to an object",
            WriteOnly => "attempt to read a write only object",
            ReadOnly => "attempt to write a read only object",
            NoSuchObject => "object does not exist",
            UnallowedPdo => "object cannot be mapped to the PDO",
            PdoTooLong => "mapped objects exceed PDO length",
            IncompatibleParameter => "general parameter incompatibility",
            InternalIncompatibility => "general internal incompatibility",
            HardwareError => "access failed due to a hardware error",
            DataTypeMismatch => "data type does not match",
            DataTypeMismatchLengthHigh => "data type does not match, length too high",
            DataTypeMismatchLengthLow => "data type does not match, length too low",
            NoSuchSubIndex => "sub-index does not exist",
            InvalidValue => "invalid value for parameter",
            ValueTooHigh => "value of parameter too high",
            ValueTooLow => "value of parameter too low",
            MaxLessThanMin => "maximum value is less than minimum value",
            ResourceNotAvailable => "resource not available",
            GeneralError => "general error",
            CantStore => "data cannot be transferred or stored",
            CantStoreLocalControl => "data cannot be stored because of local control",
            CantStoreDeviceState => "data cannot be stored in the present device state",
            NoObjectDict => "no object dictionary present",
            NoData => "no data available",
        }
    }
}

impl core::fmt::Display for AbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (0x{:08X})", self.description(), u32::from(*self))
    }
}

/// Error returned when bytes cannot be decoded as an SDO frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidSdoFrame;

impl core::fmt::Display for InvalidSdoFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid SDO frame")
    }
}

impl core::error::Error for InvalidSdoFrame {}

fn index_sub(bytes: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([bytes[1], bytes[2]]), bytes[3])
}

fn with_index(cmd: u8, index: u16, sub: u8) -> [u8; 8] {
    let index = index.to_le_bytes();
    [cmd, index[0], index[1], sub, 0, 0, 0, 0]
}

/// A request sent by an SDO client to an SDO server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoRequest {
    /// Begin a download, possibly carrying the whole (expedited) value
    InitiateDownload {
        /// Number of unused data bytes, when e and s are set
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Data for expedited transfers, or the total size when e=0 and s=1
        data: [u8; 4],
    },
    /// A segment of a segmented download
    DownloadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Begin an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle bit
        t: bool,
    },
    /// Begin a block download
    InitiateBlockDownload {
        /// Client supports CRC
        cc: bool,
        /// Size indicated
        s: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Total size, when s is set
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// Number of unused bytes in the final segment
        n: u8,
        /// CRC of the complete data
        crc: u16,
    },
    /// Begin a block upload
    InitiateBlockUpload {
        /// Client supports CRC
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold
        pst: u8,
    },
    /// Tell the server to start sending block segments
    StartBlockUpload,
    /// Acknowledge a block of segments during block upload
    ConfirmBlock {
        /// Sequence number of the last segment received in order
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    EndBlockUpload,
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download carrying up to 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut buf = [0; 4];
        buf[..len].copy_from_slice(&data[..len]);
        SdoRequest::InitiateDownload {
            n: (4 - len) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented download initiation, optionally indicating the total size
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create a download segment carrying up to 7 bytes
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let len = segment_data.len().min(7);
        let mut data = [0; 7];
        data[..len].copy_from_slice(&segment_data[..len]);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (7 - len) as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an upload initiation
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create a block upload initiation
    pub fn initiate_block_upload(index: u16, sub: u8, cc: bool, blksize: u8, pst: u8) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code.into(),
        }
    }

    /// Encode the request
    pub fn to_bytes(self) -> [u8; 8] {
        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let cmd = (1 << 5) | ((n & 0x3) << 2) | ((e as u8) << 1) | s as u8;
                let mut bytes = with_index(cmd, index, sub);
                bytes[4..8].copy_from_slice(&data);
                bytes
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                let mut bytes = [0; 8];
                bytes[0] = ((t as u8) << 4) | ((n & 0x7) << 1) | c as u8;
                bytes[1..8].copy_from_slice(&data);
                bytes
            }
            SdoRequest::InitiateUpload { index, sub } => with_index(2 << 5, index, sub),
            SdoRequest::ReqUploadSegment { t } => [(3 << 5) | ((t as u8) << 4), 0, 0, 0, 0, 0, 0, 0],
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                let cmd = (6 << 5) | ((cc as u8) << 2) | ((s as u8) << 1);
                let mut bytes = with_index(cmd, index, sub);
                bytes[4..8].copy_from_slice(&size.to_le_bytes());
                bytes
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                let crc = crc.to_le_bytes();
                [(6 << 5) | ((n & 0x7) << 2) | 1, crc[0], crc[1], 0, 0, 0, 0, 0]
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                let mut bytes = with_index((5 << 5) | ((cc as u8) << 2), index, sub);
                bytes[4] = blksize;
                bytes[5] = pst;
                bytes
            }
            SdoRequest::StartBlockUpload => [(5 << 5) | 3, 0, 0, 0, 0, 0, 0, 0],
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                [(5 << 5) | 2, ackseq, blksize, 0, 0, 0, 0, 0]
            }
            SdoRequest::EndBlockUpload => [(5 << 5) | 1, 0, 0, 0, 0, 0, 0, 0],
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                let mut bytes = with_index(4 << 5, index, sub);
                bytes[4..8].copy_from_slice(&abort_code.to_le_bytes());
                bytes
            }
        }
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = InvalidSdoFrame;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(InvalidSdoFrame);
        }
        let cmd = bytes[0];
        let (index, sub) = index_sub(bytes);
        match cmd >> 5 {
            0 => {
                let mut data = [0; 7];
                data.copy_from_slice(&bytes[1..8]);
                Ok(SdoRequest::DownloadSegment {
                    t: cmd & (1 << 4) != 0,
                    n: (cmd >> 1) & 0x7,
                    c: cmd & 1 != 0,
                    data,
                })
            }
            1 => {
                let mut data = [0; 4];
                data.copy_from_slice(&bytes[4..8]);
                Ok(SdoRequest::InitiateDownload {
                    n: (cmd >> 2) & 0x3,
                    e: cmd & (1 << 1) != 0,
                    s: cmd & 1 != 0,
                    index,
                    sub,
                    data,
                })
            }
            2 => Ok(SdoRequest::InitiateUpload { index, sub }),
            3 => Ok(SdoRequest::ReqUploadSegment {
                t: cmd & (1 << 4) != 0,
            }),
            4 => Ok(SdoRequest::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            }),
            5 => match cmd & 0x3 {
                0 => Ok(SdoRequest::InitiateBlockUpload {
                    cc: cmd & (1 << 2) != 0,
                    index,
                    sub,
                    blksize: bytes[4],
                    pst: bytes[5],
                }),
                1 => Ok(SdoRequest::EndBlockUpload),
                2 => Ok(SdoRequest::ConfirmBlock {
                    ackseq: bytes[1],
                    blksize: bytes[2],
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
            6 => {
                if cmd & 1 == 0 {
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc: cmd & (1 << 2) != 0,
                        s: cmd & (1 << 1) != 0,
                        index,
                        sub,
                        size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                    })
                } else {
                    Ok(SdoRequest::EndBlockDownload {
                        n: (cmd >> 2) & 0x7,
                        crc: u16::from_le_bytes([bytes[1], bytes[2]]),
                    })
                }
            }
            _ => Err(InvalidSdoFrame),
        }
    }
}

/// A response sent by an SDO server to an SDO client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoResponse {
    /// Response to an initiate upload request
    ConfirmUpload {
        /// Number of unused data bytes, when e and s are set
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Value for expedited transfers, or size for segmented transfers
        data: [u8; 4],
    },
    /// A segment of a segmented upload
    UploadSegment {
        /// Toggle bit
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// Set on the last segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Response to an initiate download request
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
    },
    /// Response to a download segment
    ConfirmDownloadSegment {
        /// Toggle bit
        t: bool,
    },
    /// Response to an initiate block download request
    ConfirmBlockDownload {
        /// Server supports CRC
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
    },
    /// Acknowledgement of a block of segments during block download
    ConfirmBlock {
        /// Sequence number of the last segment received in order
        ackseq: u8,
        /// Number of segments per block for the next block
        blksize: u8,
    },
    /// Response to an end block download request
    ConfirmBlockDownloadEnd,
    /// Response to an initiate block upload request
    ConfirmBlockUpload {
        /// Server supports CRC
        sc: bool,
        /// Size indicated
        s: bool,
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Total size, when s is set
        size: u32,
    },
    /// End of a block upload
    BlockUploadEnd {
        /// Number of unused bytes in the final segment
        n: u8,
        /// CRC of the complete data
        crc: u16,
    },
    /// Transfer aborted by the server
    Abort {
        /// Object index
        index: u16,
        /// Object sub index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create an expedited upload response carrying up to 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        let len = data.len().min(4);
        let mut buf = [0; 4];
        buf[..len].copy_from_slice(&data[..len]);
        SdoResponse::ConfirmUpload {
            n: (4 - len) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: buf,
        }
    }

    /// Create a segmented upload response indicating the total size
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> Self {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create an upload segment carrying up to 7 bytes
    pub fn upload_segment(t: bool, c: bool, segment_data: &[u8]) -> Self {
        let len = segment_data.len().min(7);
        let mut data = [0; 7];
        data[..len].copy_from_slice(&segment_data[..len]);
        SdoResponse::UploadSegment {
            t,
            n: (7 - len) as u8,
            c,
            data,
        }
    }

    /// Create a download confirmation
    pub fn download_acknowledge(index: u16, sub: u8) -> Self {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment confirmation
    pub fn download_segment_acknowledge(t: bool) -> Self {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code.into(),
        }
    }

    /// Encode the response
    pub fn to_bytes(self) -> [u8; 8] {
        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let cmd = (2 << 5) | ((n & 0x3) << 2) | ((e as u8) << 1) | s as u8;
                let mut bytes = with_index(cmd, index, sub);
                bytes[4..8].copy_from_slice(&data);
                bytes
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                let mut bytes = [0; 8];
                bytes[0] = ((t as u8) << 4) | ((n & 0x7) << 1) | c as u8;
                bytes[1..8].copy_from_slice(&data);
                bytes
            }
            SdoResponse::ConfirmDownload { index, sub } => with_index(3 << 5, index, sub),
            SdoResponse::ConfirmDownloadSegment { t } => {
                [(1 << 5) | ((t as u8) << 4), 0, 0, 0, 0, 0, 0, 0]
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                let mut bytes = with_index((5 << 5) | ((sc as u8) << 2), index, sub);
                bytes[4] = blksize;
                bytes
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                [(5 << 5) | 2, ackseq, blksize, 0, 0, 0, 0, 0]
            }
            SdoResponse::ConfirmBlockDownloadEnd => [(5 << 5) | 1, 0, 0, 0, 0, 0, 0, 0],
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                let cmd = (6 << 5) | ((sc as u8) << 2) | ((s as u8) << 1);
                let mut bytes = with_index(cmd, index, sub);
                bytes[4..8].copy_from_slice(&size.to_le_bytes());
                bytes
            }
            SdoResponse::BlockUploadEnd { n, crc } => {
                let crc = crc.to_le_bytes();
                [(6 << 5) | ((n & 0x7) << 2) | 1, crc[0], crc[1], 0, 0, 0, 0, 0]
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                let mut bytes = with_index(4 << 5, index, sub);
                bytes[4..8].copy_from_slice(&abort_code.to_le_bytes());
                bytes
            }
        }
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = InvalidSdoFrame;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(InvalidSdoFrame);
        }
        let cmd = bytes[0];
        let (index, sub) = index_sub(bytes);
        match cmd >> 5 {
            0 => {
                let mut data = [0; 7];
                data.copy_from_slice(&bytes[1..8]);
                Ok(SdoResponse::UploadSegment {
                    t: cmd & (1 << 4) != 0,
                    n: (cmd >> 1) & 0x7,
                    c: cmd & 1 != 0,
                    data,
                })
            }
            1 => Ok(SdoResponse::ConfirmDownloadSegment {
                t: cmd & (1 << 4) != 0,
            }),
            2 => {
                let mut data = [0; 4];
                data.copy_from_slice(&bytes[4..8]);
                Ok(SdoResponse::ConfirmUpload {
                    n: (cmd >> 2) & 0x3,
                    e: cmd & (1 << 1) != 0,
                    s: cmd & 1 != 0,
                    index,
                    sub,
                    data,
                })
            }
            3 => Ok(SdoResponse::ConfirmDownload { index, sub }),
            4 => Ok(SdoResponse::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            }),
            5 => match cmd & 0x3 {
                0 => Ok(SdoResponse::ConfirmBlockDownload {
                    sc: cmd & (1 << 2) != 0,
                    index,
                    sub,
                    blksize: bytes[4],
                }),
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: bytes[1],
                    blksize: bytes[2],
                }),
                _ => Err(InvalidSdoFrame),
            },
            6 => {
                if cmd & 1 == 0 {
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc: cmd & (1 << 2) != 0,
                        s: cmd & (1 << 1) != 0,
                        index,
                        sub,
                        size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                    })
                } else {
                    Ok(SdoResponse::BlockUploadEnd {
                        n: (cmd >> 2) & 0x7,
                        crc: u16::from_le_bytes([bytes[1], bytes[2]]),
                    })
                }
            }
            _ => Err(InvalidSdoFrame),
        }
    }
}

impl TryFrom<crate::messages::CanMessage> for SdoResponse {
    type Error = InvalidSdoFrame;

    fn try_from(msg: crate::messages::CanMessage) -> Result<Self, Self::Error> {
        SdoResponse::try_from(msg.data())
    }
}

/// A segment of a block transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockSegment {
    /// Set on the last segment of the whole transfer
    pub c: bool,
    /// Sequence number within the current block, 1-127
    pub seqnum: u8,
    /// Segment payload
    pub data: [u8; 7],
}

impl BlockSegment {
    /// Encode the segment
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7F);
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = InvalidSdoFrame;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(InvalidSdoFrame);
        }
        let mut data = [0; 7];
        data.copy_from_slice(&bytes[1..8]);
        Ok(BlockSegment {
            c: bytes[0] & 0x80 != 0,
            seqnum: bytes[0] & 0x7F,
            data,
        })
    }
}
