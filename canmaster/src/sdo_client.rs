//! SDO client for a remote node's default SDO server
//!
//! One [`SdoClient`] exists per remote node and is shared by every clone of the node handle.
//! Transfers to the same node are serialized in FIFO order: a second request waits until the first
//! has completed, aborted or timed out before any of its frames are sent.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use canmaster_common::{
    constants::{
        object_ids::{self, is_pdo_parameter},
        values::{LOAD_CMD, SAVE_CMD},
    },
    messages::{CanId, SDO_REQ_BASE, SDO_RESP_BASE},
    nmt::NmtState,
    objects::{ObjectDictionary, ObjectDictionaryError, Value},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    CanMessage, NodeId, TimeDifference, TimeOfDay,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, MutexGuard, OwnedMutexGuard};

use crate::{
    bus::{BusError, BusHandle},
    nmt::NmtTracker,
};

/// A wrapper around the AbortCode enum to allow for unknown values
///
/// Although the library should "know" all the abort codes, it is possible to receive other values
/// and this allows those to be captured and exposed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// An unrecognized abort code
    Unknown(u32),
}

impl std::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAbortCode::Valid(abort_code) => write!(f, "{abort_code}"),
            RawAbortCode::Unknown(code) => write!(f, "unknown abort code 0x{code:08X}"),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        Self::Valid(value)
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => Self::Valid(code),
            Err(_) => Self::Unknown(value),
        }
    }
}

/// Error returned by [`SdoClient`] methods
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// Timeout while awaiting an expected response
    NoResponse,
    /// Received a response that could not be interpreted
    MalformedResponse,
    /// Received a valid SdoResponse, but with an unexpected command specifier
    #[snafu(display("Unexpected SDO response. Expected {expecting}, got {response:?}"))]
    UnexpectedResponse {
        /// The type of response which was expected
        expecting: String,
        /// The response which was received
        response: SdoResponse,
    },
    /// Received a ServerAbort response from the node
    #[snafu(display("Received abort accessing object 0x{index:X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Index of the SDO access which was aborted
        index: u16,
        /// Sub index of the SDO access which was aborted
        sub: u8,
        /// Reason for the abort
        abort_code: RawAbortCode,
    },
    /// Received a response with the wrong toggle bit
    ToggleNotAlternated,
    /// Received a response with a different index/sub value than was requested
    #[snafu(display("Received object 0x{:x}sub{} after requesting 0x{:x}sub{}",
        received.0, received.1, expected.0, expected.1))]
    MismatchedObjectIndex {
        /// The object ID which was expected to be echoed back
        expected: (u16, u8),
        /// The received object ID
        received: (u16, u8),
    },
    /// An SDO upload response had a size that did not match the expected size
    UnexpectedSize,
    /// An SDO server shrunk the block size while requesting retransmission
    BlockSizeChangedTooSmall,
    /// The CRC on a block transfer did not match
    CrcMismatch,
    /// A block acknowledgement or segment carried an impossible sequence number
    InvalidSequence,
    /// The node's cached NMT state is Stopped, so it will not answer
    NodeStopped,
    /// Failed to send, or the network disconnected during the transfer
    #[snafu(display("{source}"))]
    Bus {
        /// The underlying bus error
        source: BusError,
    },
    /// The value was rejected by the local object dictionary before any frame was sent
    #[snafu(display("{source}"))]
    Dictionary {
        /// The dictionary error
        source: ObjectDictionaryError,
    },
}

impl SdoClientError {
    /// The abort code the client sends when it gives up a transfer with this error
    ///
    /// Returns None when no abort should be sent: the server already aborted, or the bus is gone.
    fn client_abort_code(&self) -> Option<AbortCode> {
        match self {
            SdoClientError::NoResponse => Some(AbortCode::SdoTimeout),
            SdoClientError::MalformedResponse | SdoClientError::UnexpectedResponse { .. } => {
                Some(AbortCode::InvalidCommandSpecifier)
            }
            SdoClientError::ToggleNotAlternated => Some(AbortCode::ToggleNotAlternated),
            SdoClientError::CrcMismatch => Some(AbortCode::CrcError),
            SdoClientError::InvalidSequence => Some(AbortCode::InvalidSequenceNumber),
            SdoClientError::BlockSizeChangedTooSmall => Some(AbortCode::InvalidBlockSize),
            SdoClientError::MismatchedObjectIndex { .. } | SdoClientError::UnexpectedSize => {
                Some(AbortCode::GeneralError)
            }
            SdoClientError::ServerAbort { .. }
            | SdoClientError::NodeStopped
            | SdoClientError::Bus { .. }
            | SdoClientError::Dictionary { .. } => None,
        }
    }
}

type Result<T> = std::result::Result<T, SdoClientError>;

/// Convenience macro for expecting a particular variant of a response and erroring on abort of
/// unexpected variant
macro_rules! match_response  {
    ($resp: ident, $expecting: literal, $($match:pat => $code : expr),*) => {
                match $resp {
                    $($match => $code),*
                    SdoResponse::Abort {
                        index,
                        sub,
                        abort_code,
                    } => {
                        return ServerAbortSnafu {
                            index,
                            sub,
                            abort_code: RawAbortCode::from(abort_code),
                        }
                        .fail()
                    }
                    _ => {
                        return UnexpectedResponseSnafu {
                            expecting: $expecting,
                            response: $resp,
                        }
                        .fail()
                    }
                }
    };
}

use paste::paste;
macro_rules! access_methods {
    ($type: ty) => {

        paste! {
            #[doc = concat!("Read a ", stringify!($type), " sub object from the SDO server\n\n")]
            #[doc = concat!("This is an alias for upload_", stringify!($type), " for a more intuitive API")]
            pub async fn [<read_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                self.[<upload_ $type>](index, sub).await
            }

            #[doc = concat!("Read a ", stringify!($type), " sub object from the SDO server")]
            pub async fn [<upload_ $type>](&self, index: u16, sub: u8) -> Result<$type> {
                let data = self.upload(index, sub).await?;
                let bytes: [u8; std::mem::size_of::<$type>()] = data
                    .try_into()
                    .map_err(|_| SdoClientError::UnexpectedSize)?;
                Ok($type::from_le_bytes(bytes))
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on the SDO server\n\n")]
            #[doc = concat!("This is an alias for download_", stringify!($type), " for a more intuitive API")]
            pub async fn [<write_ $type>](&self, index: u16, sub: u8, value: $type) -> Result<()> {
                self.[<download_ $type>](index, sub, value).await
            }

            #[doc = concat!("Write a ", stringify!($type), " sub object on the SDO server")]
            pub async fn [<download_ $type>](&self, index: u16, sub: u8, value: $type) -> Result<()> {
                let data = value.to_le_bytes();
                self.download(index, sub, &data).await
            }
        }
    };
}

/// Progress of the most recent transfer on a client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer has run, or one is being set up
    Idle,
    /// A segmented transfer is in progress
    Segmented,
    /// A block transfer is in progress
    Block,
    /// The last transfer completed successfully
    Done,
    /// The last transfer was aborted by either side, timed out or was cancelled
    Aborted,
}

/// Tunables for an SDO client
#[derive(Clone, Copy, Debug)]
pub(crate) struct SdoSettings {
    pub timeout: Duration,
    pub block_transfer: bool,
    pub block_threshold: usize,
}

/// The identity object (0x1018) of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Vendor ID (sub 1)
    pub vendor_id: u32,
    /// Product code (sub 2)
    pub product_code: u32,
    /// Revision number (sub 3)
    pub revision: u32,
    /// Serial number (sub 4)
    pub serial: u32,
}

/// Exclusive access to a node's PDO communication and mapping parameters
///
/// Held by a PDO for the whole of a save sequence. Ordinary SDO accesses to 0x1400-0x1BFF wait
/// until it is dropped.
#[derive(Debug)]
pub struct MappingGuard {
    _guard: OwnedMutexGuard<()>,
    node_id: NodeId,
}

struct Shared {
    node_id: NodeId,
    req_cob_id: CanId,
    bus: BusHandle,
    settings: Mutex<SdoSettings>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<CanMessage>>,
    state: Mutex<TransferState>,
    nmt: Arc<NmtTracker>,
    od: Arc<Mutex<ObjectDictionary>>,
    mapping_lock: Arc<tokio::sync::Mutex<()>>,
}

/// A client for accessing a node's SDO server
///
/// Cloning is cheap and every clone shares the same transfer queue.
#[derive(Clone)]
pub struct SdoClient {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for SdoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdoClient")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.transfer_state())
            .finish()
    }
}

impl SdoClient {
    /// Create a client for a node's default SDO server
    ///
    /// `responses` receives every frame the dispatch task sees on the node's SDO response COB-ID.
    pub(crate) fn new(
        node_id: NodeId,
        bus: BusHandle,
        responses: mpsc::UnboundedReceiver<CanMessage>,
        nmt: Arc<NmtTracker>,
        od: Arc<Mutex<ObjectDictionary>>,
        settings: SdoSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                node_id,
                req_cob_id: CanId::Std(SDO_REQ_BASE + node_id.raw() as u16),
                bus,
                settings: Mutex::new(settings),
                responses: tokio::sync::Mutex::new(responses),
                state: Mutex::new(TransferState::Idle),
                nmt,
                od,
                mapping_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// The COB-ID on which the server responds
    pub fn response_cob_id(&self) -> CanId {
        CanId::Std(SDO_RESP_BASE + self.inner.node_id.raw() as u16)
    }

    /// Set the timeout for waiting on SDO server responses
    pub fn set_timeout(&self, timeout: Duration) {
        if let Ok(mut s) = self.inner.settings.lock() {
            s.timeout = timeout;
        }
    }

    /// Get the current timeout for waiting on SDO server responses
    pub fn get_timeout(&self) -> Duration {
        self.settings().timeout
    }

    /// State of the current or most recent transfer
    pub fn transfer_state(&self) -> TransferState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(TransferState::Idle)
    }

    fn settings(&self) -> SdoSettings {
        match self.inner.settings.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Take exclusive access to the node's PDO parameters
    pub(crate) async fn lock_mapping(&self) -> MappingGuard {
        MappingGuard {
            _guard: self.inner.mapping_lock.clone().lock_owned().await,
            node_id: self.inner.node_id,
        }
    }

    async fn begin(&self, index: u16, sub: u8) -> Result<Transfer<'_>> {
        let mut rx = self.inner.responses.lock().await;
        if self.inner.nmt.current().state == Some(NmtState::Stopped) {
            return NodeStoppedSnafu.fail();
        }
        // Anything buffered now belongs to an earlier, finished transfer
        while rx.try_recv().is_ok() {}
        let transfer = Transfer {
            shared: &self.inner,
            rx,
            index,
            sub,
            timeout: self.settings().timeout,
            finished: false,
        };
        transfer.set_state(TransferState::Idle);
        Ok(transfer)
    }

    /// Write data to a sub-object on the SDO server
    ///
    /// Uses an expedited transfer for up to 4 bytes, and a segmented transfer otherwise. When block
    /// transfers are enabled in the network config, data above the block threshold is sent with a
    /// block download.
    pub async fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let _guard = self.lock_if_pdo_parameter(index).await;
        self.download_unlocked(index, sub, data).await
    }

    /// Write a PDO parameter while holding the mapping lock
    pub(crate) async fn download_locked(
        &self,
        guard: &MappingGuard,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(guard.node_id, self.inner.node_id);
        self.download_unlocked(index, sub, data).await
    }

    async fn lock_if_pdo_parameter(&self, index: u16) -> Option<MappingGuard> {
        if is_pdo_parameter(index) {
            Some(self.lock_mapping().await)
        } else {
            None
        }
    }

    async fn download_unlocked(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let settings = self.settings();
        let mut transfer = self.begin(index, sub).await?;
        let result = if settings.block_transfer && data.len() > settings.block_threshold {
            transfer.block_download(data).await
        } else {
            transfer.download(data).await
        };
        transfer.finish(&result);
        result
    }

    /// Read a sub-object on the SDO server
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let _guard = self.lock_if_pdo_parameter(index).await;
        let mut transfer = self.begin(index, sub).await?;
        let result = transfer.upload().await;
        transfer.finish(&result);
        result
    }

    /// Perform a block download to transfer data to an object
    ///
    /// Block downloads are more efficient for large amounts of data, but may not be supported by
    /// all devices.
    pub async fn block_download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        let _guard = self.lock_if_pdo_parameter(index).await;
        let mut transfer = self.begin(index, sub).await?;
        let result = transfer.block_download(data).await;
        transfer.finish(&result);
        result
    }

    /// Perform a block upload of data from the node
    pub async fn block_upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let _guard = self.lock_if_pdo_parameter(index).await;
        let mut transfer = self.begin(index, sub).await?;
        let result = transfer.block_upload().await;
        transfer.finish(&result);
        result
    }

    /// Read an entry and decode it with the node's object dictionary
    ///
    /// The decoded value is recorded as the entry's last known value. Variable length entries are
    /// read with a block upload when block transfers are enabled.
    pub async fn read(&self, index: u16, sub: u8) -> Result<Value> {
        let data_type = {
            let od = self.od();
            od.check_read(index, sub).context(DictionarySnafu)?.data_type
        };
        let bytes = if self.settings().block_transfer && data_type.size().is_none() {
            self.block_upload(index, sub).await?
        } else {
            self.upload(index, sub).await?
        };
        let mut od = self.od();
        let value = od.decode(index, sub, &bytes).context(DictionarySnafu)?;
        od.update_value(index, sub, value.clone())
            .context(DictionarySnafu)?;
        Ok(value)
    }

    /// Read an entry by name, e.g. "Statusword" or "Identity.Serial number"
    pub async fn read_by_name(&self, name: &str) -> Result<Value> {
        let (index, sub) = self.od().key_of(name).context(DictionarySnafu)?;
        self.read(index, sub).await
    }

    /// Check a value against the node's object dictionary, then write it
    ///
    /// Unknown entries, read-only entries, type mismatches and out of range values are rejected
    /// before any frame is sent. On success the value is recorded as the entry's last known value.
    pub async fn write(&self, index: u16, sub: u8, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.od()
            .check_write(index, sub, &value)
            .context(DictionarySnafu)?;
        self.download(index, sub, &value.to_bytes()).await?;
        self.od()
            .update_value(index, sub, value)
            .context(DictionarySnafu)
    }

    /// Write an entry by name
    pub async fn write_by_name(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let (index, sub) = self.od().key_of(name).context(DictionarySnafu)?;
        self.write(index, sub, value).await
    }

    /// The last known value of an entry in the node's dictionary, without bus access
    ///
    /// This is the entry's default until it has been read or written. Returns None when the
    /// dictionary has no such entry.
    pub fn last_known(&self, index: u16, sub: u8) -> Option<Value> {
        self.od().value(index, sub).ok().cloned()
    }

    fn od(&self) -> std::sync::MutexGuard<'_, ObjectDictionary> {
        // A panic while holding the dictionary cannot leave an entry half written
        self.inner
            .od
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    access_methods!(f64);
    access_methods!(f32);
    access_methods!(u64);
    access_methods!(u32);
    access_methods!(u16);
    access_methods!(u8);
    access_methods!(i64);
    access_methods!(i32);
    access_methods!(i16);
    access_methods!(i8);

    /// Write to a TimeOfDay object on the SDO server
    pub async fn write_time_of_day(&self, index: u16, sub: u8, data: TimeOfDay) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Write to a TimeDifference object on the SDO server
    pub async fn write_time_difference(
        &self,
        index: u16,
        sub: u8,
        data: TimeDifference,
    ) -> Result<()> {
        self.download(index, sub, &data.to_le_bytes()).await
    }

    /// Read a TimeOfDay object from the SDO server
    pub async fn read_time_of_day(&self, index: u16, sub: u8) -> Result<TimeOfDay> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; TimeOfDay::SIZE] = data
            .try_into()
            .map_err(|_| SdoClientError::UnexpectedSize)?;
        Ok(TimeOfDay::from_le_bytes(bytes))
    }

    /// Read a TimeDifference object from the SDO server
    pub async fn read_time_difference(&self, index: u16, sub: u8) -> Result<TimeDifference> {
        let data = self.upload(index, sub).await?;
        let bytes: [u8; TimeDifference::SIZE] = data
            .try_into()
            .map_err(|_| SdoClientError::UnexpectedSize)?;
        Ok(TimeDifference::from_le_bytes(bytes))
    }

    /// Read an object as a string
    ///
    /// Invalid UTF-8 is replaced, and the string ends at the first NUL if there is one.
    pub async fn read_utf8(&self, index: u16, sub: u8) -> Result<String> {
        let data = self.upload(index, sub).await?;
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into())
    }

    /// Read the identity object
    ///
    /// All nodes should implement this object
    pub async fn read_identity(&self) -> Result<Identity> {
        Ok(Identity {
            vendor_id: self.upload_u32(object_ids::IDENTITY, 1).await?,
            product_code: self.upload_u32(object_ids::IDENTITY, 2).await?,
            revision: self.upload_u32(object_ids::IDENTITY, 3).await?,
            serial: self.upload_u32(object_ids::IDENTITY, 4).await?,
        })
    }

    /// Read the device name object
    pub async fn read_device_name(&self) -> Result<String> {
        self.read_utf8(object_ids::DEVICE_NAME, 0).await
    }

    /// Write object 0x1010sub1 to command all objects be saved
    pub async fn save_objects(&self) -> Result<()> {
        self.download_u32(object_ids::SAVE_OBJECTS, 1, SAVE_CMD)
            .await
    }

    /// Write object 0x1011sub1 to command all objects be restored to their defaults
    ///
    /// Most devices apply restored values after the next reset.
    pub async fn restore_defaults(&self) -> Result<()> {
        self.download_u32(object_ids::RESTORE_DEFAULTS, 1, LOAD_CMD)
            .await
    }
}

/// An in-flight transfer, holding the node's response queue
///
/// Dropping a transfer before [`Transfer::finish`] (e.g. when the calling future is cancelled)
/// queues an abort frame so the server does not stay mid-transfer.
struct Transfer<'a> {
    shared: &'a Shared,
    rx: MutexGuard<'a, mpsc::UnboundedReceiver<CanMessage>>,
    index: u16,
    sub: u8,
    timeout: Duration,
    finished: bool,
}

impl Drop for Transfer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!(
                "SDO transfer 0x{:04X}sub{} to node {} cancelled",
                self.index,
                self.sub,
                self.shared.node_id
            );
            self.queue_abort(AbortCode::GeneralError);
            self.set_state(TransferState::Aborted);
        }
    }
}

impl Transfer<'_> {
    fn set_state(&self, state: TransferState) {
        if let Ok(mut s) = self.shared.state.lock() {
            *s = state;
        }
    }

    fn queue_abort(&self, code: AbortCode) {
        let msg = CanMessage::new(
            self.shared.req_cob_id,
            &SdoRequest::abort(self.index, self.sub, code).to_bytes(),
        );
        // Nothing to abort on a disconnected bus
        let _ = self.shared.bus.queue(msg);
    }

    /// Record the outcome, sending an abort if the client is the side giving up
    fn finish<T>(mut self, result: &Result<T>) {
        self.finished = true;
        match result {
            Ok(_) => self.set_state(TransferState::Done),
            Err(e) => {
                if let Some(code) = e.client_abort_code() {
                    self.queue_abort(code);
                }
                self.set_state(TransferState::Aborted);
            }
        }
    }

    async fn send(&mut self, data: [u8; 8]) -> Result<()> {
        let frame = CanMessage::new(self.shared.req_cob_id, &data);
        self.shared.bus.send(frame).await.context(BusSnafu)
    }

    async fn recv(&mut self) -> Result<CanMessage> {
        let token = self.shared.bus.session_token().context(BusSnafu)?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        tokio::select! {
            result = tokio::time::timeout_at(deadline, self.rx.recv()) => match result {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(SdoClientError::Bus { source: BusError::Disconnected }),
                Err(_) => NoResponseSnafu.fail(),
            },
            _ = token.cancelled() => Err(SdoClientError::Bus { source: BusError::Disconnected }),
        }
    }

    async fn wait_for_response(&mut self) -> Result<SdoResponse> {
        let msg = self.recv().await?;
        SdoResponse::try_from(msg).map_err(|_| SdoClientError::MalformedResponse)
    }

    /// Receive a block upload segment, or the server's abort
    async fn wait_for_block_segment(&mut self) -> Result<BlockSegment> {
        let msg = self.recv().await?;
        let segment =
            BlockSegment::try_from(msg.data()).map_err(|_| SdoClientError::MalformedResponse)?;
        if segment.seqnum == 0 {
            // Sequence numbers start at 1, so this can only be an abort
            let resp =
                SdoResponse::try_from(msg).map_err(|_| SdoClientError::MalformedResponse)?;
            match_response!(resp, "BlockSegment",);
        }
        Ok(segment)
    }

    fn check_index(&self, index: u16, sub: u8) -> Result<()> {
        if (index, sub) != (self.index, self.sub) {
            return MismatchedObjectIndexSnafu {
                expected: (self.index, self.sub),
                received: (index, sub),
            }
            .fail();
        }
        Ok(())
    }

    async fn download(&mut self, data: &[u8]) -> Result<()> {
        let (index, sub) = (self.index, self.sub);
        if data.len() <= 4 {
            // Do an expedited transfer
            self.send(SdoRequest::expedited_download(index, sub, data).to_bytes())
                .await?;

            let resp = self.wait_for_response().await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index, sub } => {
                    self.check_index(index, sub)
                }
            )
        } else {
            self.send(
                SdoRequest::initiate_download(index, sub, Some(data.len() as u32)).to_bytes(),
            )
            .await?;

            let resp = self.wait_for_response().await?;
            match_response!(
                resp,
                "ConfirmDownload",
                SdoResponse::ConfirmDownload { index, sub } => {
                    self.check_index(index, sub)?
                }
            );
            self.set_state(TransferState::Segmented);

            let mut toggle = false;
            let total_segments = data.len().div_ceil(7);
            for n in 0..total_segments {
                let last_segment = n == total_segments - 1;
                let segment_size = (data.len() - n * 7).min(7);
                let seg_msg = SdoRequest::download_segment(
                    toggle,
                    last_segment,
                    &data[n * 7..n * 7 + segment_size],
                );
                self.send(seg_msg.to_bytes()).await?;
                let resp = self.wait_for_response().await?;
                match_response!(
                    resp,
                    "ConfirmDownloadSegment",
                    SdoResponse::ConfirmDownloadSegment { t } => {
                        if t != toggle {
                            return ToggleNotAlternatedSnafu.fail();
                        }
                    }
                );
                toggle = !toggle;
            }
            Ok(())
        }
    }

    async fn upload(&mut self) -> Result<Vec<u8>> {
        let mut read_buf = Vec::new();

        self.send(SdoRequest::initiate_upload(self.index, self.sub).to_bytes())
            .await?;

        let resp = self.wait_for_response().await?;

        let (expedited, expected_size) = match_response!(
            resp,
            "ConfirmUpload",
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                self.check_index(index, sub)?;
                if e {
                    let len = if s { 4 - n as usize } else { 4 };
                    read_buf.extend_from_slice(&data[0..len]);
                    (true, None)
                } else if s {
                    (false, Some(u32::from_le_bytes(data) as usize))
                } else {
                    (false, None)
                }
            }
        );

        if !expedited {
            self.set_state(TransferState::Segmented);
            let mut toggle = false;
            loop {
                self.send(SdoRequest::upload_segment_request(toggle).to_bytes())
                    .await?;

                let resp = self.wait_for_response().await?;
                match_response!(
                    resp,
                    "UploadSegment",
                    SdoResponse::UploadSegment { t, n, c, data } => {
                        if t != toggle {
                            return ToggleNotAlternatedSnafu.fail();
                        }
                        read_buf.extend_from_slice(&data[0..7 - n as usize]);
                        if c {
                            break;
                        }
                    }
                );
                toggle = !toggle;
            }
            if expected_size.is_some_and(|size| size != read_buf.len()) {
                return UnexpectedSizeSnafu.fail();
            }
        }
        Ok(read_buf)
    }

    async fn block_download(&mut self, data: &[u8]) -> Result<()> {
        self.send(
            SdoRequest::InitiateBlockDownload {
                cc: true,
                s: true,
                index: self.index,
                sub: self.sub,
                size: data.len() as u32,
            }
            .to_bytes(),
        )
        .await?;

        let resp = self.wait_for_response().await?;

        let (crc_enabled, mut blksize) = match_response!(
            resp,
            "ConfirmBlockDownload",
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                self.check_index(index, sub)?;
                (sc, blksize)
            }
        );
        if blksize == 0 || blksize > 127 {
            return BlockSizeChangedTooSmallSnafu.fail();
        }
        self.set_state(TransferState::Block);

        // Even an empty value travels in one segment
        let total_segments = data.len().div_ceil(7).max(1);
        let mut block_start = 0;
        let mut seqnum: u8 = 1;

        loop {
            let segment_num = block_start + seqnum as usize - 1;
            let segment_start = segment_num * 7;
            let segment_len = (data.len() - segment_start).min(7);
            let c = segment_num == total_segments - 1;
            let mut segment_data = [0; 7];
            segment_data[0..segment_len]
                .copy_from_slice(&data[segment_start..segment_start + segment_len]);
            self.send(
                BlockSegment {
                    c,
                    seqnum,
                    data: segment_data,
                }
                .to_bytes(),
            )
            .await?;

            // The server confirms after blksize segments, or after the last one
            if !c && seqnum < blksize {
                seqnum += 1;
                continue;
            }

            let resp = self.wait_for_response().await?;
            match_response!(
                resp,
                "ConfirmBlock",
                SdoResponse::ConfirmBlock {
                    ackseq,
                    blksize: new_blksize,
                } => {
                    if ackseq > seqnum {
                        return InvalidSequenceSnafu.fail();
                    }
                    if new_blksize == 0 || new_blksize > 127 {
                        return BlockSizeChangedTooSmallSnafu.fail();
                    }
                    // Resume after the last segment received in order
                    block_start += ackseq as usize;
                    blksize = new_blksize;
                    seqnum = 1;
                }
            );
            if block_start >= total_segments {
                break;
            }
        }

        let crc = if crc_enabled {
            crc16::State::<crc16::XMODEM>::calculate(data)
        } else {
            0
        };
        let last_len = data.len() - (total_segments - 1) * 7;
        let n = (7 - last_len) as u8;

        self.send(SdoRequest::EndBlockDownload { n, crc }.to_bytes())
            .await?;

        let resp = self.wait_for_response().await?;
        match_response!(
            resp,
            "ConfirmBlockDownloadEnd",
            SdoResponse::ConfirmBlockDownloadEnd => { Ok(()) }
        )
    }

    async fn block_upload(&mut self) -> Result<Vec<u8>> {
        const CRC_SUPPORTED: bool = true;
        const BLKSIZE: u8 = 127;
        const PST: u8 = 0;
        self.send(
            SdoRequest::initiate_block_upload(self.index, self.sub, CRC_SUPPORTED, BLKSIZE, PST)
                .to_bytes(),
        )
        .await?;

        let resp = self.wait_for_response().await?;

        let (server_supports_crc, expected_size) = match_response!(
            resp,
            "ConfirmBlockUpload",
            SdoResponse::ConfirmBlockUpload { sc, s, index, sub, size } => {
                self.check_index(index, sub)?;
                (sc, s.then_some(size as usize))
            }
        );

        self.send(SdoRequest::StartBlockUpload.to_bytes()).await?;
        self.set_state(TransferState::Block);

        let mut rx_data = Vec::new();
        let mut ackseq = 0;
        loop {
            let segment = self.wait_for_block_segment().await?;
            let mut complete = false;
            // Out of order segments are dropped; the acknowledgement makes the server resend them
            if segment.seqnum == ackseq + 1 {
                ackseq = segment.seqnum;
                rx_data.extend_from_slice(&segment.data);
                complete = segment.c;
            }
            if segment.c || segment.seqnum >= BLKSIZE {
                self.send(
                    SdoRequest::ConfirmBlock {
                        ackseq,
                        blksize: BLKSIZE,
                    }
                    .to_bytes(),
                )
                .await?;
                ackseq = 0;
                if complete {
                    break;
                }
            }
        }

        let resp = self.wait_for_response().await?;
        let (n, crc) = match_response!(
            resp,
            "BlockUploadEnd",
            SdoResponse::BlockUploadEnd { n, crc } => {(n, crc)}
        );

        // Drop the n invalid data bytes
        let len = rx_data.len().saturating_sub(n as usize);
        rx_data.truncate(len);

        if expected_size.is_some_and(|size| size != rx_data.len()) {
            return UnexpectedSizeSnafu.fail();
        }
        if server_supports_crc {
            let computed_crc = crc16::State::<crc16::XMODEM>::calculate(&rx_data);
            if crc != computed_crc {
                return CrcMismatchSnafu.fail();
            }
        }

        self.send(SdoRequest::EndBlockUpload.to_bytes()).await?;

        Ok(rx_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_abort_codes_are_kept() {
        assert_eq!(
            RawAbortCode::Valid(AbortCode::NoSuchObject),
            RawAbortCode::from(0x0602_0000)
        );
        assert_eq!(RawAbortCode::Unknown(0x1234_5678), 0x1234_5678.into());
    }

    #[test]
    fn client_side_failures_abort() {
        assert_eq!(
            Some(AbortCode::SdoTimeout),
            SdoClientError::NoResponse.client_abort_code()
        );
        assert_eq!(
            Some(AbortCode::ToggleNotAlternated),
            SdoClientError::ToggleNotAlternated.client_abort_code()
        );
        let server_abort = SdoClientError::ServerAbort {
            index: 0x2000,
            sub: 0,
            abort_code: AbortCode::ReadOnly.into(),
        };
        assert_eq!(None, server_abort.client_abort_code());
    }
}
