//! SDO server state machine used by [`LocalNode`](crate::LocalNode)
//!
//! The server is synchronous: each request frame is handled against the object dictionary and
//! produces zero or more response frames. Block uploads produce a whole block of segments at once.

use canmaster_common::{
    objects::ObjectDictionary,
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
};

/// Largest block the server accepts or sends, in segments
const MAX_BLKSIZE: u8 = 127;

#[derive(Clone, Debug, Default, PartialEq)]
enum ServerState {
    #[default]
    Idle,
    Download {
        index: u16,
        sub: u8,
        toggle: bool,
        size: Option<usize>,
        buf: Vec<u8>,
    },
    Upload {
        index: u16,
        sub: u8,
        toggle: bool,
        data: Vec<u8>,
        pos: usize,
    },
    BlockDownload {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        size: Option<usize>,
        ackseq: u8,
        buf: Vec<u8>,
    },
    BlockDownloadEnd {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        size: Option<usize>,
        buf: Vec<u8>,
    },
    BlockUploadInit {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        blksize: u8,
        data: Vec<u8>,
    },
    BlockUpload {
        index: u16,
        sub: u8,
        crc_enabled: bool,
        blksize: u8,
        data: Vec<u8>,
        /// Segments acknowledged so far
        acked: usize,
        /// Segments sent in the current block
        sent: u8,
    },
    BlockUploadEnd,
}

fn store(od: &mut ObjectDictionary, index: u16, sub: u8, bytes: &[u8]) -> Result<(), AbortCode> {
    od.write_bytes(index, sub, bytes)
        .map(|_| ())
        .map_err(|e| e.abort_code())
}

/// Result of handling one request
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ServerOutput {
    /// Frames to send on the SDO response COB-ID, in order
    pub responses: Vec<[u8; 8]>,
    /// Entry stored by this request, if any
    pub written: Option<(u16, u8)>,
}

impl ServerOutput {
    fn respond(resp: SdoResponse) -> Self {
        Self {
            responses: vec![resp.to_bytes()],
            written: None,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// An SDO server serving one object dictionary
#[derive(Debug, Default)]
pub(crate) struct SdoServer {
    state: ServerState,
}

impl SdoServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any transfer in progress
    pub fn reset(&mut self) {
        self.state = ServerState::Idle;
    }

    /// True while a transfer is in progress
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.state != ServerState::Idle
    }

    /// Handle a request frame's data bytes
    pub fn handle(&mut self, data: &[u8], od: &mut ObjectDictionary) -> ServerOutput {
        if data.len() != 8 {
            return ServerOutput::none();
        }
        if matches!(self.state, ServerState::BlockDownload { .. }) {
            // Seqnum 0 is not a valid segment, so 0x80 here can only be an abort
            if data[0] & 0x7F == 0 {
                if let Ok(SdoRequest::Abort { .. }) = SdoRequest::try_from(data) {
                    self.state = ServerState::Idle;
                }
                return ServerOutput::none();
            }
            return match BlockSegment::try_from(data) {
                Ok(segment) => self.block_segment(segment),
                Err(_) => ServerOutput::none(),
            };
        }

        let req = match SdoRequest::try_from(data) {
            Ok(req) => req,
            Err(_) => return self.abort(0, 0, AbortCode::InvalidCommandSpecifier),
        };

        match req {
            SdoRequest::Abort { .. } => {
                self.state = ServerState::Idle;
                ServerOutput::none()
            }
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => self.initiate_download(od, index, sub, n, e, s, data),
            SdoRequest::DownloadSegment { t, n, c, data } => {
                self.download_segment(od, t, n, c, &data)
            }
            SdoRequest::InitiateUpload { index, sub } => self.initiate_upload(od, index, sub),
            SdoRequest::ReqUploadSegment { t } => self.upload_segment(t),
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => self.initiate_block_download(od, index, sub, cc, s.then_some(size as usize)),
            SdoRequest::EndBlockDownload { n, crc } => self.end_block_download(od, n, crc),
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst: _,
            } => self.initiate_block_upload(od, index, sub, cc, blksize),
            SdoRequest::StartBlockUpload => self.start_block_upload(),
            SdoRequest::ConfirmBlock { ackseq, blksize } => self.confirm_block(ackseq, blksize),
            SdoRequest::EndBlockUpload => {
                if self.state == ServerState::BlockUploadEnd {
                    self.state = ServerState::Idle;
                    ServerOutput::none()
                } else {
                    self.abort(0, 0, AbortCode::InvalidCommandSpecifier)
                }
            }
        }
    }

    fn abort(&mut self, index: u16, sub: u8, code: AbortCode) -> ServerOutput {
        self.state = ServerState::Idle;
        ServerOutput::respond(SdoResponse::abort(index, sub, code))
    }

    fn current_index(&self) -> (u16, u8) {
        match &self.state {
            ServerState::Download { index, sub, .. }
            | ServerState::Upload { index, sub, .. }
            | ServerState::BlockDownload { index, sub, .. }
            | ServerState::BlockDownloadEnd { index, sub, .. }
            | ServerState::BlockUploadInit { index, sub, .. }
            | ServerState::BlockUpload { index, sub, .. } => (*index, *sub),
            ServerState::Idle | ServerState::BlockUploadEnd => (0, 0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn initiate_download(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub: u8,
        n: u8,
        e: bool,
        s: bool,
        data: [u8; 4],
    ) -> ServerOutput {
        if let Err(err) = od.get(index, sub) {
            return self.abort(index, sub, err.abort_code());
        }
        if e {
            let len = if s {
                4 - n as usize
            } else {
                // Without a size, the entry type decides how many bytes are meaningful
                od.get(index, sub)
                    .ok()
                    .and_then(|entry| entry.data_type.size())
                    .unwrap_or(4)
                    .min(4)
            };
            return match store(od, index, sub, &data[..len]) {
                Ok(()) => {
                    self.state = ServerState::Idle;
                    ServerOutput {
                        responses: vec![SdoResponse::download_acknowledge(index, sub).to_bytes()],
                        written: Some((index, sub)),
                    }
                }
                Err(code) => self.abort(index, sub, code),
            };
        }
        self.state = ServerState::Download {
            index,
            sub,
            toggle: false,
            size: s.then_some(u32::from_le_bytes(data) as usize),
            buf: Vec::new(),
        };
        ServerOutput::respond(SdoResponse::download_acknowledge(index, sub))
    }

    fn download_segment(
        &mut self,
        od: &mut ObjectDictionary,
        t: bool,
        n: u8,
        c: bool,
        data: &[u8; 7],
    ) -> ServerOutput {
        let ServerState::Download {
            index,
            sub,
            toggle,
            size,
            buf,
        } = &mut self.state
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        let (index, sub) = (*index, *sub);
        if t != *toggle {
            return self.abort(index, sub, AbortCode::ToggleNotAlternated);
        }
        *toggle = !*toggle;
        buf.extend_from_slice(&data[..7 - (n as usize).min(7)]);
        if !c {
            return ServerOutput::respond(SdoResponse::download_segment_acknowledge(t));
        }

        let size = *size;
        let buf = std::mem::take(buf);
        if size.is_some_and(|size| size != buf.len()) {
            return self.abort(index, sub, AbortCode::DataTypeMismatch);
        }
        match store(od, index, sub, &buf) {
            Ok(()) => {
                self.state = ServerState::Idle;
                ServerOutput {
                    responses: vec![SdoResponse::download_segment_acknowledge(t).to_bytes()],
                    written: Some((index, sub)),
                }
            }
            Err(code) => self.abort(index, sub, code),
        }
    }

    fn initiate_upload(&mut self, od: &ObjectDictionary, index: u16, sub: u8) -> ServerOutput {
        let data = match od.read_bytes(index, sub) {
            Ok(data) => data,
            Err(e) => return self.abort(index, sub, e.abort_code()),
        };
        if data.len() <= 4 {
            self.state = ServerState::Idle;
            return ServerOutput::respond(SdoResponse::expedited_upload(index, sub, &data));
        }
        let size = data.len() as u32;
        self.state = ServerState::Upload {
            index,
            sub,
            toggle: false,
            data,
            pos: 0,
        };
        ServerOutput::respond(SdoResponse::upload_acknowledge(index, sub, size))
    }

    fn upload_segment(&mut self, t: bool) -> ServerOutput {
        let ServerState::Upload {
            index,
            sub,
            toggle,
            data,
            pos,
        } = &mut self.state
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        if t != *toggle {
            let (index, sub) = (*index, *sub);
            return self.abort(index, sub, AbortCode::ToggleNotAlternated);
        }
        *toggle = !*toggle;
        let len = (data.len() - *pos).min(7);
        let chunk = &data[*pos..*pos + len];
        *pos += len;
        let c = *pos >= data.len();
        let resp = SdoResponse::upload_segment(t, c, chunk);
        if c {
            self.state = ServerState::Idle;
        }
        ServerOutput::respond(resp)
    }

    fn initiate_block_download(
        &mut self,
        od: &ObjectDictionary,
        index: u16,
        sub: u8,
        cc: bool,
        size: Option<usize>,
    ) -> ServerOutput {
        match od.get(index, sub) {
            Ok(entry) if !entry.access.is_writable() => {
                return self.abort(index, sub, AbortCode::ReadOnly)
            }
            Ok(_) => (),
            Err(e) => return self.abort(index, sub, e.abort_code()),
        }
        self.state = ServerState::BlockDownload {
            index,
            sub,
            crc_enabled: cc,
            size,
            ackseq: 0,
            buf: Vec::new(),
        };
        ServerOutput::respond(SdoResponse::ConfirmBlockDownload {
            sc: true,
            index,
            sub,
            blksize: MAX_BLKSIZE,
        })
    }

    fn block_segment(&mut self, segment: BlockSegment) -> ServerOutput {
        let ServerState::BlockDownload {
            index,
            sub,
            crc_enabled,
            size,
            ackseq,
            buf,
        } = &mut self.state
        else {
            return ServerOutput::none();
        };
        let mut complete = false;
        // Segments after a gap are dropped and re-requested through ackseq
        if segment.seqnum == *ackseq + 1 {
            *ackseq = segment.seqnum;
            buf.extend_from_slice(&segment.data);
            complete = segment.c;
        }
        if !segment.c && segment.seqnum < MAX_BLKSIZE {
            return ServerOutput::none();
        }
        let resp = SdoResponse::ConfirmBlock {
            ackseq: *ackseq,
            blksize: MAX_BLKSIZE,
        };
        *ackseq = 0;
        if complete {
            self.state = ServerState::BlockDownloadEnd {
                index: *index,
                sub: *sub,
                crc_enabled: *crc_enabled,
                size: *size,
                buf: std::mem::take(buf),
            };
        }
        ServerOutput::respond(resp)
    }

    fn end_block_download(&mut self, od: &mut ObjectDictionary, n: u8, crc: u16) -> ServerOutput {
        let ServerState::BlockDownloadEnd {
            index,
            sub,
            crc_enabled,
            size,
            buf,
        } = std::mem::take(&mut self.state)
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        let mut buf = buf;
        buf.truncate(buf.len().saturating_sub(n as usize));
        if size.is_some_and(|size| size != buf.len()) {
            return self.abort(index, sub, AbortCode::DataTypeMismatch);
        }
        if crc_enabled && crc16::State::<crc16::XMODEM>::calculate(&buf) != crc {
            return self.abort(index, sub, AbortCode::CrcError);
        }
        match store(od, index, sub, &buf) {
            Ok(()) => ServerOutput {
                responses: vec![SdoResponse::ConfirmBlockDownloadEnd.to_bytes()],
                written: Some((index, sub)),
            },
            Err(code) => self.abort(index, sub, code),
        }
    }

    fn initiate_block_upload(
        &mut self,
        od: &ObjectDictionary,
        index: u16,
        sub: u8,
        cc: bool,
        blksize: u8,
    ) -> ServerOutput {
        if blksize == 0 || blksize > MAX_BLKSIZE {
            return self.abort(index, sub, AbortCode::InvalidBlockSize);
        }
        let data = match od.read_bytes(index, sub) {
            Ok(data) => data,
            Err(e) => return self.abort(index, sub, e.abort_code()),
        };
        let size = data.len() as u32;
        self.state = ServerState::BlockUploadInit {
            index,
            sub,
            crc_enabled: cc,
            blksize,
            data,
        };
        ServerOutput::respond(SdoResponse::ConfirmBlockUpload {
            sc: true,
            s: true,
            index,
            sub,
            size,
        })
    }

    fn start_block_upload(&mut self) -> ServerOutput {
        let ServerState::BlockUploadInit {
            index,
            sub,
            crc_enabled,
            blksize,
            data,
        } = std::mem::take(&mut self.state)
        else {
            return self.abort(0, 0, AbortCode::InvalidCommandSpecifier);
        };
        self.state = ServerState::BlockUpload {
            index,
            sub,
            crc_enabled,
            blksize,
            data,
            acked: 0,
            sent: 0,
        };
        self.send_block()
    }

    /// Emit the next block of upload segments
    fn send_block(&mut self) -> ServerOutput {
        let ServerState::BlockUpload {
            blksize,
            data,
            acked,
            sent,
            ..
        } = &mut self.state
        else {
            return ServerOutput::none();
        };
        let total_segments = data.len().div_ceil(7).max(1);
        let mut responses = Vec::new();
        *sent = 0;
        while *sent < *blksize && *acked + (*sent as usize) < total_segments {
            let segment_num = *acked + *sent as usize;
            let start = segment_num * 7;
            let len = (data.len() - start).min(7);
            let mut segment_data = [0; 7];
            segment_data[..len].copy_from_slice(&data[start..start + len]);
            *sent += 1;
            responses.push(
                BlockSegment {
                    c: segment_num == total_segments - 1,
                    seqnum: *sent,
                    data: segment_data,
                }
                .to_bytes(),
            );
        }
        ServerOutput {
            responses,
            written: None,
        }
    }

    fn confirm_block(&mut self, ackseq: u8, new_blksize: u8) -> ServerOutput {
        let (index, sub) = self.current_index();
        let ServerState::BlockUpload {
            crc_enabled,
            blksize,
            data,
            acked,
            sent,
            ..
        } = &mut self.state
        else {
            return self.abort(index, sub, AbortCode::InvalidCommandSpecifier);
        };
        if ackseq > *sent {
            return self.abort(index, sub, AbortCode::InvalidSequenceNumber);
        }
        if new_blksize == 0 || new_blksize > MAX_BLKSIZE {
            return self.abort(index, sub, AbortCode::InvalidBlockSize);
        }
        *acked += ackseq as usize;
        *blksize = new_blksize;
        let total_segments = data.len().div_ceil(7).max(1);
        if *acked < total_segments {
            return self.send_block();
        }
        let last_len = data.len() - (total_segments - 1) * 7;
        let crc = if *crc_enabled {
            crc16::State::<crc16::XMODEM>::calculate(data)
        } else {
            0
        };
        self.state = ServerState::BlockUploadEnd;
        ServerOutput::respond(SdoResponse::BlockUploadEnd {
            n: (7 - last_len) as u8,
            crc,
        })
    }
}

#[cfg(test)]
mod tests {
    use canmaster_common::objects::{AccessType, ObjectEntry, Value};

    use super::*;

    fn od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(ObjectEntry::new(0x2000, 0, "Counter", 0u32));
        od.insert(ObjectEntry::new(0x2001, 0, "Name", "initial"));
        od.insert(ObjectEntry::new(0x2002, 0, "Fixed", 7u8).access(AccessType::Ro));
        od
    }

    fn response(out: &ServerOutput) -> SdoResponse {
        assert_eq!(1, out.responses.len());
        SdoResponse::try_from(&out.responses[0][..]).unwrap()
    }

    #[test]
    fn expedited_write_and_read() {
        let mut od = od();
        let mut server = SdoServer::new();
        let out = server.handle(
            &SdoRequest::expedited_download(0x2000, 0, &0x1234u32.to_le_bytes()).to_bytes(),
            &mut od,
        );
        assert_eq!(SdoResponse::download_acknowledge(0x2000, 0), response(&out));
        assert_eq!(Some((0x2000, 0)), out.written);
        assert_eq!(&Value::U32(0x1234), od.value(0x2000, 0).unwrap());

        let out = server.handle(&SdoRequest::initiate_upload(0x2000, 0).to_bytes(), &mut od);
        assert_eq!(
            SdoResponse::expedited_upload(0x2000, 0, &0x1234u32.to_le_bytes()),
            response(&out)
        );
        assert!(!server.is_busy());
    }

    #[test]
    fn read_only_write_aborts() {
        let mut od = od();
        let mut server = SdoServer::new();
        let out = server.handle(
            &SdoRequest::expedited_download(0x2002, 0, &[1]).to_bytes(),
            &mut od,
        );
        assert_eq!(
            SdoResponse::abort(0x2002, 0, AbortCode::ReadOnly),
            response(&out)
        );
        assert_eq!(None, out.written);
    }

    #[test]
    fn segmented_download_checks_toggle() {
        let mut od = od();
        let mut server = SdoServer::new();
        server.handle(
            &SdoRequest::initiate_download(0x2001, 0, Some(10)).to_bytes(),
            &mut od,
        );
        let out = server.handle(
            &SdoRequest::download_segment(false, false, b"abcdefg").to_bytes(),
            &mut od,
        );
        assert_eq!(
            SdoResponse::download_segment_acknowledge(false),
            response(&out)
        );
        // Repeating the toggle value is a protocol error
        let out = server.handle(
            &SdoRequest::download_segment(false, true, b"hij").to_bytes(),
            &mut od,
        );
        assert_eq!(
            SdoResponse::abort(0x2001, 0, AbortCode::ToggleNotAlternated),
            response(&out)
        );
        assert!(!server.is_busy());
        assert_eq!(
            &Value::VisibleString("initial".into()),
            od.value(0x2001, 0).unwrap()
        );
    }

    #[test]
    fn block_upload_sends_whole_block() {
        let mut od = od();
        od.set_value(0x2001, 0, Value::VisibleString("0123456789ABCDEFGHIJ".into()))
            .unwrap();
        let mut server = SdoServer::new();
        let out = server.handle(
            &SdoRequest::initiate_block_upload(0x2001, 0, true, 127, 0).to_bytes(),
            &mut od,
        );
        assert!(matches!(
            response(&out),
            SdoResponse::ConfirmBlockUpload { size: 20, .. }
        ));
        let out = server.handle(&SdoRequest::StartBlockUpload.to_bytes(), &mut od);
        assert_eq!(3, out.responses.len());
        let last = BlockSegment::try_from(&out.responses[2][..]).unwrap();
        assert!(last.c);
        assert_eq!(3, last.seqnum);

        let out = server.handle(
            &SdoRequest::ConfirmBlock {
                ackseq: 3,
                blksize: 127,
            }
            .to_bytes(),
            &mut od,
        );
        let expected_crc = crc16::State::<crc16::XMODEM>::calculate(b"0123456789ABCDEFGHIJ");
        assert_eq!(
            SdoResponse::BlockUploadEnd {
                n: 1,
                crc: expected_crc
            },
            response(&out)
        );
        let out = server.handle(&SdoRequest::EndBlockUpload.to_bytes(), &mut od);
        assert!(out.responses.is_empty());
        assert!(!server.is_busy());
    }
}
