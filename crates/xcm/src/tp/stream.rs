//! Framed-stream engine.
//!
//! Turns a reliable, non-blocking byte stream into a message-preserving
//! channel. Each frame is a 4-byte big-endian payload length followed by
//! that many payload bytes; payload lengths outside `1..=max_msg` are
//! protocol violations.
//!
//! The engine is generic over `Read + Write`, so the TCP and TLS
//! transports share it and tests can drive it with a scripted in-memory
//! channel.

use std::io::{self, Read, Write};

use tracing::debug;

use crate::error::{Error, Result};

pub(crate) const HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    /// Collecting the 4-byte length header.
    Header,
    /// Collecting the payload.
    Body,
    /// A complete message is buffered, waiting for a `receive` call.
    Ready,
}

/// Outcome of driving the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvStatus {
    /// A complete message is buffered.
    MsgReady,
    /// Stream exhausted for now; more bytes needed.
    Pending,
    /// Peer closed cleanly on a frame boundary.
    Eof,
}

pub(crate) struct FramedSession {
    max_msg: usize,

    header: [u8; HEADER_SIZE],
    header_have: usize,
    recv_buf: Vec<u8>,
    recv_len: usize,
    recv_have: usize,
    phase: RecvPhase,

    /// Header plus payload of the single in-flight outbound frame;
    /// empty when no send is in progress.
    send_buf: Vec<u8>,
    send_off: usize,
    send_payload: usize,

    /// Sticky protocol-violation state.
    bad: Option<Error>,
}

impl FramedSession {
    pub(crate) fn new(max_msg: usize) -> Self {
        Self {
            max_msg,
            header: [0; HEADER_SIZE],
            header_have: 0,
            recv_buf: Vec::new(),
            recv_len: 0,
            recv_have: 0,
            phase: RecvPhase::Header,
            send_buf: Vec::new(),
            send_off: 0,
            send_payload: 0,
            bad: None,
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        match &self.bad {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.bad = Some(err.clone());
        err
    }

    pub(crate) fn sending(&self) -> bool {
        !self.send_buf.is_empty()
    }

    pub(crate) fn msg_ready(&self) -> bool {
        self.phase == RecvPhase::Ready
    }

    /// A frame has been started but not completed. Finishing it is
    /// background work, independent of the application's conditions.
    pub(crate) fn recv_in_progress(&self) -> bool {
        match self.phase {
            RecvPhase::Header => self.header_have > 0,
            RecvPhase::Body => true,
            RecvPhase::Ready => false,
        }
    }

    /// Accept a payload into the send buffer. The caller-visible send has
    /// succeeded once this returns `Ok`; the frame drains to the lower
    /// layer in subsequent drive calls.
    pub(crate) fn enqueue(&mut self, payload: &[u8]) -> Result<()> {
        self.check()?;
        if payload.is_empty() {
            return Err(Error::InvalidInput("zero-length message".into()));
        }
        if payload.len() > self.max_msg {
            return Err(Error::CapacityExceeded);
        }
        if self.sending() {
            return Err(Error::WouldBlock);
        }

        self.send_buf.reserve(HEADER_SIZE + payload.len());
        self.send_buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.send_buf.extend_from_slice(payload);
        self.send_off = 0;
        self.send_payload = payload.len();
        Ok(())
    }

    /// Push buffered frame bytes into `w` until drained or blocked.
    /// Returns the payload length when the frame fully drained.
    pub(crate) fn drive_send<W: Write>(&mut self, w: &mut W) -> Result<Option<usize>> {
        self.check()?;
        while self.send_off < self.send_buf.len() {
            match w.write(&self.send_buf[self.send_off..]) {
                Ok(0) => return Err(self.fail(Error::ConnectionReset)),
                Ok(n) => self.send_off += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(Error::from_io(&e))),
            }
        }

        if self.send_buf.is_empty() {
            return Ok(None);
        }
        self.send_buf.clear();
        self.send_off = 0;
        Ok(Some(self.send_payload))
    }

    /// Pull bytes from `r` until a complete message is buffered or the
    /// stream has nothing more to give.
    pub(crate) fn drive_recv<R: Read>(&mut self, r: &mut R) -> Result<RecvStatus> {
        self.check()?;
        loop {
            match self.phase {
                RecvPhase::Ready => return Ok(RecvStatus::MsgReady),

                RecvPhase::Header => {
                    match r.read(&mut self.header[self.header_have..]) {
                        Ok(0) => {
                            if self.header_have == 0 {
                                return Ok(RecvStatus::Eof);
                            }
                            // Peer went away in the middle of a frame.
                            return Err(self.fail(Error::ConnectionReset));
                        }
                        Ok(n) => {
                            self.header_have += n;
                            if self.header_have == HEADER_SIZE {
                                let len = u32::from_be_bytes(self.header) as usize;
                                if len == 0 || len > self.max_msg {
                                    debug!(len, max_msg = self.max_msg, "invalid frame length");
                                    return Err(self.fail(Error::ProtocolError(format!(
                                        "frame length {len} outside 1..={}",
                                        self.max_msg
                                    ))));
                                }
                                self.recv_buf.resize(len, 0);
                                self.recv_len = len;
                                self.recv_have = 0;
                                self.phase = RecvPhase::Body;
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(RecvStatus::Pending);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(self.fail(Error::from_io(&e))),
                    }
                }

                RecvPhase::Body => {
                    match r.read(&mut self.recv_buf[self.recv_have..self.recv_len]) {
                        Ok(0) => return Err(self.fail(Error::ConnectionReset)),
                        Ok(n) => {
                            self.recv_have += n;
                            if self.recv_have == self.recv_len {
                                self.phase = RecvPhase::Ready;
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(RecvStatus::Pending);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(self.fail(Error::from_io(&e))),
                    }
                }
            }
        }
    }

    /// Copy the buffered message out, truncating to the caller's
    /// capacity, and reset for the next frame. Returns the payload
    /// length actually copied.
    pub(crate) fn take_msg(&mut self, out: &mut [u8]) -> usize {
        debug_assert!(self.msg_ready());
        let n = self.recv_len.min(out.len());
        out[..n].copy_from_slice(&self.recv_buf[..n]);
        self.phase = RecvPhase::Header;
        self.header_have = 0;
        self.recv_have = 0;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte channel with scripted read chunks and a per-call write cap.
    struct ScriptedIo {
        incoming: Vec<u8>,
        read_pos: usize,
        read_chunk: usize,
        eof: bool,
        written: Vec<u8>,
        write_cap: usize,
    }

    impl ScriptedIo {
        fn new() -> Self {
            Self {
                incoming: Vec::new(),
                read_pos: 0,
                read_chunk: usize::MAX,
                eof: false,
                written: Vec::new(),
                write_cap: usize::MAX,
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.incoming.extend_from_slice(bytes);
        }
    }

    impl Read for ScriptedIo {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pending = self.incoming.len() - self.read_pos;
            if pending == 0 {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = pending.min(buf.len()).min(self.read_chunk);
            buf[..n].copy_from_slice(&self.incoming[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Write for ScriptedIo {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_cap == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_cap);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut f = (payload.len() as u32).to_be_bytes().to_vec();
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn send_produces_length_prefixed_frame() {
        let mut io = ScriptedIo::new();
        let mut s = FramedSession::new(64);

        s.enqueue(b"hello").unwrap();
        assert!(s.sending());
        assert_eq!(s.drive_send(&mut io).unwrap(), Some(5));
        assert!(!s.sending());
        assert_eq!(io.written, frame(b"hello"));
    }

    #[test]
    fn one_byte_writes_still_deliver() {
        let mut io = ScriptedIo::new();
        io.write_cap = 1;
        let mut s = FramedSession::new(64);

        s.enqueue(b"abc").unwrap();
        let mut drained = None;
        for _ in 0..frame(b"abc").len() {
            drained = s.drive_send(&mut io).unwrap();
            if drained.is_some() {
                break;
            }
        }
        assert_eq!(drained, Some(3));
        assert_eq!(io.written, frame(b"abc"));
    }

    #[test]
    fn second_send_blocks_while_frame_in_flight() {
        let mut io = ScriptedIo::new();
        io.write_cap = 0;
        let mut s = FramedSession::new(64);

        s.enqueue(b"first").unwrap();
        assert_eq!(s.drive_send(&mut io).unwrap(), None);
        assert_eq!(s.enqueue(b"second"), Err(Error::WouldBlock));

        io.write_cap = usize::MAX;
        assert_eq!(s.drive_send(&mut io).unwrap(), Some(5));
        s.enqueue(b"second").unwrap();
    }

    #[test]
    fn rejects_empty_and_oversized_payloads() {
        let mut s = FramedSession::new(8);
        assert!(matches!(s.enqueue(b""), Err(Error::InvalidInput(_))));
        assert_eq!(s.enqueue(&[0u8; 9]), Err(Error::CapacityExceeded));
        // The session stays usable after a rejected send.
        s.enqueue(&[0u8; 8]).unwrap();
    }

    #[test]
    fn receives_message_from_single_read() {
        let mut io = ScriptedIo::new();
        io.feed(&frame(b"payload"));
        let mut s = FramedSession::new(64);

        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::MsgReady);
        let mut out = [0u8; 64];
        assert_eq!(s.take_msg(&mut out), 7);
        assert_eq!(&out[..7], b"payload");
        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::Pending);
    }

    #[test]
    fn header_split_across_reads_is_equivalent() {
        let mut io = ScriptedIo::new();
        io.read_chunk = 2;
        io.feed(&frame(b"xy"));
        let mut s = FramedSession::new(64);

        // 2-byte chunks: two reads for the header, one for the payload.
        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::MsgReady);
        let mut out = [0u8; 8];
        assert_eq!(s.take_msg(&mut out), 2);
        assert_eq!(&out[..2], b"xy");
    }

    #[test]
    fn oversized_frame_marks_session_bad() {
        let mut io = ScriptedIo::new();
        io.feed(&9u32.to_be_bytes());
        let mut s = FramedSession::new(8);

        assert!(matches!(s.drive_recv(&mut io), Err(Error::ProtocolError(_))));
        // Sticky: both directions now report the violation.
        assert!(matches!(s.drive_recv(&mut io), Err(Error::ProtocolError(_))));
        assert!(matches!(s.enqueue(b"x"), Err(Error::ProtocolError(_))));
    }

    #[test]
    fn zero_length_frame_is_a_protocol_error() {
        let mut io = ScriptedIo::new();
        io.feed(&0u32.to_be_bytes());
        let mut s = FramedSession::new(8);
        assert!(matches!(s.drive_recv(&mut io), Err(Error::ProtocolError(_))));
    }

    #[test]
    fn eof_mid_frame_is_connection_reset() {
        let mut io = ScriptedIo::new();
        io.feed(&frame(b"abcdef")[..7]);
        io.eof = true;
        let mut s = FramedSession::new(64);

        assert_eq!(s.drive_recv(&mut io), Err(Error::ConnectionReset));
        assert_eq!(s.check(), Err(Error::ConnectionReset));
    }

    #[test]
    fn eof_on_frame_boundary_is_clean() {
        let mut io = ScriptedIo::new();
        io.feed(&frame(b"last"));
        io.eof = true;
        let mut s = FramedSession::new(64);

        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::MsgReady);
        let mut out = [0u8; 8];
        s.take_msg(&mut out);
        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::Eof);
    }

    #[test]
    fn take_msg_truncates_to_capacity() {
        let mut io = ScriptedIo::new();
        io.feed(&frame(b"0123456789"));
        let mut s = FramedSession::new(64);

        assert_eq!(s.drive_recv(&mut io).unwrap(), RecvStatus::MsgReady);
        let mut out = [0u8; 4];
        assert_eq!(s.take_msg(&mut out), 4);
        assert_eq!(&out, b"0123");
    }
}
