/// One (messages, bytes) tally. Bytes count payload length only, never
/// framing overhead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cnt {
    pub msgs: i64,
    pub bytes: i64,
}

impl Cnt {
    fn bump(&mut self, payload_len: usize) {
        self.msgs += 1;
        self.bytes += payload_len as i64;
    }
}

/// Per-connection counters across the four boundaries.
///
/// `from_app`/`to_app` are the application-facing boundary, `to_lower`/
/// `from_lower` the boundary towards the OS (or TLS layer). A message is
/// counted exactly once per boundary, when it has fully crossed it; the
/// app-side and lower-side pairs may differ by what is buffered inside
/// the core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnCnt {
    pub from_app: Cnt,
    pub to_app: Cnt,
    pub from_lower: Cnt,
    pub to_lower: Cnt,
}

impl ConnCnt {
    /// Payload accepted from the application (send has succeeded from the
    /// caller's point of view).
    pub(crate) fn msg_from_app(&mut self, payload_len: usize) {
        self.from_app.bump(payload_len);
    }

    /// Complete frame handed to the OS or TLS layer.
    pub(crate) fn msg_to_lower(&mut self, payload_len: usize) {
        self.to_lower.bump(payload_len);
    }

    /// Complete message delivered to the application. The lower-boundary
    /// counter moves at the same time: delivery is when the reassembled
    /// message leaves the core.
    pub(crate) fn msg_to_app(&mut self, payload_len: usize) {
        self.from_lower.bump(payload_len);
        self.to_app.bump(payload_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_payload_bytes() {
        let mut cnt = ConnCnt::default();
        cnt.msg_from_app(100);
        cnt.msg_to_lower(100);
        cnt.msg_from_app(5);

        assert_eq!(cnt.from_app, Cnt { msgs: 2, bytes: 105 });
        assert_eq!(cnt.to_lower, Cnt { msgs: 1, bytes: 100 });
        assert!(cnt.from_app.msgs >= cnt.to_lower.msgs);

        cnt.msg_to_app(42);
        assert_eq!(cnt.to_app, cnt.from_lower);
    }
}
