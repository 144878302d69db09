//! Delivery of decoded messages.
//!
//! The decoder announces a message through [`MessageSink::open`] before any
//! of its content, streams default-section bytes through
//! [`MessageSink::content`], and finishes with [`MessageSink::close`].  A
//! sink runs inline on the decoding thread; a slow sink stalls decoding.
//!
//! [`Collector`] keeps everything in memory.  [`channel`] hands events to
//! another thread over a zero-capacity (rendezvous) channel: every send
//! blocks until the consumer takes it, and dropping the sink ends the
//! stream for the consumer.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, SyncSender};

use serde::Serialize;

use super::{CodecError, HEADER_CONTENT_TYPE, HEADER_FILENAME};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumStatus {
    /// No checksum section arrived.
    #[default]
    Absent,
    Match { crc32: u32 },
    Mismatch { expected: u32, actual: u32 },
    /// Checksum section did not hold exactly four bytes.
    Malformed,
}

/// Everything known about a message once it is closed, except its content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    pub id:           usize,
    pub headers:      BTreeMap<String, String>,
    pub checksum:     ChecksumStatus,
    pub header_error: Option<String>,
    /// False when the message was cut off by end of transmission, decoder
    /// close or a decode error instead of an end-of-message marker.
    pub complete:     bool,
    pub content_len:  usize,
}

impl MessageInfo {
    /// True only when a checksum was received and matches the content.
    pub fn verify_checksum(&self) -> bool {
        matches!(self.checksum, ChecksumStatus::Match { .. })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(HEADER_CONTENT_TYPE).map(String::as_str)
    }

    pub fn filename(&self) -> Option<&str> {
        self.headers.get(HEADER_FILENAME).map(String::as_str)
    }
}

pub trait MessageSink {
    fn open(&mut self, id: usize) -> Result<(), CodecError>;

    /// Header section parsed.  Arrives before the content it describes.
    fn headers(&mut self, _id: usize, _headers: &BTreeMap<String, String>) -> Result<(), CodecError> {
        Ok(())
    }

    fn content(&mut self, id: usize, data: &[u8]) -> Result<(), CodecError>;
    fn close(&mut self, info: MessageInfo) -> Result<(), CodecError>;

    /// No more messages will follow.
    fn finish(&mut self) {}
}

impl<S: MessageSink + ?Sized> MessageSink for &mut S {
    fn open(&mut self, id: usize) -> Result<(), CodecError> { (**self).open(id) }
    fn headers(&mut self, id: usize, headers: &BTreeMap<String, String>) -> Result<(), CodecError> {
        (**self).headers(id, headers)
    }
    fn content(&mut self, id: usize, data: &[u8]) -> Result<(), CodecError> { (**self).content(id, data) }
    fn close(&mut self, info: MessageInfo) -> Result<(), CodecError> { (**self).close(info) }
    fn finish(&mut self) { (**self).finish() }
}

// ── Collector ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub info:    MessageInfo,
    pub content: Vec<u8>,
}

impl ReceivedMessage {
    pub fn headers(&self) -> &BTreeMap<String, String> { &self.info.headers }
    pub fn content(&self) -> &[u8] { &self.content }
    pub fn verify_checksum(&self) -> bool { self.info.verify_checksum() }
    pub fn is_complete(&self) -> bool { self.info.complete }

    /// Content as a byte stream.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.content.as_slice())
    }
}

/// Sink that keeps every message in memory, in arrival order.
#[derive(Debug, Default)]
pub struct Collector {
    done:     Vec<ReceivedMessage>,
    current:  Option<ReceivedMessage>,
    finished: bool,
}

impl Collector {
    pub fn new() -> Self { Self::default() }

    /// Closed messages.
    pub fn messages(&self) -> &[ReceivedMessage] { &self.done }

    pub fn into_messages(self) -> Vec<ReceivedMessage> { self.done }

    pub fn is_finished(&self) -> bool { self.finished }
}

impl MessageSink for Collector {
    fn open(&mut self, id: usize) -> Result<(), CodecError> {
        self.current = Some(ReceivedMessage {
            info: MessageInfo { id, ..MessageInfo::default() },
            content: Vec::new(),
        });
        Ok(())
    }

    fn headers(&mut self, _id: usize, headers: &BTreeMap<String, String>) -> Result<(), CodecError> {
        if let Some(m) = &mut self.current {
            m.info.headers = headers.clone();
        }
        Ok(())
    }

    fn content(&mut self, _id: usize, data: &[u8]) -> Result<(), CodecError> {
        if let Some(m) = &mut self.current {
            m.content.extend_from_slice(data);
        }
        Ok(())
    }

    fn close(&mut self, info: MessageInfo) -> Result<(), CodecError> {
        let content = self.current.take().map(|m| m.content).unwrap_or_default();
        self.done.push(ReceivedMessage { info, content });
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

// ── Rendezvous channel ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(usize),
    Headers(usize, BTreeMap<String, String>),
    Content(usize, Vec<u8>),
    Closed(MessageInfo),
}

pub struct ChannelSink {
    tx: Option<SyncSender<Event>>,
}

/// Rendezvous sink and the receiving end for a consumer thread.
pub fn channel() -> (ChannelSink, Receiver<Event>) {
    let (tx, rx) = mpsc::sync_channel(0);
    (ChannelSink { tx: Some(tx) }, rx)
}

impl ChannelSink {
    fn send(&self, event: Event) -> Result<(), CodecError> {
        self.tx.as_ref()
            .ok_or(CodecError::SinkClosed)?
            .send(event)
            .map_err(|_| CodecError::SinkClosed)
    }
}

impl MessageSink for ChannelSink {
    fn open(&mut self, id: usize) -> Result<(), CodecError> {
        self.send(Event::Opened(id))
    }

    fn headers(&mut self, id: usize, headers: &BTreeMap<String, String>) -> Result<(), CodecError> {
        self.send(Event::Headers(id, headers.clone()))
    }

    fn content(&mut self, id: usize, data: &[u8]) -> Result<(), CodecError> {
        self.send(Event::Content(id, data.to_vec()))
    }

    fn close(&mut self, info: MessageInfo) -> Result<(), CodecError> {
        self.send(Event::Closed(info))
    }

    fn finish(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    #[test]
    fn collector_assembles_messages() {
        let mut c = Collector::new();
        c.open(0).unwrap();
        c.content(0, b"HEL").unwrap();
        c.content(0, b"LO").unwrap();
        c.close(MessageInfo { id: 0, complete: true, content_len: 5, ..Default::default() }).unwrap();
        c.finish();
        assert!(c.is_finished());
        let msgs = c.into_messages();
        assert_eq!(msgs.len(), 1);
        let mut s = String::new();
        msgs[0].reader().read_to_string(&mut s).unwrap();
        assert_eq!(s, "HELLO");
        assert!(msgs[0].is_complete());
        assert!(!msgs[0].verify_checksum());
    }

    #[test]
    fn channel_is_a_rendezvous_and_finish_ends_stream() {
        let (mut sink, rx) = channel();
        let consumer = thread::spawn(move || rx.iter().collect::<Vec<_>>());
        sink.open(0).unwrap();
        sink.content(0, b"X").unwrap();
        sink.close(MessageInfo { id: 0, complete: true, ..Default::default() }).unwrap();
        sink.finish();
        let events = consumer.join().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::Opened(0));
        assert_eq!(events[1], Event::Content(0, b"X".to_vec()));
        assert!(matches!(events[2], Event::Closed(_)));
        assert!(matches!(sink.open(1), Err(CodecError::SinkClosed)));
    }

    #[test]
    fn dropped_receiver_surfaces_as_sink_closed() {
        let (mut sink, rx) = channel();
        drop(rx);
        assert!(matches!(sink.open(0), Err(CodecError::SinkClosed)));
    }

    #[test]
    fn checksum_and_header_accessors() {
        let mut info = MessageInfo::default();
        assert!(!info.verify_checksum());
        info.checksum = ChecksumStatus::Match { crc32: 1 };
        assert!(info.verify_checksum());
        info.checksum = ChecksumStatus::Mismatch { expected: 1, actual: 2 };
        assert!(!info.verify_checksum());
        info.headers.insert(HEADER_FILENAME.into(), "A.TXT".into());
        assert_eq!(info.filename(), Some("A.TXT"));
        assert_eq!(info.content_type(), None);
    }
}
