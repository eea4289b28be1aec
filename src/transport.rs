use crate::error::{NetError, Result};
use crate::protocol::{Channel, Message};
use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;

/// Ordered message delivery per logical channel. Implementations frame
/// messages; nothing is reordered within a channel.
pub trait Transport {
    fn send(&mut self, channel: Channel, message: &Message) -> Result<()>;
    fn receive(&mut self, channel: Channel) -> Result<Option<Message>>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

type Mailbox = Rc<RefCell<AHashMap<Channel, VecDeque<Bytes>>>>;

/// In-process transport. Both ends of a [`pair`](MemoryTransport::pair)
/// share queues and a connection flag, so closing either end closes both.
pub struct MemoryTransport {
    outgoing: Mailbox,
    incoming: Mailbox,
    connected: Rc<Cell<bool>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a: Mailbox = Rc::default();
        let b: Mailbox = Rc::default();
        let connected = Rc::new(Cell::new(true));
        (
            Self {
                outgoing: Rc::clone(&a),
                incoming: Rc::clone(&b),
                connected: Rc::clone(&connected),
            },
            Self {
                outgoing: b,
                incoming: a,
                connected,
            },
        )
    }

    /// Messages waiting to be received on `channel`.
    pub fn pending(&self, channel: Channel) -> usize {
        self.incoming
            .borrow()
            .get(&channel)
            .map_or(0, VecDeque::len)
    }

    /// Queues raw bytes for the peer, bypassing the envelope encoder.
    pub fn inject_raw(&mut self, channel: Channel, data: Bytes) {
        self.outgoing
            .borrow_mut()
            .entry(channel)
            .or_default()
            .push_back(data);
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, channel: Channel, message: &Message) -> Result<()> {
        if !self.connected.get() {
            return Err(NetError::ConnectionClosed);
        }
        self.inject_raw(channel, message.encode());
        Ok(())
    }

    fn receive(&mut self, channel: Channel) -> Result<Option<Message>> {
        if !self.connected.get() {
            return Err(NetError::ConnectionClosed);
        }
        let data = self
            .incoming
            .borrow_mut()
            .get_mut(&channel)
            .and_then(VecDeque::pop_front);
        data.map(Message::decode).transpose()
    }

    fn close(&mut self) -> Result<()> {
        self.connected.set(false);
        self.outgoing.borrow_mut().clear();
        self.incoming.borrow_mut().clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }
}

/// Largest frame a [`StreamTransport`] accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Byte-stream transport framing each message as
/// `[u32 length][u8 channel][envelope]`. Frames read for another channel are
/// queued until asked for.
///
/// `receive` returns `Ok(None)` when the stream reports `WouldBlock`, so a
/// non-blocking stream can be polled channel by channel. On a blocking stream
/// `receive` waits for the next frame on any channel, then returns `Ok(None)`
/// if that frame belongs elsewhere.
pub struct StreamTransport<S: Read + Write> {
    stream: S,
    pending: BytesMut,
    queued: AHashMap<Channel, VecDeque<Message>>,
    connected: bool,
    eof: bool,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
            queued: AHashMap::new(),
            connected: true,
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Reads what the stream has. `false` on `WouldBlock` or a clean end
    /// of stream; a stream ending inside a frame is `UnexpectedEof`.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if !self.pending.is_empty() {
                        return Err(NetError::UnexpectedEof {
                            needed: self.frame_len().map_or(4, |len| 4 + len),
                            remaining: self.pending.len(),
                        });
                    }
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Length of the buffered frame, once its prefix is complete.
    fn frame_len(&self) -> Option<usize> {
        let mut header = self.pending.get(..4)?;
        Some(header.get_u32_le() as usize)
    }

    /// Splits one complete frame off the buffer.
    fn take_frame(&mut self) -> Result<Option<(Channel, Message)>> {
        let len = match self.frame_len() {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > MAX_FRAME_LEN {
            return Err(NetError::LengthLimitExceeded {
                length: len,
                limit: MAX_FRAME_LEN,
            });
        }
        if len == 0 {
            return Err(NetError::InvalidMessage("empty frame".to_string()));
        }
        if self.pending.len() < 4 + len {
            return Ok(None);
        }

        self.pending.advance(4);
        let mut frame = self.pending.split_to(len).freeze();
        let envelope = frame.split_off(1);
        let channel = match frame[0] {
            0 => Channel::ReliableSequenced,
            1 => Channel::Reliable,
            2 => Channel::StateUpdate,
            other => {
                return Err(NetError::InvalidMessage(format!(
                    "unknown channel {}",
                    other
                )))
            }
        };
        Ok(Some((channel, Message::decode(envelope)?)))
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn send(&mut self, channel: Channel, message: &Message) -> Result<()> {
        if !self.connected {
            return Err(NetError::ConnectionClosed);
        }

        let envelope = message.encode();
        let len = u32::try_from(envelope.len() + 1)
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_LEN)
            .ok_or(NetError::LengthLimitExceeded {
                length: envelope.len() + 1,
                limit: MAX_FRAME_LEN,
            })?;

        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(&[channel as u8])?;
        self.stream.write_all(&envelope)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive(&mut self, channel: Channel) -> Result<Option<Message>> {
        if !self.connected {
            return Err(NetError::ConnectionClosed);
        }

        if let Some(message) = self.queued.get_mut(&channel).and_then(VecDeque::pop_front) {
            return Ok(Some(message));
        }

        let mut queued_other = false;
        loop {
            while let Some((frame_channel, message)) = self.take_frame()? {
                if frame_channel == channel {
                    return Ok(Some(message));
                }
                self.queued.entry(frame_channel).or_default().push_back(message);
                queued_other = true;
            }
            if queued_other || self.eof || !self.fill()? {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.queued.clear();
        self.pending.clear();
        self.stream.flush()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use std::io::Cursor;

    #[test]
    fn test_memory_transport_channels() {
        let (mut server, mut client) = MemoryTransport::pair();

        server
            .send(Channel::Reliable, &Message::rpc(Bytes::from_static(&[1])))
            .unwrap();
        server
            .send(Channel::ReliableSequenced, &Message::request_full_state())
            .unwrap();

        assert_eq!(client.pending(Channel::Reliable), 1);
        assert!(client.receive(Channel::StateUpdate).unwrap().is_none());

        let request = client.receive(Channel::ReliableSequenced).unwrap().unwrap();
        assert_eq!(request.msg_type, MessageType::RequestFullState);
        let rpc = client.receive(Channel::Reliable).unwrap().unwrap();
        assert_eq!(&rpc.body[..], &[1]);
        assert!(server.receive(Channel::Reliable).unwrap().is_none());
    }

    #[test]
    fn test_memory_transport_close() {
        let (mut server, client) = MemoryTransport::pair();
        assert!(client.is_connected());

        server.close().unwrap();

        assert!(!client.is_connected());
        assert!(matches!(
            server.send(Channel::Reliable, &Message::request_full_state()),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_stream_transport_framing() {
        let mut sender = StreamTransport::new(Cursor::new(Vec::new()));
        sender
            .send(Channel::StateUpdate, &Message::full_state(Bytes::from_static(&[0, 0, 0, 0])))
            .unwrap();
        sender
            .send(Channel::Reliable, &Message::rpc(Bytes::from_static(&[2, 0])))
            .unwrap();

        let bytes = sender.into_inner().into_inner();
        assert_eq!(&bytes[..6], &[6, 0, 0, 0, 2, 0]);

        let mut receiver = StreamTransport::new(Cursor::new(bytes));
        let rpc = receiver.receive(Channel::Reliable).unwrap().unwrap();
        assert_eq!(rpc.msg_type, MessageType::Rpc);
        let state = receiver.receive(Channel::StateUpdate).unwrap().unwrap();
        assert_eq!(state.body.len(), 4);
        assert!(receiver.receive(Channel::Reliable).unwrap().is_none());
    }

    /// Hands out at most `chunk` bytes per read, then reports `WouldBlock`.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stream_transport_non_blocking_poll() {
        let mut sender = StreamTransport::new(Cursor::new(Vec::new()));
        sender
            .send(Channel::Reliable, &Message::rpc(Bytes::from_static(&[4, 9, 9])))
            .unwrap();
        let data = sender.into_inner().into_inner();

        let mut receiver = StreamTransport::new(Trickle {
            data,
            pos: 0,
            chunk: 3,
        });
        // The frame arrives in pieces and belongs to another channel.
        assert!(receiver.receive(Channel::ReliableSequenced).unwrap().is_none());
        let rpc = receiver.receive(Channel::Reliable).unwrap().unwrap();
        assert_eq!(&rpc.body[..], &[4, 9, 9]);

        assert!(receiver.receive(Channel::Reliable).unwrap().is_none());
        assert!(receiver.is_connected());
    }

    #[test]
    fn test_stream_transport_truncated_frames() {
        let mut receiver = StreamTransport::new(Cursor::new(Vec::new()));
        assert!(receiver.receive(Channel::Reliable).unwrap().is_none());

        let mut receiver = StreamTransport::new(Cursor::new(vec![6, 0]));
        let err = receiver.receive(Channel::Reliable).unwrap_err();
        assert!(matches!(err, NetError::UnexpectedEof { needed: 4, remaining: 2 }));
        assert!(err.is_desync());

        let mut receiver = StreamTransport::new(Cursor::new(vec![6, 0, 0, 0, 1, 3]));
        assert!(matches!(
            receiver.receive(Channel::Reliable),
            Err(NetError::UnexpectedEof { needed: 10, remaining: 6 })
        ));
    }

    #[test]
    fn test_stream_transport_rejects_oversized_frame() {
        let mut data = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        data.push(0);
        let mut receiver = StreamTransport::new(Cursor::new(data));
        let err = receiver.receive(Channel::Reliable).unwrap_err();
        assert!(matches!(err, NetError::LengthLimitExceeded { .. }));
    }
}
