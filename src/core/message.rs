//! Messages handed from connection threads to the application.
//!
//! Receive and accept threads push onto one unbounded channel; the embedding
//! application drains it on a thread of its choosing with
//! [`drain_messages`], which turns each message into one [`Handler`] call.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::core::pool::SharedBuf;
use crate::error::Error;

/// Connection id. [`UNSET_ID`] until the upgrade handshake completes.
pub type ConnectionId = i64;

pub const UNSET_ID: ConnectionId = -1;

#[derive(Debug)]
pub enum Event {
    Connected,
    Data(SharedBuf),
    Disconnected,
    Error(Error),
}

#[derive(Debug)]
pub struct Message {
    pub id: ConnectionId,
    pub event: Event,
}

impl Message {
    pub fn new(id: ConnectionId, event: Event) -> Self {
        Self { id, event }
    }
}

pub type MessageSender = Sender<Message>;
pub type MessageReceiver = Receiver<Message>;

pub fn channel() -> (MessageSender, MessageReceiver) {
    crossbeam_channel::unbounded()
}

/// Application callbacks. Every method defaults to a no-op.
pub trait Handler {
    fn on_connect(&mut self, _id: ConnectionId) {}

    fn on_data(&mut self, _id: ConnectionId, _data: &[u8]) {}

    fn on_disconnect(&mut self, _id: ConnectionId) {}

    fn on_error(&mut self, _id: ConnectionId, _cause: &Error) {}
}

/// Delivers at most `max` queued messages and returns how many were handled.
///
/// Data buffers go back to the pool as soon as `on_data` returns.
pub fn drain_messages<H: Handler + ?Sized>(rx: &MessageReceiver, max: usize, handler: &mut H) -> usize {
    let mut handled = 0;
    while handled < max {
        let message = match rx.try_recv() {
            Ok(message) => message,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        dispatch(message, handler);
        handled += 1;
    }
    handled
}

fn dispatch<H: Handler + ?Sized>(message: Message, handler: &mut H) {
    let id = message.id;
    match message.event {
        Event::Connected => handler.on_connect(id),
        Event::Data(buf) => {
            handler.on_data(id, &buf);
            buf.release();
        }
        Event::Disconnected => handler.on_disconnect(id),
        Event::Error(cause) => handler.on_error(id, &cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::BufferPool;
    use crate::net::framing::ProtocolError;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl Handler for Recorder {
        fn on_connect(&mut self, id: ConnectionId) {
            self.calls.push(format!("connect {id}"));
        }

        fn on_data(&mut self, id: ConnectionId, data: &[u8]) {
            self.calls.push(format!("data {id} {}", data.len()));
        }

        fn on_disconnect(&mut self, id: ConnectionId) {
            self.calls.push(format!("disconnect {id}"));
        }

        fn on_error(&mut self, id: ConnectionId, _cause: &Error) {
            self.calls.push(format!("error {id}"));
        }
    }

    #[test]
    fn drain_is_bounded_and_ordered() {
        let pool = BufferPool::new(2, 16, 64).unwrap();
        let (tx, rx) = channel();
        tx.send(Message::new(1, Event::Connected)).unwrap();
        tx.send(Message::new(1, Event::Data(pool.copy_from(b"hello").unwrap().share())))
            .unwrap();
        tx.send(Message::new(1, Event::Error(ProtocolError::EmptyPayload.into())))
            .unwrap();
        tx.send(Message::new(1, Event::Disconnected)).unwrap();

        let mut recorder = Recorder::default();
        assert_eq!(drain_messages(&rx, 2, &mut recorder), 2);
        assert_eq!(recorder.calls, ["connect 1", "data 1 5"]);
        assert_eq!(pool.free_buffers(5), 1);

        assert_eq!(drain_messages(&rx, 10, &mut recorder), 2);
        assert_eq!(recorder.calls[2..], ["error 1", "disconnect 1"]);
        assert_eq!(drain_messages(&rx, 10, &mut recorder), 0);
    }
}
