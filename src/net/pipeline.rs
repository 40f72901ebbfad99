//! The two per-connection loops.
//!
//! The receive loop turns stream bytes into complete messages on the shared
//! queue; the send loop drains the connection's outbound queue onto the
//! stream. Each runs on its own OS thread and disposes the connection on
//! every exit path.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use log::debug;

use crate::config::Config;
use crate::core::message::{Event, Message, MessageSender};
use crate::core::pool::{BufferPool, PooledBuf};
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::framing::{self, ProtocolError, MAX_HEADER_LEN, OPCODE_CLOSE};

/// What both loops need besides the connection itself.
#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub pool: Arc<BufferPool>,
    pub config: Arc<Config>,
    pub tx: MessageSender,
}

pub(crate) fn run_receive<R: Read>(conn: &Connection, reader: R, ctx: &PipelineContext) {
    let mut reader = BufReader::with_capacity(ctx.config.read_buffer_size, reader);
    match receive_frames(conn, &mut reader, ctx) {
        Ok(()) => debug!("connection {} closed by peer", conn.id()),
        Err(_) if conn.is_disposed() => {}
        Err(e) if !e.is_reportable() => {}
        Err(e) => {
            debug!("receive on connection {} failed: {}", conn.id(), e);
            let _ = ctx.tx.send(Message::new(conn.id(), Event::Error(e)));
        }
    }
    conn.dispose();
}

/// Reads frames until a close frame (`Ok`) or a failure.
fn receive_frames<R: Read>(conn: &Connection, reader: &mut R, ctx: &PipelineContext) -> Result<(), Error> {
    let max = ctx.config.max_message_size;
    let expect_mask = conn.role().expects_masked_input();
    let mut header = [0u8; MAX_HEADER_LEN];
    let mut fragments: VecDeque<PooledBuf> = VecDeque::new();
    let mut total = 0usize;

    loop {
        reader.read_exact(&mut header[..2])?;
        let header_len = 2 + framing::extra_length_bytes(&header);
        reader.read_exact(&mut header[2..header_len])?;
        let head = &header[..header_len];

        let length = framing::validate_header(head, max, expect_mask, !fragments.is_empty())?;
        let mask_key = if framing::mask_present(head) {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key)?;
            Some(key)
        } else {
            None
        };
        let fin = framing::fin(head);

        if framing::opcode(head) == OPCODE_CLOSE {
            io::copy(&mut reader.by_ref().take(length as u64), &mut io::sink())?;
            return Ok(());
        }

        let fragmented = !fin || !fragments.is_empty();
        if fragmented && total + length > max {
            return Err(ProtocolError::MessageTooLarge {
                total: total + length,
                max,
            }
            .into());
        }

        let mut payload = ctx.pool.take(length)?;
        payload.set_len(length)?;
        reader.read_exact(&mut payload)?;
        if let Some(key) = mask_key {
            framing::toggle_mask_in_place(&mut payload, key, 0);
        }

        if !fin {
            total += length;
            fragments.push_back(payload);
            continue;
        }

        let message = if fragments.is_empty() {
            payload
        } else {
            total += length;
            fragments.push_back(payload);
            let joined = concat(&ctx.pool, &mut fragments, total)?;
            total = 0;
            joined
        };

        if conn.is_disposed() {
            return Err(Error::Cancelled);
        }
        ctx.tx
            .send(Message::new(conn.id(), Event::Data(message.share())))
            .map_err(|_| Error::Cancelled)?;
    }
}

/// Joins the accumulated fragments into one buffer, releasing each as it is
/// copied.
fn concat(pool: &BufferPool, fragments: &mut VecDeque<PooledBuf>, total: usize) -> Result<PooledBuf, Error> {
    let mut joined = pool.take(total)?;
    while let Some(fragment) = fragments.pop_front() {
        joined.extend_from_slice(&fragment)?;
    }
    Ok(joined)
}

pub(crate) fn run_send<W: Write>(conn: &Connection, writer: W, ctx: &PipelineContext) {
    match send_frames(conn, writer, ctx) {
        Ok(()) => {}
        Err(_) if conn.is_disposed() => {}
        Err(e) => {
            debug!("send on connection {} failed: {}", conn.id(), e);
            let _ = ctx.tx.send(Message::new(conn.id(), Event::Error(e)));
        }
    }
    conn.dispose();
}

fn send_frames<W: Write>(conn: &Connection, writer: W, ctx: &PipelineContext) -> Result<(), Error> {
    let mut wire = WireBuffer {
        buf: ctx.pool.take(ctx.config.send_buffer_size.max(MAX_HEADER_LEN))?,
        writer,
    };
    let masked = conn.role().masks_output();

    loop {
        conn.wait_for_work();
        while let Some(buf) = conn.next_outbound() {
            if conn.is_disposed() {
                return Ok(());
            }
            let mask_key = masked.then(rand::random::<[u8; 4]>);
            wire.push_frame(&framing::encode_header(buf.len(), mask_key), &buf, mask_key)?;
            buf.release();
            if !ctx.config.batch_send {
                wire.flush()?;
            }
        }
        if conn.is_disposed() {
            return Ok(());
        }
        wire.flush()?;
    }
}

/// Pooled staging buffer in front of the stream. Frames are copied in,
/// masked on the way when required, and written out whenever the buffer
/// fills or the queue runs dry.
struct WireBuffer<W> {
    buf: PooledBuf,
    writer: W,
}

impl<W: Write> WireBuffer<W> {
    fn spare(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    fn push_frame(&mut self, header: &[u8], payload: &[u8], mask_key: Option<[u8; 4]>) -> Result<(), Error> {
        if self.spare() < header.len() {
            self.write_out()?;
        }
        self.buf.extend_from_slice(header)?;

        let mut offset = 0;
        while offset < payload.len() {
            if self.spare() == 0 {
                self.write_out()?;
            }
            let n = self.spare().min(payload.len() - offset);
            let start = self.buf.len();
            self.buf.set_len(start + n)?;
            let chunk = &payload[offset..offset + n];
            match mask_key {
                Some(key) => framing::toggle_mask(chunk, &mut self.buf[start..], key, offset),
                None => self.buf[start..].copy_from_slice(chunk),
            }
            offset += n;
        }
        Ok(())
    }

    fn write_out(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.writer.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_out()?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{channel, MessageReceiver};
    use crate::net::connection::test_util::socket_pair;
    use crate::net::connection::Role;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::io::Cursor;
    use std::thread;
    use std::time::{Duration, Instant};

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn context(config: Config) -> (PipelineContext, MessageReceiver) {
        let (tx, rx) = channel();
        let ctx = PipelineContext {
            pool: Arc::new(config.build_pool().unwrap()),
            config: Arc::new(config),
            tx,
        };
        (ctx, rx)
    }

    fn small_config() -> Config {
        Config {
            max_message_size: 4096,
            send_buffer_size: 256,
            read_buffer_size: 64,
            pool_buckets: 4,
            pool_smallest: 16,
            ..Config::default()
        }
    }

    fn connection(role: Role) -> (Connection, std::net::TcpStream) {
        let (local, remote) = socket_pair();
        let peer = local.peer_addr().unwrap();
        let conn = Connection::new(role, local, peer);
        conn.set_id(3);
        (conn, remote)
    }

    /// A client-style masked frame with explicit fin/opcode.
    fn masked_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = framing::encode_header(payload.len(), Some(KEY)).to_vec();
        frame[0] = if fin { 0x80 } else { 0 } | opcode;
        let mut body = payload.to_vec();
        framing::toggle_mask_in_place(&mut body, KEY, 0);
        frame.extend(body);
        frame
    }

    fn close_frame() -> Vec<u8> {
        framing::encode_close(Some(KEY)).to_vec()
    }

    fn fragments_of(payload: &[u8], pieces: usize) -> Vec<u8> {
        let size = payload.len().div_ceil(pieces);
        let chunks: Vec<&[u8]> = payload.chunks(size).collect();
        let last = chunks.len() - 1;
        let mut wire = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let opcode = if i == 0 { framing::OPCODE_BINARY } else { framing::OPCODE_CONTINUATION };
            wire.extend(masked_frame(i == last, opcode, chunk));
        }
        wire
    }

    fn drain(rx: &MessageReceiver) -> Vec<Message> {
        rx.try_iter().collect()
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    fn fragments_reassemble_into_one_message(#[case] pieces: usize) {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let payload: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();

        let mut wire = fragments_of(&payload, pieces);
        wire.extend(close_frame());
        run_receive(&conn, Cursor::new(wire), &ctx);

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, 3);
        match &messages[0].event {
            Event::Data(buf) => assert_eq!(&buf[..], &payload[..]),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(conn.is_disposed());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn arbitrary_fragmentation_reassembles(payload in proptest::collection::vec(any::<u8>(), 1..2000), pieces in 1usize..12) {
            let (ctx, rx) = context(small_config());
            let (conn, _remote) = connection(Role::Server);
            let mut wire = fragments_of(&payload, pieces.min(payload.len()));
            wire.extend(close_frame());
            run_receive(&conn, Cursor::new(wire), &ctx);

            let messages = drain(&rx);
            prop_assert_eq!(messages.len(), 1);
            match &messages[0].event {
                Event::Data(buf) => prop_assert_eq!(&buf[..], &payload[..]),
                _ => prop_assert!(false, "expected data"),
            }
        }
    }

    #[test]
    fn messages_keep_wire_order() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let mut wire = Vec::new();
        for i in 1..=5u8 {
            wire.extend(masked_frame(true, framing::OPCODE_BINARY, &vec![i; i as usize * 40]));
        }
        wire.extend(close_frame());
        run_receive(&conn, Cursor::new(wire), &ctx);

        let lengths: Vec<usize> = drain(&rx)
            .into_iter()
            .map(|m| match m.event {
                Event::Data(buf) => buf.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(lengths, [40, 80, 120, 160, 200]);
    }

    #[test]
    fn unmasked_frame_to_server_is_a_protocol_error() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let wire = vec![0x82, 0x03, 1, 2, 3];
        run_receive(&conn, Cursor::new(wire), &ctx);

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0].event,
            Event::Error(Error::Protocol(ProtocolError::UnexpectedMask { expected: true, found: false }))
        ));
        assert!(conn.is_disposed());
    }

    #[test]
    fn oversized_fragmented_message_is_rejected() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let mut wire = masked_frame(false, framing::OPCODE_BINARY, &[0u8; 3000]);
        wire.extend(masked_frame(true, framing::OPCODE_CONTINUATION, &[0u8; 3000]));
        run_receive(&conn, Cursor::new(wire), &ctx);

        let messages = drain(&rx);
        assert!(matches!(
            messages[..],
            [Message {
                event: Event::Error(Error::Protocol(ProtocolError::MessageTooLarge { total: 6000, max: 4096 })),
                ..
            }]
        ));
    }

    #[test]
    fn truncated_stream_reports_io_error() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let mut wire = masked_frame(true, framing::OPCODE_BINARY, b"complete");
        wire.extend(&masked_frame(true, framing::OPCODE_BINARY, b"cut short")[..6]);
        run_receive(&conn, Cursor::new(wire), &ctx);

        let messages = drain(&rx);
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0].event, Event::Data(buf) if &buf[..] == b"complete"));
        assert!(matches!(messages[1].event, Event::Error(Error::Io(_))));
    }

    #[test]
    fn receive_after_dispose_is_silent() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        conn.dispose();
        run_receive(&conn, Cursor::new(vec![0x82]), &ctx);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn client_role_accepts_unmasked_frames() {
        let (ctx, rx) = context(small_config());
        let (conn, _remote) = connection(Role::Client);
        let mut wire = framing::encode_header(4, None).to_vec();
        wire.extend(b"pong");
        wire.extend(framing::encode_close(None));
        run_receive(&conn, Cursor::new(wire), &ctx);
        assert!(matches!(&drain(&rx)[..], [Message { event: Event::Data(buf), .. }] if &buf[..] == b"pong"));
    }

    /// Decodes every frame in `wire`, unmasking when needed.
    fn decode_all(mut wire: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while !wire.is_empty() {
            let header_len = 2 + framing::extra_length_bytes(wire);
            let length = framing::payload_length(&wire[..header_len]).unwrap();
            let mut pos = header_len;
            let key = framing::mask_present(wire).then(|| {
                let key = [wire[pos], wire[pos + 1], wire[pos + 2], wire[pos + 3]];
                pos += 4;
                key
            });
            let mut payload = wire[pos..pos + length].to_vec();
            if let Some(key) = key {
                framing::toggle_mask_in_place(&mut payload, key, 0);
            }
            frames.push((framing::opcode(wire), payload));
            wire = &wire[pos + length..];
        }
        frames
    }

    #[derive(Default)]
    struct Recording {
        writes: usize,
        bytes: Vec<u8>,
    }

    struct RecordingWriter(Arc<Mutex<Recording>>);

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut out = self.0.lock();
            out.writes += 1;
            out.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Runs the send loop until `total` bytes reached the writer, then
    /// disposes the connection to stop it.
    fn send_until(conn: &Connection, ctx: &PipelineContext, total: usize) -> Recording {
        let out = Arc::new(Mutex::new(Recording::default()));
        thread::scope(|scope| {
            let writer = RecordingWriter(Arc::clone(&out));
            let sender = scope.spawn(move || run_send(conn, writer, ctx));
            let deadline = Instant::now() + Duration::from_secs(5);
            while out.lock().bytes.len() < total && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            conn.dispose();
            sender.join().unwrap();
        });
        let mut out = out.lock();
        std::mem::take(&mut *out)
    }

    #[rstest]
    #[case::batched(true, 1)]
    #[case::unbatched(false, 3)]
    fn send_loop_frames_queued_messages(#[case] batch_send: bool, #[case] writes: usize) {
        let (ctx, rx) = context(Config {
            batch_send,
            ..small_config()
        });
        let (conn, _remote) = connection(Role::Client);
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            assert!(conn.enqueue(ctx.pool.copy_from(payload).unwrap().share()));
        }

        // Three masked frames: 2 header bytes and 4 mask bytes each.
        let out = send_until(&conn, &ctx, 3 * 6 + 11);

        assert_eq!(out.writes, writes);
        let frames = decode_all(&out.bytes);
        assert_eq!(
            frames,
            [
                (framing::OPCODE_BINARY, b"one".to_vec()),
                (framing::OPCODE_BINARY, b"two".to_vec()),
                (framing::OPCODE_BINARY, b"three".to_vec()),
            ]
        );
        assert!(framing::mask_present(&out.bytes));
        assert!(conn.is_disposed());
        assert_eq!(ctx.pool.free_buffers(5), 3);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn send_loop_splits_large_payloads_across_writes() {
        let (ctx, _rx) = context(small_config());
        let (conn, _remote) = connection(Role::Server);
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        assert!(conn.enqueue(ctx.pool.copy_from(&payload).unwrap().share()));

        let out = send_until(&conn, &ctx, 4 + payload.len());

        assert!(out.writes > 1);
        assert!(!framing::mask_present(&out.bytes));
        assert_eq!(decode_all(&out.bytes), [(framing::OPCODE_BINARY, payload)]);
    }
}
