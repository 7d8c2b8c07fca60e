//! Serialize client commands into pooled buffers.
//!
//! Each builder computes an exact upper bound on the frame size from its
//! inputs, takes a buffer of that size from the pool, and writes the ASCII
//! wire form. The bound is exact so a writer never reallocates the pooled
//! storage; length fields use the minimum number of decimal digits.

use bytes::{BufMut, BytesMut};

use crate::{
    pool::{BufferPool, PooledBuf},
    types::{
        error::{Error, Result},
        Connect, Headers, Sid, Subject,
    },
    util,
};

const TERMINATOR: &[u8] = util::MESSAGE_TERMINATOR.as_bytes();
const SPACE: &[u8] = b" ";

pub(crate) fn connect(pool: &BufferPool, connect: &Connect) -> PooledBuf {
    let json = serde_json::to_string(connect).expect("to serialize Connect");
    let mut buf = pool.get(
        util::CONNECT_OP_NAME.len() + SPACE.len() + json.len() + TERMINATOR.len(),
    );
    buf.put_slice(util::CONNECT_OP_NAME.as_bytes());
    buf.put_slice(SPACE);
    buf.put_slice(json.as_bytes());
    buf.put_slice(TERMINATOR);
    buf
}

/// Build a `PUB` frame, or an `HPUB` frame when headers are present
pub(crate) fn publish(
    pool: &BufferPool,
    subject: &Subject,
    reply_to: Option<&Subject>,
    headers: Option<&Headers>,
    payload: &[u8],
) -> Result<PooledBuf> {
    if payload.len() > util::MAX_PUBLISH_PAYLOAD {
        return Err(Error::ExceedsMaxPayload {
            tried: payload.len(),
            limit: util::MAX_PUBLISH_PAYLOAD,
        });
    }
    match headers {
        Some(headers) => {
            headers.validate()?;
            Ok(hpub_frame(pool, subject, reply_to, headers, payload))
        }
        None => Ok(pub_frame(pool, subject, reply_to, payload)),
    }
}

fn pub_frame(
    pool: &BufferPool,
    subject: &Subject,
    reply_to: Option<&Subject>,
    payload: &[u8],
) -> PooledBuf {
    let subject = subject.to_string();
    let reply_to = reply_to.map(|s| s.to_string());
    let mut size = util::PUB_OP_NAME.len()
        + SPACE.len()
        + subject.len()
        + SPACE.len()
        + decimal_width(payload.len())
        + TERMINATOR.len()
        + payload.len()
        + TERMINATOR.len();
    if let Some(reply_to) = &reply_to {
        size += reply_to.len() + SPACE.len();
    }
    let mut buf = pool.get(size);
    buf.put_slice(util::PUB_OP_NAME.as_bytes());
    buf.put_slice(SPACE);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(SPACE);
    if let Some(reply_to) = &reply_to {
        buf.put_slice(reply_to.as_bytes());
        buf.put_slice(SPACE);
    }
    put_decimal(&mut buf, payload.len());
    buf.put_slice(TERMINATOR);
    buf.put_slice(payload);
    buf.put_slice(TERMINATOR);
    buf
}

fn hpub_frame(
    pool: &BufferPool,
    subject: &Subject,
    reply_to: Option<&Subject>,
    headers: &Headers,
    payload: &[u8],
) -> PooledBuf {
    let subject = subject.to_string();
    let reply_to = reply_to.map(|s| s.to_string());
    let header_len = headers.encoded_len();
    let total_len = header_len + payload.len();
    let mut size = util::HPUB_OP_NAME.len()
        + SPACE.len()
        + subject.len()
        + SPACE.len()
        + decimal_width(header_len)
        + SPACE.len()
        + decimal_width(total_len)
        + TERMINATOR.len()
        + total_len
        + TERMINATOR.len();
    if let Some(reply_to) = &reply_to {
        size += reply_to.len() + SPACE.len();
    }
    let mut buf = pool.get(size);
    buf.put_slice(util::HPUB_OP_NAME.as_bytes());
    buf.put_slice(SPACE);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(SPACE);
    if let Some(reply_to) = &reply_to {
        buf.put_slice(reply_to.as_bytes());
        buf.put_slice(SPACE);
    }
    put_decimal(&mut buf, header_len);
    buf.put_slice(SPACE);
    put_decimal(&mut buf, total_len);
    buf.put_slice(TERMINATOR);
    headers.encode_into(&mut buf);
    buf.put_slice(payload);
    buf.put_slice(TERMINATOR);
    buf
}

pub(crate) fn subscribe(
    pool: &BufferPool,
    subject: &Subject,
    queue_group: Option<&str>,
    sid: Sid,
) -> PooledBuf {
    let subject = subject.to_string();
    let mut size = util::SUB_OP_NAME.len()
        + SPACE.len()
        + subject.len()
        + SPACE.len()
        + decimal_width(sid as usize)
        + TERMINATOR.len();
    if let Some(queue_group) = queue_group {
        size += queue_group.len() + SPACE.len();
    }
    let mut buf = pool.get(size);
    buf.put_slice(util::SUB_OP_NAME.as_bytes());
    buf.put_slice(SPACE);
    buf.put_slice(subject.as_bytes());
    buf.put_slice(SPACE);
    if let Some(queue_group) = queue_group {
        buf.put_slice(queue_group.as_bytes());
        buf.put_slice(SPACE);
    }
    put_decimal(&mut buf, sid as usize);
    buf.put_slice(TERMINATOR);
    buf
}

pub(crate) fn unsubscribe(pool: &BufferPool, sid: Sid, max_msgs: Option<u64>) -> PooledBuf {
    let mut size = util::UNSUB_OP_NAME.len()
        + SPACE.len()
        + decimal_width(sid as usize)
        + TERMINATOR.len();
    if let Some(max_msgs) = max_msgs {
        size += SPACE.len() + decimal_width(max_msgs as usize);
    }
    let mut buf = pool.get(size);
    buf.put_slice(util::UNSUB_OP_NAME.as_bytes());
    buf.put_slice(SPACE);
    put_decimal(&mut buf, sid as usize);
    if let Some(max_msgs) = max_msgs {
        buf.put_slice(SPACE);
        put_decimal(&mut buf, max_msgs as usize);
    }
    buf.put_slice(TERMINATOR);
    buf
}

pub(crate) fn ping(pool: &BufferPool) -> PooledBuf {
    op_only(pool, util::PING_OP_NAME)
}

pub(crate) fn pong(pool: &BufferPool) -> PooledBuf {
    op_only(pool, util::PONG_OP_NAME)
}

fn op_only(pool: &BufferPool, op: &str) -> PooledBuf {
    let mut buf = pool.get(op.len() + TERMINATOR.len());
    buf.put_slice(op.as_bytes());
    buf.put_slice(TERMINATOR);
    buf
}

fn decimal_width(value: usize) -> usize {
    let mut width = 1;
    let mut value = value / 10;
    while value > 0 {
        width += 1;
        value /= 10;
    }
    width
}

// Minimum width, no leading zeros.
fn put_decimal(buf: &mut BytesMut, value: usize) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    let mut value = value;
    loop {
        i -= 1;
        digits[i] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    buf.put_slice(&digits[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(s: &str) -> Subject {
        s.parse().unwrap()
    }

    #[test]
    fn unit_decimal() {
        let mut buf = BytesMut::new();
        for (value, expected) in [
            (0usize, "0"),
            (7, "7"),
            (9, "9"),
            (10, "10"),
            (99, "99"),
            (100, "100"),
            (1032, "1032"),
            (10_000_000, "10000000"),
        ] {
            buf.clear();
            put_decimal(&mut buf, value);
            assert_eq!(&buf[..], expected.as_bytes());
            assert_eq!(decimal_width(value), expected.len());
        }
    }

    #[test]
    fn unit_pub() {
        let pool = BufferPool::new();
        let buf = pub_frame(&pool, &subject("foo.bar"), None, b"hello");
        assert_eq!(&buf[..], b"PUB foo.bar 5\r\nhello\r\n" as &[u8]);

        let buf = pub_frame(&pool, &subject("foo"), Some(&subject("reply.box")), b"hi");
        assert_eq!(&buf[..], b"PUB foo reply.box 2\r\nhi\r\n" as &[u8]);
    }

    #[test]
    fn unit_pub_empty_payload() {
        let pool = BufferPool::new();
        let buf = pub_frame(&pool, &subject("foo"), None, b"");
        assert_eq!(&buf[..], b"PUB foo 0\r\n\r\n" as &[u8]);
    }

    #[test]
    fn unit_hpub() {
        let pool = BufferPool::new();
        let mut headers = Headers::new();
        headers.append("A", "1");
        let buf = publish(&pool, &subject("foo"), None, Some(&headers), b"body").unwrap();
        // header block is "NATS/1.0\r\nA: 1\r\n\r\n" = 18 bytes, total 22
        assert_eq!(
            &buf[..],
            b"HPUB foo 18 22\r\nNATS/1.0\r\nA: 1\r\n\r\nbody\r\n" as &[u8]
        );
    }

    #[test]
    fn unit_hpub_empty_payload() {
        let pool = BufferPool::new();
        let headers = Headers::new();
        let buf = publish(&pool, &subject("x"), None, Some(&headers), b"").unwrap();
        assert_eq!(&buf[..], b"HPUB x 12 12\r\nNATS/1.0\r\n\r\n\r\n" as &[u8]);
    }

    #[test]
    fn unit_sub_unsub() {
        let pool = BufferPool::new();
        let buf = super::subscribe(&pool, &subject("foo.>"), None, 7);
        assert_eq!(&buf[..], b"SUB foo.> 7\r\n" as &[u8]);

        let buf = super::subscribe(&pool, &subject("work"), Some("workers"), 12);
        assert_eq!(&buf[..], b"SUB work workers 12\r\n" as &[u8]);

        let buf = unsubscribe(&pool, 7, None);
        assert_eq!(&buf[..], b"UNSUB 7\r\n" as &[u8]);

        let buf = unsubscribe(&pool, 7, Some(3));
        assert_eq!(&buf[..], b"UNSUB 7 3\r\n" as &[u8]);
    }

    #[test]
    fn unit_ping_pong_connect() {
        let pool = BufferPool::new();
        assert_eq!(&ping(&pool)[..], b"PING\r\n" as &[u8]);
        assert_eq!(&pong(&pool)[..], b"PONG\r\n" as &[u8]);

        let buf = connect(&pool, &Connect::new());
        assert!(buf.starts_with(b"CONNECT {"));
        assert!(buf.ends_with(b"}\r\n"));
    }

    #[test]
    fn unit_size_bound_is_exact() {
        // The written frame must fit the initially reserved capacity so the
        // pooled buffer never reallocates mid-write.
        let pool = BufferPool::new();
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        for payload_len in [0usize, 1, 9, 10, 127, 1024] {
            let payload = vec![b'x'; payload_len];
            let buf = publish(&pool, &subject("a.long.subject.name"), Some(&subject("r")),
                Some(&headers), &payload)
                .unwrap();
            assert!(buf.len() <= buf.capacity());
            let buf =
                publish(&pool, &subject("a.long.subject.name"), None, None, &payload).unwrap();
            assert!(buf.len() <= buf.capacity());
        }
    }

    #[test]
    fn unit_oversize_payload_rejected() {
        let pool = BufferPool::new();
        let payload = vec![0u8; util::MAX_PUBLISH_PAYLOAD + 1];
        match publish(&pool, &subject("foo"), None, None, &payload) {
            Err(Error::ExceedsMaxPayload { tried, limit }) => {
                assert_eq!(tried, util::MAX_PUBLISH_PAYLOAD + 1);
                assert_eq!(limit, util::MAX_PUBLISH_PAYLOAD);
            }
            other => panic!("unexpected result: {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn unit_bad_headers_rejected() {
        let pool = BufferPool::new();
        let mut headers = Headers::new();
        headers.append("bad:name", "1");
        assert!(publish(&pool, &subject("foo"), None, Some(&headers), b"x").is_err());
    }
}
