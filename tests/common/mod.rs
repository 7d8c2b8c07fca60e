//! An embedded NATS server speaking just enough of the protocol for the
//! integration tests: INFO on accept, CONNECT/PING/SUB/UNSUB/PUB/HPUB from
//! clients, MSG/HMSG fan-out with wildcard subject matching, and a kill
//! switch that drops every live connection while the listener stays up.

#![allow(dead_code)]

use natter::Address;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

enum Out {
    Data(Vec<u8>),
    Close,
}

struct Conn {
    outbound: mpsc::UnboundedSender<Out>,
    // sid -> subject pattern
    subs: HashMap<u64, String>,
}

#[derive(Default)]
struct State {
    conns: Mutex<HashMap<u64, Conn>>,
}

pub struct TestServer {
    port: u16,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State::default());
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&state), port));
        TestServer {
            port,
            state,
            accept,
        }
    }

    pub fn address(&self) -> Address {
        format!("127.0.0.1:{}", self.port).parse().unwrap()
    }

    /// Drop every live connection. The listener keeps accepting, so clients
    /// can reconnect.
    pub async fn drop_connections(&self) {
        let mut conns = self.state.conns.lock().await;
        for (_, conn) in conns.drain() {
            let _ = conn.outbound.send(Out::Close);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.conns.lock().await.len()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, port: u16) {
    let mut next_id = 0u64;
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(_) => break,
        };
        socket.set_nodelay(true).unwrap();
        next_id += 1;
        let id = next_id;
        let (read_half, write_half) = socket.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        state.conns.lock().await.insert(
            id,
            Conn {
                outbound: out_tx.clone(),
                subs: HashMap::new(),
            },
        );
        tokio::spawn(write_loop(write_half, out_rx));
        tokio::spawn(read_loop(read_half, id, Arc::clone(&state), out_tx, port));
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Out>) {
    while let Some(out) = outbound.recv().await {
        match out {
            Out::Data(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            Out::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    read_half: OwnedReadHalf,
    id: u64,
    state: Arc<State>,
    out_tx: mpsc::UnboundedSender<Out>,
    port: u16,
) {
    let mut reader = BufReader::new(read_half);
    let info = format!(
        "INFO {{\"server_id\":\"embedded\",\"version\":\"0.0.0\",\"go\":\"none\",\
         \"host\":\"127.0.0.1\",\"port\":{},\"max_payload\":1048576,\"proto\":1,\
         \"headers\":true}}\r\n",
        port
    );
    let _ = out_tx.send(Out::Data(info.into_bytes()));

    let mut line = Vec::new();
    loop {
        line.clear();
        let read = match reader.read_until(b'\n', &mut line).await {
            Ok(read) => read,
            Err(_) => break,
        };
        if read == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let fields: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let Some(op) = fields.first() else { continue };
        match op.to_ascii_uppercase().as_str() {
            "CONNECT" | "PONG" => {}
            "PING" => {
                let _ = out_tx.send(Out::Data(b"PONG\r\n".to_vec()));
            }
            // SUB <subject> [queue-group] <sid>
            "SUB" if fields.len() >= 3 => {
                let subject = fields[1].clone();
                let sid: u64 = fields.last().unwrap().parse().unwrap();
                let mut conns = state.conns.lock().await;
                if let Some(conn) = conns.get_mut(&id) {
                    conn.subs.insert(sid, subject);
                }
            }
            // UNSUB <sid> [max-msgs]
            "UNSUB" if fields.len() >= 2 => {
                if let Ok(sid) = fields[1].parse::<u64>() {
                    let mut conns = state.conns.lock().await;
                    if let Some(conn) = conns.get_mut(&id) {
                        conn.subs.remove(&sid);
                    }
                }
            }
            // PUB <subject> [reply-to] <len>
            "PUB" if fields.len() >= 3 => {
                let subject = fields[1].clone();
                let len: usize = fields.last().unwrap().parse().unwrap();
                let reply_to = (fields.len() == 4).then(|| fields[2].clone());
                let mut payload = vec![0u8; len + 2];
                if reader.read_exact(&mut payload).await.is_err() {
                    break;
                }
                payload.truncate(len);
                route(&state, &subject, reply_to.as_deref(), None, &payload).await;
            }
            // HPUB <subject> [reply-to] <header-len> <total-len>
            "HPUB" if fields.len() >= 4 => {
                let subject = fields[1].clone();
                let total_len: usize = fields.last().unwrap().parse().unwrap();
                let header_len: usize = fields[fields.len() - 2].parse().unwrap();
                let reply_to = (fields.len() == 5).then(|| fields[2].clone());
                let mut block = vec![0u8; total_len + 2];
                if reader.read_exact(&mut block).await.is_err() {
                    break;
                }
                block.truncate(total_len);
                route(&state, &subject, reply_to.as_deref(), Some(header_len), &block).await;
            }
            other => {
                eprintln!("test server ignoring op {:?}", other);
            }
        }
    }
    state.conns.lock().await.remove(&id);
}

// Deliver to every matching subscription on every connection.
async fn route(
    state: &State,
    subject: &str,
    reply_to: Option<&str>,
    header_len: Option<usize>,
    body: &[u8],
) {
    let conns = state.conns.lock().await;
    for conn in conns.values() {
        for (sid, pattern) in &conn.subs {
            if !subject_matches(pattern, subject) {
                continue;
            }
            let reply = reply_to.map(|r| format!(" {}", r)).unwrap_or_default();
            let control = match header_len {
                None => format!("MSG {} {}{} {}\r\n", subject, sid, reply, body.len()),
                Some(header_len) => format!(
                    "HMSG {} {}{} {} {}\r\n",
                    subject,
                    sid,
                    reply,
                    header_len,
                    body.len()
                ),
            };
            let mut frame = control.into_bytes();
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
            let _ = conn.outbound.send(Out::Data(frame));
        }
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            // '>' matches one or more remaining tokens
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[test]
fn test_subject_matches() {
    assert!(subject_matches("foo", "foo"));
    assert!(!subject_matches("foo", "bar"));
    assert!(!subject_matches("foo", "foo.bar"));
    assert!(subject_matches("foo.*", "foo.bar"));
    assert!(!subject_matches("foo.*", "foo.bar.baz"));
    assert!(subject_matches("foo.>", "foo.bar.baz"));
    assert!(!subject_matches("foo.>", "foo"));
    assert!(subject_matches(">", "foo.bar"));
    assert!(subject_matches("_INBOX.abc.>", "_INBOX.abc.0"));
    assert!(!subject_matches("_INBOX.abc.>", "_INBOX.other.0"));
}
