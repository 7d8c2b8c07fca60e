//! Incremental decoder for the server side of the NATS protocol.
//!
//! The decoder is fed raw socket bytes in whatever chunks they arrive and
//! emits one [`ServerMessage`](crate::types::ServerMessage) per complete
//! frame. Bytes belonging to incomplete frames stay in the input buffer
//! until more data arrives, so arbitrary byte-boundary splits decode to the
//! same frame sequence. Payload bytes are split off the input buffer without
//! copying; the resulting `Bytes` handles share (and keep alive) the
//! underlying storage until every subscription holding a clone has dropped
//! it.


use bytes::BytesMut;
use std::str;
use tokio_util::codec::Decoder;

use crate::{
    types::{
        error::{Error, Result},
        Headers, Msg, ServerControl, ServerMessage, Sid, Subject,
    },
    util::MESSAGE_TERMINATOR,
};

enum State {
    /// Scanning for the next complete control line
    ReadControl,
    /// Consuming the payload block announced by a `MSG`/`HMSG` control line
    ReadPayload {
        subject: Subject,
        sid: Sid,
        reply_to: Option<Subject>,
        /// Length of the leading headers block, present only for `HMSG`
        header_len: Option<usize>,
        total_len: usize,
    },
}

/// A [`ServerMessage`] decoder
pub(crate) struct Codec {
    // Index of the next byte to examine for a `\n` when reading a control
    // line, so repeated calls do not rescan the same prefix.
    next_index: usize,
    // Frames announcing a payload larger than this are protocol violations.
    max_payload: usize,
    state: State,
}

impl Codec {
    pub fn new(max_payload: usize) -> Codec {
        Codec {
            next_index: 0,
            max_payload,
            state: State::ReadControl,
        }
    }

    fn decode_impl(&mut self, buf: &mut BytesMut) -> Result<Option<ServerMessage>> {
        match &mut self.state {
            State::ReadPayload {
                header_len,
                total_len,
                ..
            } => {
                let header_len = *header_len;
                let total_len = *total_len;
                // The payload block is the announced bytes plus the trailing
                // terminator.
                if buf.len() < total_len + MESSAGE_TERMINATOR.len() {
                    return Ok(None);
                }
                let mut block = buf.split_to(total_len + MESSAGE_TERMINATOR.len());
                let terminator = &block[total_len..];
                if terminator != MESSAGE_TERMINATOR.as_bytes() {
                    return Err(Error::InvalidTerminator(terminator.to_vec()));
                }
                block.truncate(total_len);
                let mut payload = block.freeze();
                let headers = match header_len {
                    Some(header_len) => {
                        let header_block = payload.split_to(header_len);
                        Some(Headers::parse(&header_block)?)
                    }
                    None => None,
                };
                let old_state = std::mem::replace(&mut self.state, State::ReadControl);
                if let State::ReadPayload {
                    subject,
                    sid,
                    reply_to,
                    ..
                } = old_state
                {
                    return Ok(Some(ServerMessage::Msg(Msg::new(
                        subject, sid, reply_to, headers, payload,
                    ))));
                }
                unreachable!();
            }
            State::ReadControl => {
                let newline_offset = buf[self.next_index..].iter().position(|b| *b == b'\n');
                let newline_index = match newline_offset {
                    Some(offset) => offset + self.next_index,
                    None => {
                        // No full line yet; resume scanning at the current
                        // end of the buffer next time.
                        self.next_index = buf.len();
                        return Ok(None);
                    }
                };
                self.next_index = 0;
                let line = buf.split_to(newline_index + 1);
                let line = str::from_utf8(&line)
                    .map_err(|_| Error::InvalidServerControl(format!("{:?}", &line[..])))?;
                let control = line.parse()?;
                match control {
                    ServerControl::Msg {
                        subject,
                        sid,
                        reply_to,
                        len,
                    } => {
                        self.enter_payload(buf, subject, sid, reply_to, None, len as usize)?;
                        self.decode_impl(buf)
                    }
                    ServerControl::Hmsg {
                        subject,
                        sid,
                        reply_to,
                        header_len,
                        total_len,
                    } => {
                        if header_len > total_len {
                            return Err(Error::InvalidServerControl(String::from(line)));
                        }
                        self.enter_payload(
                            buf,
                            subject,
                            sid,
                            reply_to,
                            Some(header_len as usize),
                            total_len as usize,
                        )?;
                        self.decode_impl(buf)
                    }
                    control => Ok(Some(control.into())),
                }
            }
        }
    }

    fn enter_payload(
        &mut self,
        buf: &mut BytesMut,
        subject: Subject,
        sid: Sid,
        reply_to: Option<Subject>,
        header_len: Option<usize>,
        total_len: usize,
    ) -> Result<()> {
        if total_len > self.max_payload {
            return Err(Error::PayloadAboveMaximum {
                announced: total_len,
                maximum: self.max_payload,
            });
        }
        self.state = State::ReadPayload {
            subject,
            sid,
            reply_to,
            header_len,
            total_len,
        };
        // Reserve the whole block up front so the payload arrives in one
        // contiguous region and can be split off without copying.
        buf.reserve(total_len + MESSAGE_TERMINATOR.len());
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = ServerMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ServerMessage>> {
        self.decode_impl(buf)
    }
}
