//! Line-framed wire protocol between the tally server and its clients.
//!
//! Message kinds form a closed set and are pattern-matched, never string
//! sentinels. Until the cookie handshake succeeds, a tight line-length cap
//! bounds what an unauthenticated peer can send; afterwards the cap relaxes
//! enough for counter payloads.

use rand::rngs::OsRng;
use rand::Rng;
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

use crate::error::{Error, Result};

/// Fixed factor folded into the handshake password.
pub const HANDSHAKE_MAGIC: f64 = 759.623;

/// Line cap before the handshake validates the connection. The handshake
/// itself transfers very little, so a small buffer is enough.
pub const MAX_LINE_LENGTH_PRE_AUTH: usize = 256;

/// Line cap after authentication; counter payloads need longer lines.
pub const MAX_LINE_LENGTH_POST_AUTH: usize = 512 * 1024;

/// Every message either side may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake1 { server_cookie: f64 },
    Handshake2 { client_cookie: f64, password: f64 },
    Handshake3 { success: bool },
    /// Bidirectional heartbeat; the epoch timestamp carries the RTT and
    /// clock-skew measurement.
    Status { time: f64, status: Value },
    Start { config: Value },
    StartResult(Option<Value>),
    Stop { config: Value },
    StopResult(Option<Value>),
    Checkin { period: u64 },
    CheckinSuccess,
}

impl Message {
    /// Format the message as one wire line (no terminator).
    pub fn to_line(&self) -> Result<String> {
        Ok(match self {
            Message::Handshake1 { server_cookie } => format!("HANDSHAKE1 {server_cookie}"),
            Message::Handshake2 {
                client_cookie,
                password,
            } => format!("HANDSHAKE2 {client_cookie} {password}"),
            Message::Handshake3 { success: true } => "HANDSHAKE3 SUCCESS".to_string(),
            Message::Handshake3 { success: false } => "HANDSHAKE3 FAIL".to_string(),
            Message::Status { time, status } => {
                format!("STATUS {time} {}", serde_json::to_string(status)?)
            }
            Message::Start { config } => format!("START {}", serde_json::to_string(config)?),
            Message::StartResult(Some(result)) => {
                format!("START SUCCESS {}", serde_json::to_string(result)?)
            }
            Message::StartResult(None) => "START FAIL".to_string(),
            Message::Stop { config } => format!("STOP {}", serde_json::to_string(config)?),
            Message::StopResult(Some(result)) => {
                format!("STOP SUCCESS {}", serde_json::to_string(result)?)
            }
            Message::StopResult(None) => "STOP FAIL".to_string(),
            Message::Checkin { period } => format!("CHECKIN {period}"),
            Message::CheckinSuccess => "CHECKIN SUCCESS".to_string(),
        })
    }

    /// Parse one wire line.
    pub fn parse(line: &str) -> Result<Message> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (kind, payload) = match line.split_once(' ') {
            Some((kind, payload)) => (kind, payload.trim()),
            None => (line, ""),
        };
        match kind {
            "HANDSHAKE1" => {
                let server_cookie = parse_cookie(payload)?;
                Ok(Message::Handshake1 { server_cookie })
            }
            "HANDSHAKE2" => {
                let mut parts = payload.split_whitespace();
                let client_cookie = parse_cookie(parts.next().unwrap_or(""))?;
                let password = parse_cookie(parts.next().unwrap_or(""))?;
                if parts.next().is_some() {
                    return Err(Error::Protocol("trailing data in HANDSHAKE2".into()));
                }
                Ok(Message::Handshake2 {
                    client_cookie,
                    password,
                })
            }
            "HANDSHAKE3" => match payload {
                "SUCCESS" => Ok(Message::Handshake3 { success: true }),
                "FAIL" => Ok(Message::Handshake3 { success: false }),
                other => Err(Error::Protocol(format!("bad HANDSHAKE3 payload '{other}'"))),
            },
            "STATUS" => {
                let (time, json) = payload
                    .split_once(' ')
                    .ok_or_else(|| Error::Protocol("STATUS without payload".into()))?;
                let time: f64 = time
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad STATUS timestamp '{time}'")))?;
                Ok(Message::Status {
                    time,
                    status: serde_json::from_str(json)?,
                })
            }
            "START" => parse_command_or_result(
                payload,
                |config| Message::Start { config },
                Message::StartResult,
            ),
            "STOP" => parse_command_or_result(
                payload,
                |config| Message::Stop { config },
                Message::StopResult,
            ),
            "CHECKIN" => {
                if payload == "SUCCESS" {
                    return Ok(Message::CheckinSuccess);
                }
                let period: u64 = payload.parse().map_err(|_| {
                    Error::Protocol(format!("bad CHECKIN period '{payload}'"))
                })?;
                Ok(Message::Checkin { period })
            }
            other => Err(Error::Protocol(format!("unknown message kind '{other}'"))),
        }
    }
}

fn parse_cookie(raw: &str) -> Result<f64> {
    let cookie: f64 = raw
        .parse()
        .map_err(|_| Error::Protocol(format!("bad handshake cookie '{raw}'")))?;
    if !cookie.is_finite() {
        return Err(Error::Protocol(format!("non-finite cookie '{raw}'")));
    }
    Ok(cookie)
}

fn parse_command_or_result(
    payload: &str,
    command: impl Fn(Value) -> Message,
    result: impl Fn(Option<Value>) -> Message,
) -> Result<Message> {
    if payload == "FAIL" {
        return Ok(result(None));
    }
    if let Some(json) = payload.strip_prefix("SUCCESS ") {
        return Ok(result(Some(serde_json::from_str(json)?)));
    }
    if payload == "SUCCESS" {
        return Ok(result(Some(Value::Null)));
    }
    Ok(command(serde_json::from_str(payload)?))
}

/// A fresh handshake cookie: a random float rounded to 6 decimals.
pub fn new_cookie() -> f64 {
    round6(OsRng.gen::<f64>())
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// The handshake password for a cookie pair.
pub fn handshake_password(client_cookie: f64, server_cookie: f64) -> f64 {
    round6(client_cookie * server_cookie * HANDSHAKE_MAGIC)
}

/// Compare a received password with the expected one, for equality after a
/// string round-trip (both sides format the float into the line).
pub fn password_matches(received: f64, expected: f64) -> bool {
    let round_tripped: f64 = match format!("{expected}").parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    received == round_tripped
}

/// One line-framed protocol connection over any byte stream.
///
/// Generic over the transport so an authenticated TLS stream can be slotted
/// in where the tests use an in-memory duplex.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    max_line: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap a stream; the pre-authentication line cap applies.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
            max_line: MAX_LINE_LENGTH_PRE_AUTH,
        }
    }

    /// Relax the line cap after a successful handshake.
    pub fn set_authenticated(&mut self) {
        self.max_line = MAX_LINE_LENGTH_POST_AUTH;
    }

    /// Read one message, enforcing the current line cap. An oversize line is
    /// a protocol violation: the caller must drop the connection.
    pub async fn read_message(&mut self) -> Result<Message> {
        let mut buf = Vec::new();
        let limit = (self.max_line + 2) as u64;
        let mut limited = (&mut self.reader).take(limit);
        let n = limited.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed".into()));
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() as u64 >= limit {
                return Err(Error::Protocol(format!(
                    "line exceeded cap of {} bytes, dropping connection",
                    self.max_line
                )));
            }
            return Err(Error::Protocol("connection closed mid-line".into()));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if buf.len() > self.max_line {
            return Err(Error::Protocol(format!(
                "line of {} bytes exceeded cap of {} bytes",
                buf.len(),
                self.max_line
            )));
        }
        let line = String::from_utf8(buf)
            .map_err(|_| Error::Protocol("line is not valid UTF-8".into()))?;
        tracing::trace!("received line '{}'", line);
        Message::parse(&line)
    }

    /// Write one message as a line.
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let mut line = message.to_line()?;
        tracing::trace!("sending line '{}'", line);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Close the write half, signalling end of protocol to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
