//! Event socket wire framing
//!
//! Inbound frames are header blocks terminated by a blank line, optionally
//! followed by a body of `Content-Length` bytes. Outbound commands are a
//! command line, optional headers, and a blank line.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::constants::*;
use super::EslError;

/// A decoded frame from the media engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EslMessage {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn into_headers(self) -> HashMap<String, String> {
        self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// Whether this frame answers a command we sent
    pub fn is_reply(&self) -> bool {
        matches!(
            self.content_type(),
            Some(CONTENT_TYPE_REPLY) | Some(CONTENT_TYPE_API_RESPONSE)
        )
    }

    pub fn is_event(&self) -> bool {
        self.content_type() == Some(CONTENT_TYPE_EVENT)
    }

    /// Reply text of a failed command, if this reply reports one
    pub fn error_text(&self) -> Option<&str> {
        let text = match self.content_type() {
            Some(CONTENT_TYPE_API_RESPONSE) => self.body()?,
            _ => self.reply_text()?,
        };
        text.trim_start().starts_with("-ERR").then_some(text.trim())
    }

    /// Headers carried in a `text/event-plain` body
    pub fn event_headers(&self) -> HashMap<String, String> {
        let Some(body) = self.body() else {
            return HashMap::new();
        };

        body.lines()
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), decode_value(value.trim())))
            .collect()
    }
}

/// A command line plus optional headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EslCommand {
    line: String,
    headers: Vec<(String, String)>,
}

impl EslCommand {
    fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            headers: Vec::new(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.replace(['\r', '\n'], " ")));
        self
    }

    /// Handshake that returns the channel data
    pub fn connect() -> Self {
        Self::new("connect")
    }

    /// Subscribe to events of one call only
    pub fn myevents(uuid: &str) -> Self {
        if uuid.is_empty() {
            Self::new("myevents")
        } else {
            Self::new(format!("myevents {}", uuid))
        }
    }

    /// Keep delivering events after the call leg hangs up
    pub fn linger() -> Self {
        Self::new("linger")
    }

    pub fn exit() -> Self {
        Self::new("exit")
    }

    fn sendmsg(uuid: &str) -> Self {
        if uuid.is_empty() {
            Self::new("sendmsg")
        } else {
            Self::new(format!("sendmsg {}", uuid))
        }
    }

    /// Run a dialplan application on the call leg
    pub fn execute(uuid: &str, app: &str, arg: &str) -> Self {
        let cmd = Self::sendmsg(uuid)
            .with_header("call-command", "execute")
            .with_header("execute-app-name", app);
        if arg.is_empty() {
            cmd
        } else {
            cmd.with_header("execute-app-arg", arg)
        }
    }

    pub fn hangup(uuid: &str, cause: &str) -> Self {
        Self::sendmsg(uuid)
            .with_header("call-command", "hangup")
            .with_header("hangup-cause", cause)
    }

    #[cfg(test)]
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl std::fmt::Display for EslCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.line)?;
        if let Some(app) = self.header("execute-app-name") {
            write!(f, " [{}", app)?;
            if let Some(arg) = self.header("execute-app-arg") {
                write!(f, " {}", arg)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Framing for an event socket stream
#[derive(Debug, Default)]
pub struct EslCodec;

impl Decoder for EslCodec {
    type Item = EslMessage;
    type Error = EslError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Stray newlines between frames
        while src.first() == Some(&b'\n') || src.first() == Some(&b'\r') {
            src.advance(1);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let Some((header_end, body_start)) = find_blank_line(src) else {
            if src.len() > MAX_HEADER_BLOCK {
                return Err(EslError::Protocol(format!(
                    "header block exceeds {} bytes",
                    MAX_HEADER_BLOCK
                )));
            }
            return Ok(None);
        };

        let text = std::str::from_utf8(&src[..header_end])
            .map_err(|e| EslError::Protocol(format!("header block is not UTF-8: {}", e)))?;
        let headers = parse_header_block(text)?;

        let content_length = match headers.get(HEADER_CONTENT_LENGTH) {
            Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
                EslError::Protocol(format!("invalid Content-Length: {}", value))
            })?),
            None => None,
        };
        if let Some(len) = content_length.filter(|len| *len > MAX_BODY_LEN) {
            return Err(EslError::Protocol(format!(
                "Content-Length {} exceeds {} bytes",
                len, MAX_BODY_LEN
            )));
        }

        let frame_len = body_start
            .checked_add(content_length.unwrap_or(0))
            .ok_or_else(|| EslError::Protocol("frame length overflows".to_string()))?;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let body = content_length.map(|_| String::from_utf8_lossy(&frame[body_start..]).into_owned());

        Ok(Some(EslMessage { headers, body }))
    }
}

impl Encoder<EslCommand> for EslCodec {
    type Error = EslError;

    fn encode(&mut self, item: EslCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(item.line.as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &item.headers {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// End of the header block and start of the body. Accepts `\n\n` and `\r\n\r\n`.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        if line_start > 0 && (line.is_empty() || line == b"\r") {
            return Some((line_start - 1, i + 1));
        }
        line_start = i + 1;
    }
    None
}

fn parse_header_block(text: &str) -> Result<HashMap<String, String>, EslError> {
    let mut headers = HashMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| EslError::Protocol(format!("malformed header line: {}", line)))?;
        headers.insert(key.trim().to_string(), decode_value(value.trim()));
    }
    Ok(headers)
}

/// Header values are URL-encoded; a value that is not valid UTF-8 once decoded is kept raw
fn decode_value(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
