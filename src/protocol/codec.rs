//! Message framing for protocols.
//!
//! A [`Codec`] turns raw stream bytes into messages and back. Both directions may
//! keep state (a partially received frame, for instance), so each protocol owns its
//! own codec instance; accepted peers get a fresh one from `Default`.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub trait Codec: Default + Send + 'static {
    type Message: Send + 'static;

    /// Consumes `bytes` and returns every message completed by them, in wire order.
    fn parse(&mut self, bytes: &[u8]) -> Result<Vec<Self::Message>>;

    fn serialize(&mut self, messages: Vec<Self::Message>) -> Result<Vec<u8>>;

    /// Rejects a message `serialize` could not frame, before it is queued.
    fn validate(&self, message: &Self::Message) -> Result<()> {
        let _ = message;
        Ok(())
    }
}

/// Splits complete `\n`-terminated lines off `buffer`, dropping the terminator and
/// an optional `\r` before it.
fn split_lines(buffer: &mut Vec<u8>, bytes: &[u8]) -> Vec<Vec<u8>> {
    buffer.extend_from_slice(bytes);
    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(offset) = buffer[start..].iter().position(|byte| *byte == b'\n') {
        let end = start + offset;
        let line = &buffer[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        lines.push(line.to_vec());
        start = end + 1;
    }
    buffer.drain(..start);
    lines
}

/// Newline-delimited UTF-8 text.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
}

impl LineCodec {
    /// Bytes received after the last complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Codec for LineCodec {
    type Message = String;

    fn parse(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        split_lines(&mut self.buffer, bytes)
            .into_iter()
            .map(|line| String::from_utf8(line).map_err(|err| Error::Codec(err.to_string())))
            .collect()
    }

    fn serialize(&mut self, messages: Vec<String>) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(messages.iter().map(|m| m.len() + 1).sum());
        for message in messages {
            self.validate(&message)?;
            bytes.extend_from_slice(message.as_bytes());
            bytes.push(b'\n');
        }
        Ok(bytes)
    }

    fn validate(&self, message: &String) -> Result<()> {
        if message.contains('\n') {
            return Err(Error::Codec("line contains a newline".to_string()));
        }
        Ok(())
    }
}

/// Newline-delimited JSON documents, one message per line.
pub struct JsonCodec<T> {
    buffer: Vec<u8>,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            _message: PhantomData,
        }
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn parse(&mut self, bytes: &[u8]) -> Result<Vec<T>> {
        split_lines(&mut self.buffer, bytes)
            .into_iter()
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(&line).map_err(|err| Error::Codec(err.to_string())))
            .collect()
    }

    fn serialize(&mut self, messages: Vec<T>) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for message in &messages {
            serde_json::to_writer(&mut bytes, message)
                .map_err(|err| Error::Codec(err.to_string()))?;
            bytes.push(b'\n');
        }
        Ok(bytes)
    }
}
