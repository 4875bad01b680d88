// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::{AppError, AppResult};

/// `packet_type` then `body_length`, both `u32` in network byte order.
pub const HEADER_SIZE: usize = 8;
pub const DEFAULT_MAX_DATA_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub packet_type: u32,
    pub body_length: u32,
}

impl Header {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.packet_type.to_be_bytes());
        bytes[4..].copy_from_slice(&self.body_length.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut packet_type = [0u8; 4];
        let mut body_length = [0u8; 4];
        packet_type.copy_from_slice(&bytes[..4]);
        body_length.copy_from_slice(&bytes[4..]);
        Header {
            packet_type: u32::from_be_bytes(packet_type),
            body_length: u32::from_be_bytes(body_length),
        }
    }
}

/// A value with a fixed wire representation.
///
/// Integers are written big-endian. Structures implement this field by field,
/// which keeps the body independent of host layout and endianness.
pub trait WireEncode {
    fn encode(&self, buffer: &mut BytesMut);
}

macro_rules! impl_wire_encode_int {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, buffer: &mut BytesMut) {
                    buffer.$put(*self);
                }
            }
        )*
    };
}

impl_wire_encode_int!(
    u8 => put_u8,
    i8 => put_i8,
    u16 => put_u16,
    i16 => put_i16,
    u32 => put_u32,
    i32 => put_i32,
    u64 => put_u64,
    i64 => put_i64,
    f32 => put_f32,
    f64 => put_f64,
);

impl WireEncode for bool {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(u8::from(*self));
    }
}

impl WireEncode for [u8] {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self);
    }
}

impl<const N: usize> WireEncode for [u8; N] {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self);
    }
}

impl WireEncode for Vec<u8> {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self);
    }
}

impl WireEncode for Bytes {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self);
    }
}

impl WireEncode for str {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self.as_bytes());
    }
}

impl<T: WireEncode + ?Sized> WireEncode for &T {
    fn encode(&self, buffer: &mut BytesMut) {
        (**self).encode(buffer);
    }
}

/// Header and body of a finished message as shared buffers, ready to be
/// queued on any number of output streams.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub header: Bytes,
    pub body: Bytes,
}

impl EncodedMessage {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A length-prefixed message.
///
/// Built locally with `insert` + `update_size`, or reassembled from a byte
/// stream with `feed`. Parsing moves through header, then body; `reset_header`
/// returns it to empty so one instance can parse a whole stream.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    header_buffer: [u8; HEADER_SIZE],
    header_bytes_received: usize,
    body: BytesMut,
    body_bytes_received: usize,
    max_data_length: usize,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            header: Header::default(),
            header_buffer: [0u8; HEADER_SIZE],
            header_bytes_received: 0,
            body: BytesMut::new(),
            body_bytes_received: 0,
            max_data_length: DEFAULT_MAX_DATA_LENGTH,
        }
    }
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packet_type(packet_type: u32) -> Self {
        let mut message = Message::new();
        message.set_packet_type(packet_type);
        message
    }

    /// Limit on declared body lengths, capped at what the `u32` length field holds.
    pub fn with_max_data_length(mut self, max_data_length: usize) -> Self {
        self.max_data_length = max_data_length.min(u32::MAX as usize);
        self
    }

    pub fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    /// Back to the empty state; the packet type and size limit are kept.
    pub fn reset_header(&mut self) {
        self.header.body_length = 0;
        self.header_buffer = [0u8; HEADER_SIZE];
        self.header_bytes_received = 0;
        self.body = BytesMut::new();
        self.body_bytes_received = 0;
    }

    pub fn set_packet_type(&mut self, packet_type: u32) {
        self.header.packet_type = packet_type;
        self.header_buffer[..4].copy_from_slice(&packet_type.to_be_bytes());
    }

    pub fn packet_type(&self) -> u32 {
        self.header.packet_type
    }

    pub fn header(&self) -> Header {
        self.header
    }

    /// Appends the wire form of `value` to the body.
    pub fn insert<T: WireEncode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.body);
        self.body_bytes_received = self.body.len();
        self
    }

    /// Seals the header with the current body size; call after the last `insert`.
    pub fn update_size(&mut self) -> AppResult<()> {
        let body_length = self.body.len();
        if body_length > self.max_data_length {
            return Err(AppError::InvalidValue(format!(
                "message body of {} bytes exceeds the limit of {}",
                body_length, self.max_data_length
            )));
        }
        self.header.body_length = u32::try_from(body_length).map_err(|_| {
            AppError::InvalidValue(format!(
                "message body of {} bytes does not fit the length field",
                body_length
            ))
        })?;
        self.header_buffer = self.header.to_bytes();
        self.header_bytes_received = HEADER_SIZE;
        self.body_bytes_received = body_length;
        Ok(())
    }

    pub fn header_complete(&self) -> bool {
        self.header_bytes_received == HEADER_SIZE
    }

    pub fn data_complete(&self) -> bool {
        self.header_complete() && self.body_bytes_received == self.header.body_length as usize
    }

    pub fn is_complete(&self) -> bool {
        self.data_complete()
    }

    pub fn data_length(&self) -> usize {
        self.header.body_length as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.body
    }

    /// Consumes bytes of the wire form until this message is complete.
    ///
    /// Returns how many bytes of `bytes` were taken; anything past the end of
    /// this message is left for the next one.
    pub fn feed(&mut self, mut bytes: &[u8]) -> AppResult<usize> {
        let mut consumed = 0;

        if !self.header_complete() {
            let wanted = HEADER_SIZE - self.header_bytes_received;
            let take = wanted.min(bytes.len());
            self.header_buffer[self.header_bytes_received..self.header_bytes_received + take]
                .copy_from_slice(&bytes[..take]);
            self.header_bytes_received += take;
            consumed += take;
            bytes = &bytes[take..];

            if !self.header_complete() {
                return Ok(consumed);
            }
            self.header = Header::from_bytes(&self.header_buffer);
            let body_length = self.header.body_length as usize;
            if body_length > self.max_data_length {
                return Err(AppError::MalformedProtocol(format!(
                    "declared body length {} exceeds the limit of {}",
                    body_length, self.max_data_length
                )));
            }
            trace!(
                packet_type = self.header.packet_type,
                body_length,
                "message header complete"
            );
            self.body = BytesMut::with_capacity(body_length);
            self.body_bytes_received = 0;
        }

        let wanted = self.header.body_length as usize - self.body_bytes_received;
        let take = wanted.min(bytes.len());
        self.body.extend_from_slice(&bytes[..take]);
        self.body_bytes_received += take;
        consumed += take;
        Ok(consumed)
    }

    /// Header and body as shared buffers. The message must be complete.
    pub fn to_buffers(&self) -> AppResult<EncodedMessage> {
        if !self.is_complete() {
            return Err(AppError::IllegalState(
                "only a complete message can be encoded".into(),
            ));
        }
        Ok(EncodedMessage {
            header: Bytes::copy_from_slice(&self.header.to_bytes()),
            body: Bytes::copy_from_slice(&self.body),
        })
    }
}
