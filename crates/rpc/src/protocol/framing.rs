//! Message framing for the wire protocol.

use crate::error::{ConfigError, ProtocolError};

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame a 2-byte length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Length prefix size.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Default delimiter for delimited framing.
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// How a byte stream is split into messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Each frame is preceded by its length as a big-endian `u16`.
    LengthPrefixed {
        /// Largest accepted payload.
        max_frame_size: usize,
    },
    /// Each frame is terminated by a delimiter byte that never occurs in a payload.
    ///
    /// Only the text protocol can guarantee that.
    Delimited {
        /// Terminator.
        delimiter: u8,
        /// Largest accepted payload, delimiter excluded.
        max_frame_size: usize,
    },
}

impl Framing {
    /// Length-prefixed framing with the largest frame size.
    #[must_use]
    pub const fn length_prefixed() -> Self {
        Self::LengthPrefixed {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Newline-delimited framing.
    #[must_use]
    pub const fn delimited() -> Self {
        Self::Delimited {
            delimiter: DEFAULT_DELIMITER,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Largest accepted payload.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        match self {
            Self::LengthPrefixed { max_frame_size } | Self::Delimited { max_frame_size, .. } => {
                *max_frame_size
            }
        }
    }

    /// Checks the bound is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the bound is zero or, for length-prefixed framing,
    /// larger than the prefix can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.max_frame_size();
        if max == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_frame_size",
                reason: "must be at least one byte".to_string(),
            });
        }
        if matches!(self, Self::LengthPrefixed { .. }) && max > MAX_FRAME_SIZE {
            return Err(ConfigError::InvalidSetting {
                name: "max_frame_size",
                reason: format!("{max} does not fit a {LENGTH_PREFIX_SIZE}-byte length prefix"),
            });
        }
        Ok(())
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self::length_prefixed()
    }
}

fn invalid_data(err: ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Codec splitting a stream into frames and joining frames into a stream.
pub struct FrameCodec {
    framing: Framing,
    // Where the next delimiter search resumes.
    next_index: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new(framing: Framing) -> Self {
        Self {
            framing,
            next_index: 0,
        }
    }

    fn decode_length_prefixed(
        buf: &mut BytesMut,
        max_frame_size: usize,
    ) -> io::Result<Option<Bytes>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..LENGTH_PREFIX_SIZE];
        let payload_len = header.get_u16() as usize;

        if payload_len > max_frame_size {
            return Err(invalid_data(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: max_frame_size,
            }));
        }

        let frame_len = LENGTH_PREFIX_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(payload_len).freeze()))
    }

    fn decode_delimited(
        &mut self,
        buf: &mut BytesMut,
        delimiter: u8,
        max_frame_size: usize,
    ) -> io::Result<Option<Bytes>> {
        loop {
            let found = buf[self.next_index..]
                .iter()
                .position(|b| *b == delimiter)
                .map(|offset| self.next_index + offset);

            let Some(end) = found else {
                if buf.len() > max_frame_size {
                    return Err(invalid_data(ProtocolError::FrameTooLarge {
                        size: buf.len(),
                        max: max_frame_size,
                    }));
                }
                self.next_index = buf.len();
                return Ok(None);
            };

            self.next_index = 0;
            if end > max_frame_size {
                return Err(invalid_data(ProtocolError::FrameTooLarge {
                    size: end,
                    max: max_frame_size,
                }));
            }

            let frame = buf.split_to(end).freeze();
            buf.advance(1);
            // Blank lines between messages are skipped.
            if !frame.is_empty() {
                return Ok(Some(frame));
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::LengthPrefixed { max_frame_size } => {
                Self::decode_length_prefixed(buf, max_frame_size)
            }
            Framing::Delimited {
                delimiter,
                max_frame_size,
            } => self.decode_delimited(buf, delimiter, max_frame_size),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = payload.len();
        let max_frame_size = self.framing.max_frame_size();

        if payload_len > max_frame_size {
            return Err(invalid_data(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: max_frame_size,
            }));
        }

        match self.framing {
            Framing::LengthPrefixed { .. } => {
                let len = u16::try_from(payload_len).map_err(|_| {
                    invalid_data(ProtocolError::FrameTooLarge {
                        size: payload_len,
                        max: MAX_FRAME_SIZE,
                    })
                })?;
                buf.reserve(LENGTH_PREFIX_SIZE + payload_len);
                buf.put_u16(len);
                buf.put(payload);
            }
            Framing::Delimited { delimiter, .. } => {
                if payload.contains(&delimiter) {
                    return Err(invalid_data(ProtocolError::DelimiterInPayload(delimiter)));
                }
                buf.reserve(payload_len + 1);
                buf.put(payload);
                buf.put_u8(delimiter);
            }
        }

        Ok(())
    }
}

/// Extracts the [`ProtocolError`] a frame codec failure carries, if any.
pub(crate) fn protocol_error(err: &io::Error) -> Option<ProtocolError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ProtocolError>())
        .cloned()
}
