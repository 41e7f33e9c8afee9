//! Length-delimited bincode framing for [`Message`]s.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::core::message::Message;

/// Frames messages as a length prefix followed by their bincode encoding.
pub struct MessageCodec {
    codec: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::new(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((message, _length)) => Ok(Some(message)),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.codec.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;
    use crate::core::{
        id::Id,
        message::{Found, Ping},
        record::{Record, StoredRecord},
        routing_table::PeerRecord,
    };

    #[test]
    fn codec_ping() {
        let mut rng = thread_rng();

        let message = Message::Ping(Ping {
            nonce: rng.gen(),
            sender: PeerRecord::new(Id::rand(), "127.0.0.1:4000"),
        });

        let mut codec = MessageCodec::new();
        let mut dst = BytesMut::new();

        assert!(codec.encode(message.clone(), &mut dst).is_ok());
        assert_eq!(codec.decode(&mut dst).unwrap().unwrap(), message);
    }

    #[test]
    fn codec_found_with_records() {
        let message = Message::Found(Found {
            nonce: 9,
            values: vec![StoredRecord {
                record: Record::new("signature", 1_700_000_000, "payload"),
                deleted: true,
            }],
        });

        let mut codec = MessageCodec::new();
        let mut dst = BytesMut::new();

        codec.encode(message.clone(), &mut dst).unwrap();
        assert_eq!(codec.decode(&mut dst).unwrap(), Some(message));
        assert!(dst.is_empty());
    }

    #[test]
    fn codec_partial_frame() {
        let message = Message::Ping(Ping {
            nonce: 1,
            sender: PeerRecord::new(Id::from_u16(1), "127.0.0.1:4000"),
        });

        let mut codec = MessageCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(message, &mut dst).unwrap();

        let mut partial = dst.split_to(dst.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn codec_garbage_is_invalid_data() {
        let mut codec = MessageCodec::new();
        let mut dst = BytesMut::new();

        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(&[0xff, 0xff, 0xff]), &mut dst)
            .unwrap();

        let err = codec.decode(&mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
