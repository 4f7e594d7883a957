use crate::models::Frame;
use crate::{AmqpError, AmqpResult};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Length-prefixed frame codec.
///
/// Each frame is a four byte big-endian length followed by the serialized
/// frame body. Frames longer than the configured maximum are refused on
/// both encode and decode.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size as usize)
            .new_codec();
        Self {
            inner,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Applies a new limit to frames encoded and decoded from now on.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.inner.set_max_frame_length(max_frame_size as usize);
        self.max_frame_size = max_frame_size;
    }

    pub fn encode_to_bytes(frame: &Frame) -> AmqpResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(frame)?))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AmqpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, AmqpError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AmqpError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), AmqpError> {
        let body = Self::encode_to_bytes(&frame)?;
        if body.len() as u64 > u64::from(self.max_frame_size) {
            return Err(AmqpError::Protocol(format!(
                "frame of {} bytes exceeds max frame size {}",
                body.len(),
                self.max_frame_size
            )));
        }
        self.inner.encode(body, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Close, Performative, ProtocolId};

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut codec = FrameCodec::new(u32::MAX);
        let mut buffer = BytesMut::new();
        codec
            .encode(Frame::Header(ProtocolId::Amqp), &mut buffer)
            .unwrap();

        let mut partial = buffer.split_to(buffer.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buffer);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Frame::Header(ProtocolId::Amqp))
        );
    }

    #[test]
    fn test_lowered_limit_applies_to_both_directions() {
        let mut wide = FrameCodec::new(u32::MAX);
        let mut buffer = BytesMut::new();
        let frame = Frame::amqp(0, Performative::Close(Close { error: None }));
        wide.encode(frame.clone(), &mut buffer).unwrap();

        let mut codec = FrameCodec::new(u32::MAX);
        codec.set_max_frame_size(8);
        assert_eq!(codec.max_frame_size(), 8);
        assert!(codec.encode(frame, &mut BytesMut::new()).is_err());
        assert!(codec.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let mut codec = FrameCodec::new(8);
        let mut buffer = BytesMut::new();
        let frame = Frame::amqp(0, Performative::Close(Close { error: None }));
        assert!(matches!(
            codec.encode(frame, &mut buffer),
            Err(AmqpError::Protocol(_))
        ));
    }
}
