//! Defines how `Message`s are framed and serialized on the wire.
use crate::error::StoreError;
use crate::network::{FramedStream, Message, MessageCodec};
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME_SIZE: usize = 1_073_741_824; // 1 GB

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(msg_id: usize, sender_id: usize, target_id: usize, msg: T) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T> MessageCodec<T> {
    /// Creates a new `MessageCodec`
    pub(crate) fn new() -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec,
        }
    }

    /// Turns this codec into one for messages of type `U`, keeping the state
    /// of the underlying length delimited codec. Used to switch a connection
    /// from `ControlMsg`s to data messages once the introduction is done.
    pub(crate) fn retype<U>(self) -> MessageCodec<U> {
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec: self.codec,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = StoreError;
    /// Decodes a message by reading the length of the message (at the start of
    /// a frame) and then reading that many bytes from a buffer to complete the
    /// frame.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = StoreError;
    /// Encodes a message by writing the length of the serialized message at
    /// the start of a frame, and then writing that many bytes into a buffer
    /// to be sent.
    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}

/// Reads the next message from the given `reader`
pub(crate) async fn read_msg<T: DeserializeOwned>(
    reader: &mut FramedStream<T>,
) -> Result<Message<T>, StoreError> {
    match reader.next().await {
        None => Err(StoreError::StreamClosed),
        Some(x) => x,
    }
}
