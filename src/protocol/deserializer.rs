use async_trait::async_trait;
use tokio::io::{AsyncReadExt, ErrorKind};

use super::{
    message::{message_type, Message, PayloadError},
    MAX_PAYLOAD_LEN,
};

#[async_trait]
pub trait Deserialize: Sized {
    type Error;

    // Deserialize a structure from a reader
    //
    // returns None when the reader reaches EOF before a whole structure was read
    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Option<Self>, Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializeError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Payload of {0} bytes is too long")]
    TooLong(usize),

    #[error("{0}")]
    Payload(#[from] PayloadError),
}

impl DeserializeError {
    /// Whether the frame was consumed whole, leaving the stream in sync
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Payload(_))
    }
}

// fill the entire buffer, returns false if EOF was reached first
async fn read_frame_part<R: AsyncReadExt + Unpin + Send>(
    reader: &mut R,
    buf: &mut [u8],
) -> tokio::io::Result<bool> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Deserialize for Message {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Option<Self>, Self::Error> {
        let mut ty = [0u8; 1];
        if !read_frame_part(reader, &mut ty).await? {
            return Ok(None);
        }

        // an unknown type leaves us with no way of knowing where the next frame starts
        let ty = ty[0];
        if !message_type::is_known(ty) {
            return Err(DeserializeError::UnknownType(ty));
        }

        let mut length = [0u8; 4];
        if !read_frame_part(reader, &mut length).await? {
            return Ok(None);
        }

        let length = u32::from_le_bytes(length) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(DeserializeError::TooLong(length));
        }

        let mut payload = vec![0u8; length];
        if !read_frame_part(reader, &mut payload).await? {
            return Ok(None);
        }

        let payload = String::from_utf8(payload).map_err(PayloadError::from)?;
        match Message::from_payload(ty, &payload) {
            Some(message) => Ok(Some(message?)),
            None => Err(DeserializeError::UnknownType(ty)),
        }
    }
}
