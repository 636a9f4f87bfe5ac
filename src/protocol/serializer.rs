use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::message::Message;

#[async_trait]
pub trait Serialize: Sized {
    type Error;

    /// Serialize a structure into a writer
    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("The payload is too long!")]
    TooLong,

    #[error("{0}")]
    Io(#[from] tokio::io::Error),
}

#[async_trait]
impl Serialize for Message {
    type Error = SerializeError;

    /// Writes a whole frame: type, little-endian payload length and the payload itself
    ///
    /// a peer that stops accepting bytes surfaces as an Io error (WriteZero / BrokenPipe)
    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        let payload = self.payload();
        let length: u32 = payload
            .len()
            .try_into()
            .map_err(|_| SerializeError::TooLong)?;

        writer.write_u8(self.message_type()).await?;
        writer.write_u32_le(length).await?;
        writer.write_all(payload.as_bytes()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{
        message::{tests::bet, Batch, Message, Response},
        serializer::Serialize,
    };

    #[tokio::test]
    async fn serialize_messages() {
        let values = [
            Message::Finished { agency: "1".into() },
            Message::WinnersQuery {
                agency: "12".into(),
            },
            Message::Response(Response::success("ok")),
            Message::Response(Response::failure("bad")),
            Message::Winners { documents: vec![] },
            Message::Winners {
                documents: vec!["30904465".into(), "25123456".into()],
            },
            Message::Batch(Batch {
                agency: "1".into(),
                bets: vec![bet("1", "30904465", "7574")],
            }),
        ];

        let mut serialized_values = Vec::with_capacity(values.len());
        for value in values {
            let mut raw = vec![];
            value.serialize(&mut raw).await.unwrap();
            serialized_values.push(raw);
        }

        let expected_values: [&[u8]; 7] = [
            b"\x03\x01\x00\x00\x001",
            b"\x04\x02\x00\x00\x0012",
            b"\x02\x07\x00\x00\x00true|ok",
            b"\x02\x09\x00\x00\x00false|bad",
            b"\x05\x00\x00\x00\x00",
            b"\x05\x11\x00\x00\x0030904465|25123456",
            b"\x01\x33\x00\x00\x001||1|Santiago Lionel|Lorca|30904465|1999-03-17|7574",
        ];

        assert_eq!(serialized_values, expected_values)
    }

    #[tokio::test]
    async fn serialize_fails_on_closed_peer() {
        let (mut writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let result = Message::Finished { agency: "1".into() }
            .serialize(&mut writer)
            .await;

        assert!(result.is_err());
    }
}
