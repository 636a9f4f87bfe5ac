use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc,
};

use crate::{
    lottery::{same_agency, Lottery, Responder},
    protocol::{
        deserializer::Deserialize,
        message::{Batch, Message, Response},
        serializer::Serialize,
    },
};

const TO_AGENCY_BUFFER_SIZE: usize = 32;

#[derive(thiserror::Error, Debug)]
pub enum CoordinationError {
    #[error("agency {agency} sent a message of type {ty} instead of its winners query")]
    UnexpectedMessage { agency: String, ty: u8 },

    #[error("agency {finished} asked for the winners of agency {queried}")]
    ForeignQuery { finished: String, queried: String },

    #[error("agency {0} disconnected before asking for its winners")]
    Disconnected(String),
}

/// Drives a single agency through the lottery round
///
/// the connection is closed once this returns, whatever the reason.
pub async fn handle<S>(stream: S, lottery: &Lottery) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);

    let (to_agency, rx) = mpsc::channel(TO_AGENCY_BUFFER_SIZE);
    let managed_writer = managed_writer(writer, rx);
    let from_agency = from_agency(reader, to_agency, lottery);

    // the writer must keep running after 'from_agency' returns, the winners
    // are delivered through the responder that was handed to the lottery
    let (r1, r2) = tokio::join!(managed_writer, from_agency);
    r1?;
    r2
}

async fn managed_writer<W: AsyncWrite + Unpin + Send>(
    mut writer: BufWriter<W>,
    mut from_server: mpsc::Receiver<Message>,
) -> anyhow::Result<()> {
    // forward all messages on the mpsc to the writer part of the socket
    while let Some(message) = from_server.recv().await {
        tracing::debug!("responded: {:?}", message);
        message.serialize(&mut writer).await?;
        writer.flush().await?;
    }

    Ok(())
}

// handle incoming messages from the agency
async fn from_agency<R: AsyncReadExt + Unpin + Send>(
    mut reader: R,
    to_agency: Responder,
    lottery: &Lottery,
) -> anyhow::Result<()> {
    let Some(agency) = submit_bets(&mut reader, &to_agency, lottery).await? else {
        return Ok(()); // the agency disconnected
    };

    lottery.wait_all_finished().await;
    lottery.run_lottery_once().await;

    let agency = wait_winners_query(&mut reader, &to_agency, lottery, &agency).await?;

    // from now on the lottery owns the only way to respond to the agency
    lottery.enqueue_query(agency, to_agency).await;
    lottery.wait_all_queried().await;
    lottery.broadcast_once().await;

    Ok(())
}

fn finished_response(agency: &str) -> Response {
    Response::success(format!("Agency {agency} finished notification received"))
}

// accept batches until the agency notifies it has finished
//
// returns the finished agency, or None if it disconnected first
async fn submit_bets<R: AsyncReadExt + Unpin + Send>(
    reader: &mut R,
    to_agency: &Responder,
    lottery: &Lottery,
) -> anyhow::Result<Option<String>> {
    loop {
        let message = match Message::deserialize(reader).await {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(reason) if reason.is_recoverable() => {
                tracing::warn!("received a malformed message: {}", reason);
                to_agency
                    .send(Response::failure(reason.to_string()).into())
                    .await?;
                continue;
            }
            Err(reason) => return Err(reason.into()),
        };

        let response = match message {
            Message::Batch(batch) => store_batch(lottery, batch).await,
            Message::Finished { agency } => {
                lottery.mark_finished(&agency).await;
                to_agency.send(finished_response(&agency).into()).await?;
                return Ok(Some(agency));
            }
            Message::WinnersQuery { agency } => {
                tracing::warn!("agency {} asked for its winners before finishing", agency);
                Response::failure("Lottery not completed yet, finish submitting bets first")
            }
            other => Response::failure(format!(
                "Unexpected message type: {}",
                other.message_type()
            )),
        };

        to_agency.send(response.into()).await?;
    }
}

async fn store_batch(lottery: &Lottery, batch: Batch) -> Response {
    let count = batch.bets.len();

    match lottery.store_bets(&batch.bets).await {
        Ok(()) => {
            tracing::info!("stored {} bets from agency {}", count, batch.agency);
            Response::success(format!("Batch of {count} bets stored successfully"))
        }
        Err(reason) => {
            tracing::error!(
                "failed to store {} bets from agency {}: {}",
                count,
                batch.agency,
                reason
            );
            Response::failure(format!("Failed to store batch: {reason}"))
        }
    }
}

// after the lottery, the only thing an agency may do is ask for its winners
async fn wait_winners_query<R: AsyncReadExt + Unpin + Send>(
    reader: &mut R,
    to_agency: &Responder,
    lottery: &Lottery,
    agency: &str,
) -> anyhow::Result<String> {
    loop {
        let message = match Message::deserialize(reader).await? {
            Some(message) => message,
            None => return Err(CoordinationError::Disconnected(agency.to_owned()).into()),
        };

        match message {
            Message::WinnersQuery { agency: queried } if same_agency(&queried, agency) => {
                tracing::info!("agency {} asked for its winners", queried);
                return Ok(queried);
            }
            Message::WinnersQuery { agency: queried } => {
                return Err(CoordinationError::ForeignQuery {
                    finished: agency.to_owned(),
                    queried,
                }
                .into())
            }
            // a repeated notification is harmless, acknowledge it again
            Message::Finished { agency: repeated } if same_agency(&repeated, agency) => {
                lottery.mark_finished(&repeated).await;
                to_agency.send(finished_response(&repeated).into()).await?;
            }
            other => {
                return Err(CoordinationError::UnexpectedMessage {
                    agency: agency.to_owned(),
                    ty: other.message_type(),
                }
                .into())
            }
        }
    }
}
