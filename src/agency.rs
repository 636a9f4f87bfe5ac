use std::path::PathBuf;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
};

use crate::protocol::{
    deserializer::{Deserialize, DeserializeError},
    message::{Batch, Bet, Message},
    serializer::{Serialize, SerializeError},
};

// keep every batch within a single 8kB payload
const MAX_BATCH_PAYLOAD: usize = 8 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum AgencyError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("{0}")]
    Serialize(#[from] SerializeError),

    #[error("{0}")]
    Deserialize(#[from] DeserializeError),

    #[error("line {0} of the bets file is malformed")]
    MalformedBet(usize),

    #[error("the server closed the connection")]
    Closed,

    #[error("the server rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected message from the server: {0:?}")]
    Unexpected(Message),
}

/// Parses an agency's bets file, one `first,last,document,birthdate,number` bet per line
pub fn parse_bets(agency: &str, content: &str) -> Result<Vec<Bet>, AgencyError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let fields = std::iter::once(agency).chain(line.trim().split(','));
            Bet::from_fields(fields).ok_or(AgencyError::MalformedBet(idx + 1))
        })
        .collect()
}

/// Splits the bets into batches of at most `max_amount` bets,
/// that also fit within the maximum batch payload
pub fn into_batches(agency: &str, bets: Vec<Bet>, max_amount: usize) -> Vec<Batch> {
    let max_amount = max_amount.max(1);
    let empty_size = agency.len() + 2;

    let mut batches = vec![];
    let mut current = Batch {
        agency: agency.to_owned(),
        bets: vec![],
    };
    let mut size = empty_size;

    for bet in bets {
        let bet_size = bet.to_string().len() + 2;
        let is_full = current.bets.len() >= max_amount || size + bet_size > MAX_BATCH_PAYLOAD;

        // a single oversized bet still gets its own batch
        if is_full && !current.bets.is_empty() {
            batches.push(std::mem::replace(
                &mut current,
                Batch {
                    agency: agency.to_owned(),
                    bets: vec![],
                },
            ));
            size = empty_size;
        }

        size += bet_size;
        current.bets.push(bet);
    }

    if !current.bets.is_empty() {
        batches.push(current);
    }

    batches
}

/// The submitting side of a lottery round
#[derive(Debug, Clone)]
pub struct Agency {
    id: String,
    server: String,
    bets_file: PathBuf,
    batch_max_amount: usize,
}

impl Agency {
    pub fn new(
        id: String,
        server: String,
        bets_file: impl Into<PathBuf>,
        batch_max_amount: usize,
    ) -> Self {
        Self {
            id,
            server,
            bets_file: bets_file.into(),
            batch_max_amount,
        }
    }

    /// Submits every bet in the agency's file, and returns the agency's winners
    pub async fn run(&self) -> Result<Vec<String>, AgencyError> {
        let content = tokio::fs::read_to_string(&self.bets_file).await?;
        let bets = parse_bets(&self.id, &content)?;
        tracing::info!(
            "agency {} loaded {} bets from {}",
            self.id,
            bets.len(),
            self.bets_file.display()
        );

        let stream = TcpStream::connect(&self.server).await?;
        tracing::info!("agency {} connected to {}", self.id, self.server);

        self.submit(stream, bets).await
    }

    /// Runs the whole round over an already established connection
    pub async fn submit<S>(&self, stream: S, bets: Vec<Bet>) -> Result<Vec<String>, AgencyError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        };

        for batch in into_batches(&self.id, bets, self.batch_max_amount) {
            let count = batch.bets.len();
            conn.expect_success(batch.into()).await?;
            tracing::info!("agency {} sent a batch of {} bets", self.id, count);
        }

        conn.expect_success(Message::Finished {
            agency: self.id.clone(),
        })
        .await?;
        tracing::info!("agency {} finished submitting bets", self.id);

        let response = conn
            .request(Message::WinnersQuery {
                agency: self.id.clone(),
            })
            .await?;

        match response {
            Message::Winners { documents } => {
                tracing::info!(
                    "action: consulta_ganadores | result: success | agency: {} | cant_ganadores: {}",
                    self.id,
                    documents.len()
                );
                tracing::debug!("agency {} winners: {:?}", self.id, documents);
                Ok(documents)
            }
            other => Err(AgencyError::Unexpected(other)),
        }
    }
}

struct Connection<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn request(&mut self, message: Message) -> Result<Message, AgencyError> {
        message.serialize(&mut self.writer).await?;
        self.writer.flush().await?;

        Message::deserialize(&mut self.reader)
            .await?
            .ok_or(AgencyError::Closed)
    }

    async fn expect_success(&mut self, message: Message) -> Result<(), AgencyError> {
        match self.request(message).await? {
            Message::Response(response) if response.success => Ok(()),
            Message::Response(response) => Err(AgencyError::Rejected(response.message)),
            other => Err(AgencyError::Unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{into_batches, parse_bets, AgencyError, MAX_BATCH_PAYLOAD};
    use crate::protocol::message::tests::bet;

    #[test]
    fn check_bets_file_parsing() {
        let content = "Santiago Lionel,Lorca,30904465,1999-03-17,7574\n\nSantiago Lionel,Lorca,25123456,1999-03-17,1234\r\n";
        let bets = parse_bets("1", content).unwrap();

        assert_eq!(
            bets,
            [bet("1", "30904465", "7574"), bet("1", "25123456", "1234")]
        );
    }

    #[test]
    fn check_bad_bets_file_parsing() {
        let content = "Santiago Lionel,Lorca,30904465,1999-03-17,7574\nSantiago Lionel,Lorca\n";

        assert!(matches!(
            parse_bets("1", content),
            Err(AgencyError::MalformedBet(2))
        ));
    }

    #[test]
    fn batches_respect_the_amount_limit() {
        let bets: Vec<_> = (0..7).map(|idx| bet("1", &idx.to_string(), "1")).collect();
        let batches = into_batches("1", bets.clone(), 3);

        let sizes: Vec<_> = batches.iter().map(|batch| batch.bets.len()).collect();
        assert_eq!(sizes, [3, 3, 1]);

        // nothing is lost or reordered
        let rebuilt: Vec<_> = batches.into_iter().flat_map(|batch| batch.bets).collect();
        assert_eq!(rebuilt, bets);
    }

    #[test]
    fn batches_respect_the_payload_limit() {
        let bets: Vec<_> = (0..1000)
            .map(|idx| bet("1", &idx.to_string(), "1"))
            .collect();
        let batches = into_batches("1", bets, 1000);

        assert!(batches.len() > 1);
        for batch in batches {
            assert!(batch.to_string().len() <= MAX_BATCH_PAYLOAD);
        }
    }

    #[test]
    fn no_bets_means_no_batches() {
        assert!(into_batches("1", vec![], 10).is_empty());
    }
}
