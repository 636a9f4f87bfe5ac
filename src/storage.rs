use std::path::PathBuf;

use async_trait::async_trait;
use tokio::{
    fs::OpenOptions,
    io::{AsyncWriteExt, ErrorKind},
    sync::Mutex,
};

use crate::protocol::message::Bet;

const RECORD_SEPARATOR: char = ',';

/// Append-only storage for every bet received during a lottery round
#[async_trait]
pub trait BetStore: Send + Sync {
    /// Persist the bets, all of them or none
    async fn append(&self, bets: &[Bet]) -> Result<(), StoreError>;

    /// A fresh snapshot of every bet persisted so far
    async fn load_all(&self) -> Result<Vec<Bet>, StoreError>;
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("the bet record on line {0} is corrupt")]
    Corrupt(usize),

    #[error("illegal character in bet field: {0:?}")]
    IllegalField(String),
}

/// Keeps the bets in a single csv file, one bet per line
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // serializes appends, and keeps readers from observing half written batches
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::default(),
        }
    }
}

fn to_record(bet: &Bet) -> Result<String, StoreError> {
    let fields = bet.fields();
    if let Some(field) = fields
        .iter()
        .find(|field| field.contains(|c: char| c == RECORD_SEPARATOR || c == '\n' || c == '\r'))
    {
        return Err(StoreError::IllegalField(field.to_string()));
    }

    Ok(fields.join(",") + "\n")
}

#[async_trait]
impl BetStore for FileStore {
    async fn append(&self, bets: &[Bet]) -> Result<(), StoreError> {
        // encode everything up-front so a bad bet can't leave a partial batch behind
        let records = bets
            .iter()
            .map(to_record)
            .collect::<Result<String, _>>()?;

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(records.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Bet>, StoreError> {
        let _guard = self.lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            // nothing was ever stored
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                Bet::from_fields(line.split(RECORD_SEPARATOR)).ok_or(StoreError::Corrupt(idx + 1))
            })
            .collect()
    }
}
