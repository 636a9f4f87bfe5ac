use std::{fmt, str::FromStr};

pub mod message_type {
    pub const BATCH: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const FINISHED: u8 = 3;
    pub const WINNERS_QUERY: u8 = 4;
    pub const WINNERS: u8 = 5;

    pub fn is_known(ty: u8) -> bool {
        (BATCH..=WINNERS).contains(&ty)
    }
}

const FIELD_SEPARATOR: char = '|';
const AGENCY_SEPARATOR: &str = "||";
const BET_SEPARATOR: &str = ";;";
const BET_FIELD_COUNT: usize = 6;

const SUCCESS_FLAG: &str = "true";
const FAILURE_FLAG: &str = "false";

#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("payload is not valid utf-8: {0}")]
    Utf(#[from] std::string::FromUtf8Error),

    #[error("a bet has 6 fields, received {0}")]
    BetFieldCount(usize),

    #[error("a bet is missing its document")]
    MissingDocument,

    #[error("the batch is missing its agency")]
    MissingAgency,

    #[error("the response is missing its success flag")]
    MissingFlag,

    #[error("unknown success flag: {0}")]
    UnknownFlag(String),
}

/// A single bet, as placed by a gambler at an agency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: String,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: String,
    pub number: String,
}

impl Bet {
    /// Build a bet out of its fields, in wire order
    ///
    /// returns None unless exactly six fields are given
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut fields = fields.into_iter().map(str::to_owned);
        let bet = Self {
            agency: fields.next()?,
            first_name: fields.next()?,
            last_name: fields.next()?,
            document: fields.next()?,
            birthdate: fields.next()?,
            number: fields.next()?,
        };

        match fields.next() {
            Some(_) => None,
            None => Some(bet),
        }
    }

    pub fn fields(&self) -> [&str; BET_FIELD_COUNT] {
        [
            &self.agency,
            &self.first_name,
            &self.last_name,
            &self.document,
            &self.birthdate,
            &self.number,
        ]
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields().join("|"))
    }
}

impl FromStr for Bet {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bet = Self::from_fields(s.split(FIELD_SEPARATOR))
            .ok_or_else(|| PayloadError::BetFieldCount(s.split(FIELD_SEPARATOR).count()))?;

        // documents identify the winners, an empty one can't be sent back
        match bet.document.trim().is_empty() {
            true => Err(PayloadError::MissingDocument),
            false => Ok(bet),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub agency: String,
    pub bets: Vec<Bet>,
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bets: Vec<String> = self.bets.iter().map(Bet::to_string).collect();
        write!(f, "{}{}{}", self.agency, AGENCY_SEPARATOR, bets.join(BET_SEPARATOR))
    }
}

impl FromStr for Batch {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agency, bets) = s
            .split_once(AGENCY_SEPARATOR)
            .ok_or(PayloadError::MissingAgency)?;

        // an agency may legitimately send a batch without bets
        let bets = match bets.is_empty() {
            true => vec![],
            false => bets
                .split(BET_SEPARATOR)
                .map(str::parse)
                .collect::<Result<_, _>>()?,
        };

        Ok(Self {
            agency: agency.to_owned(),
            bets,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
    pub message: String,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self.success {
            true => SUCCESS_FLAG,
            false => FAILURE_FLAG,
        };
        write!(f, "{}{}{}", flag, FIELD_SEPARATOR, self.message)
    }
}

impl FromStr for Response {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (flag, message) = s
            .split_once(FIELD_SEPARATOR)
            .ok_or(PayloadError::MissingFlag)?;

        let success = match flag {
            SUCCESS_FLAG => true,
            FAILURE_FLAG => false,
            _ => return Err(PayloadError::UnknownFlag(flag.to_owned())),
        };

        Ok(Self {
            success,
            message: message.to_owned(),
        })
    }
}

/// Every message that can travel between an agency and the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Batch(Batch),
    Response(Response),
    Finished { agency: String },
    WinnersQuery { agency: String },
    /// an empty payload is an empty list, so a lone empty document doesn't survive the wire
    Winners { documents: Vec<String> },
}

impl Message {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Batch(_) => message_type::BATCH,
            Self::Response(_) => message_type::RESPONSE,
            Self::Finished { .. } => message_type::FINISHED,
            Self::WinnersQuery { .. } => message_type::WINNERS_QUERY,
            Self::Winners { .. } => message_type::WINNERS,
        }
    }

    // the textual payload that follows the frame header
    pub(super) fn payload(&self) -> String {
        match self {
            Self::Batch(batch) => batch.to_string(),
            Self::Response(response) => response.to_string(),
            Self::Finished { agency } | Self::WinnersQuery { agency } => agency.clone(),
            Self::Winners { documents } => documents.join("|"),
        }
    }

    // parse the payload of a frame whose type is already known to be valid
    pub(super) fn from_payload(ty: u8, payload: &str) -> Option<Result<Self, PayloadError>> {
        let message = match ty {
            message_type::BATCH => payload.parse().map(Self::Batch),
            message_type::RESPONSE => payload.parse().map(Self::Response),
            message_type::FINISHED => Ok(Self::Finished {
                agency: payload.to_owned(),
            }),
            message_type::WINNERS_QUERY => Ok(Self::WinnersQuery {
                agency: payload.to_owned(),
            }),
            message_type::WINNERS => Ok(Self::Winners {
                documents: match payload.is_empty() {
                    true => vec![],
                    false => payload.split(FIELD_SEPARATOR).map(str::to_owned).collect(),
                },
            }),
            _ => return None,
        };

        Some(message)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Batch> for Message {
    fn from(batch: Batch) -> Self {
        Self::Batch(batch)
    }
}
