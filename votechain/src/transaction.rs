use crate::*;
use content_inspector::ContentType;

/// A pending transaction, as gossiped between nodes before it is sealed into a block
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Transaction {
    Ballot(Ballot),
}

impl Transaction {
    /// Parse a transaction from JSON or CBOR bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        match content_inspector::inspect(bytes) {
            ContentType::UTF_8 => Ok(serde_json::from_slice(bytes)?),
            ContentType::BINARY => Ok(serde_cbor::from_slice(bytes)?),
            _ => Err(Error::DeserializationUnknownFormat),
        }
    }
}

impl From<Ballot> for Transaction {
    fn from(ballot: Ballot) -> Self {
        Transaction::Ballot(ballot)
    }
}

/// The payload of a block, stored as JSON in `Block::data`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum BlockData {
    Genesis { message: String },
    Ballots { ballots: Vec<Ballot> },
}

impl BlockData {
    pub fn ballots(&self) -> &[Ballot] {
        match self {
            BlockData::Genesis { .. } => &[],
            BlockData::Ballots { ballots } => ballots,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }
}
