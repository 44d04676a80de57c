use anyhow::{anyhow, Context};
use std::env::var;
use std::path::PathBuf;
use std::str::FromStr;
use votechain::*;

/// Node configuration, read from `VOTECHAIN_*` environment variables
pub struct NodeConfig {
    pub node_id: String,

    /// Address and port the HTTP API binds to
    pub address: String,
    pub port: u16,

    /// URL peers reach us at. Defaults to `http://localhost:<port>`.
    pub url: Option<String>,

    /// Our authority signing key. Without one the node only relays and verifies.
    pub authority: Option<AuthorityKeyPair>,

    pub authorities: AuthoritySet,

    /// Peers to introduce ourselves to at startup
    pub peers: Vec<String>,

    pub consensus: ConsensusConfig,

    pub mix: MixConfig,

    /// Where blocks are persisted. Blocks are kept in memory only if unset.
    pub chain_path: Option<PathBuf>,

    /// JSON file listing the elections (and their voters) this node serves
    pub elections_path: Option<PathBuf>,
}

/// An election and the voters registered for it, as stored in the elections file
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSetup {
    pub election: ElectionParams,

    #[serde(default)]
    pub voters: Vec<RegisteredVoter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredVoter {
    pub identity: String,
    pub public_key: VoterPublicKey,
}

impl NodeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let node_id = var("VOTECHAIN_NODE_ID").unwrap_or_else(|_| "node".to_owned());

        let authority = match var("VOTECHAIN_SECRET_KEY") {
            Ok(val) => Some(
                AuthorityKeyPair::from_secret_hex(&node_id, &val)
                    .context("VOTECHAIN_SECRET_KEY must be a hex ed25519 secret key")?,
            ),
            Err(_e) => None,
        };

        let mut authorities = AuthoritySet::default();
        for entry in list("VOTECHAIN_AUTHORITIES") {
            let info = AuthorityInfo::parse(&entry)
                .with_context(|| format!("bad VOTECHAIN_AUTHORITIES entry {}", entry))?;
            authorities.insert(info);
        }

        // Assume that WE are the only authority if none were listed
        if authorities.is_empty() {
            if let Some(authority) = &authority {
                authorities.insert(authority.info());
            }
        }

        let defaults = ConsensusConfig::default();
        let consensus = ConsensusConfig {
            required_signatures: parsed("VOTECHAIN_REQUIRED_SIGNATURES", defaults.required_signatures)?,
            quorum_timeout_ms: parsed("VOTECHAIN_QUORUM_TIMEOUT_MS", defaults.quorum_timeout_ms)?,
            difficulty: parsed("VOTECHAIN_DIFFICULTY", defaults.difficulty)?,
            peer_timeout_ms: parsed("VOTECHAIN_PEER_TIMEOUT_MS", defaults.peer_timeout_ms)?,
            ..defaults
        };
        if consensus.difficulty > MAX_DIFFICULTY {
            return Err(anyhow!(
                "VOTECHAIN_DIFFICULTY must be at most {}",
                MAX_DIFFICULTY
            ));
        }

        let defaults = MixConfig::default();
        let mix = MixConfig {
            batch_size: parsed("VOTECHAIN_MIX_BATCH_SIZE", defaults.batch_size)?,
            max_wait_secs: parsed("VOTECHAIN_MIX_MAX_WAIT_SECS", defaults.max_wait_secs)?,
            ..defaults
        };
        if mix.batch_size == 0 {
            return Err(anyhow!("VOTECHAIN_MIX_BATCH_SIZE must be at least 1"));
        }

        Ok(NodeConfig {
            node_id,
            address: var("VOTECHAIN_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_owned()),
            port: parsed("VOTECHAIN_PORT", 3000)?,
            url: var("VOTECHAIN_URL").ok(),
            authority,
            authorities,
            peers: list("VOTECHAIN_PEERS"),
            consensus,
            mix,
            chain_path: var("VOTECHAIN_CHAIN_PATH").ok().map(PathBuf::from),
            elections_path: var("VOTECHAIN_ELECTIONS_PATH").ok().map(PathBuf::from),
        })
    }

    pub fn url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    pub fn into_settings(self) -> NodeSettings {
        let mut settings = NodeSettings::new(&self.node_id, &self.url());
        settings.authority = self.authority;
        settings.authorities = self.authorities;
        settings.consensus = self.consensus;
        settings.mix = self.mix;
        settings
    }

    pub fn block_store(&self) -> std::sync::Arc<dyn BlockStore> {
        match &self.chain_path {
            Some(path) => std::sync::Arc::new(JsonFileStore::new(path.clone())),
            None => std::sync::Arc::new(MemStore::default()),
        }
    }

    pub fn elections(&self) -> anyhow::Result<Vec<ElectionSetup>> {
        let path = match &self.elections_path {
            Some(path) => path,
            None => return Ok(vec![]),
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("unable to parse elections in {}", path.display()))
    }
}

fn list(name: &str) -> Vec<String> {
    var(name)
        .map(|val| {
            val.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, val)),
        Err(_e) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_split_and_trimmed() {
        std::env::set_var("VOTECHAIN_TEST_LIST", " http://a:3000, ,http://b:3000 ");
        assert_eq!(
            list("VOTECHAIN_TEST_LIST"),
            vec!["http://a:3000".to_string(), "http://b:3000".to_string()]
        );
        assert!(list("VOTECHAIN_TEST_UNSET").is_empty());
    }

    #[test]
    fn numbers_fall_back_to_defaults() {
        std::env::set_var("VOTECHAIN_TEST_NUMBER", "7");
        assert_eq!(parsed("VOTECHAIN_TEST_NUMBER", 1usize).unwrap(), 7);
        assert_eq!(parsed("VOTECHAIN_TEST_MISSING", 1usize).unwrap(), 1);

        std::env::set_var("VOTECHAIN_TEST_BAD_NUMBER", "seven");
        assert!(parsed("VOTECHAIN_TEST_BAD_NUMBER", 1usize).is_err());
    }

    #[test]
    fn difficulty_is_bounded_by_hash_length() {
        std::env::set_var("VOTECHAIN_DIFFICULTY", (MAX_DIFFICULTY + 1).to_string());
        let result = NodeConfig::from_env();
        std::env::remove_var("VOTECHAIN_DIFFICULTY");
        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("VOTECHAIN_DIFFICULTY must be at most 64"));
    }
}
