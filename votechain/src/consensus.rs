use crate::*;
use futures::stream::{Stream, StreamExt};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// When and how blocks get sealed
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Distinct authority endorsements a block needs before the proposer appends it.
    ///
    /// Quorum collection only kicks in when it is above one and at least this many authorities
    /// are known, otherwise blocks are appended immediately.
    pub required_signatures: usize,

    /// How long the proposer waits for endorsements
    pub quorum_timeout_ms: u64,

    /// Leading hex zeros required of a block hash
    pub difficulty: usize,

    pub max_ballots_per_block: usize,

    /// Bound on every single peer request
    pub peer_timeout_ms: u64,

    /// How often pending ballots are sealed
    pub seal_interval_ms: u64,

    /// How often the node pulls longer chains from its peers
    pub sync_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            required_signatures: 1,
            quorum_timeout_ms: 5000,
            difficulty: 2,
            max_ballots_per_block: 100,
            peer_timeout_ms: 3000,
            seal_interval_ms: 1000,
            sync_interval_ms: 10_000,
        }
    }
}

impl ConsensusConfig {
    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn seal_interval(&self) -> Duration {
        Duration::from_millis(self.seal_interval_ms.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

/// Holds ballots released by the mixnet until they are sealed into a block
pub struct ConsensusCoordinator {
    config: ConsensusConfig,
    pending: Mutex<VecDeque<Ballot>>,
}

impl ConsensusCoordinator {
    pub fn new(config: ConsensusConfig) -> Self {
        ConsensusCoordinator {
            config,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Whether blocks have to gather a quorum of endorsements
    pub fn requires_quorum(&self, authorities: &AuthoritySet) -> bool {
        self.config.required_signatures > 1 && authorities.len() >= self.config.required_signatures
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<VecDeque<Ballot>>, Error> {
        self.pending
            .lock()
            .map_err(|_| Error::Store("pending pool lock poisoned".to_string()))
    }

    /// Queue a mixed batch. The batch order is kept.
    pub fn submit(&self, ballots: Vec<Ballot>) -> Result<(), Error> {
        self.lock()?.extend(ballots);
        Ok(())
    }

    /// Put ballots from a failed block back at the front of the queue
    pub fn requeue(&self, ballots: Vec<Ballot>) -> Result<(), Error> {
        let mut pending = self.lock()?;
        for ballot in ballots.into_iter().rev() {
            pending.push_front(ballot);
        }
        Ok(())
    }

    /// Take up to `max_ballots_per_block` ballots for the next block
    pub fn take_batch(&self) -> Result<Vec<Ballot>, Error> {
        let mut pending = self.lock()?;
        let count = pending.len().min(self.config.max_ballots_per_block.max(1));
        Ok(pending.drain(..count).collect())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

/// Gathers endorsements for one proposed block until `required` distinct authorities have
/// vouched for it.
pub struct QuorumCollector<'a> {
    block_hash: String,
    required: usize,
    authorities: &'a AuthoritySet,
    endorsements: IndexMap<String, Endorsement>,
}

impl<'a> QuorumCollector<'a> {
    pub fn new(block_hash: &str, required: usize, authorities: &'a AuthoritySet) -> Self {
        QuorumCollector {
            block_hash: block_hash.to_string(),
            required,
            authorities,
            endorsements: IndexMap::new(),
        }
    }

    /// Record an endorsement. Returns false if it is invalid or its authority already counted.
    pub fn add(&mut self, endorsement: Endorsement) -> bool {
        if !endorsement.verify(self.authorities, &self.block_hash) {
            log::warn!(
                "ignoring invalid endorsement from {} for block {}",
                endorsement.authority_id,
                self.block_hash
            );
            return false;
        }
        if self.endorsements.contains_key(&endorsement.authority_id) {
            return false;
        }
        self.endorsements
            .insert(endorsement.authority_id.clone(), endorsement);
        true
    }

    pub fn collected(&self) -> usize {
        self.endorsements.len()
    }

    pub fn is_complete(&self) -> bool {
        self.collected() >= self.required
    }

    pub fn endorsements(&self) -> Vec<Endorsement> {
        self.endorsements.values().cloned().collect()
    }

    /// Consume peer responses until the quorum is reached, the responses run out or `timeout`
    /// elapses. Anything short of a quorum is a `ConsensusTimeout`.
    pub async fn collect<S>(
        &mut self,
        mut responses: S,
        timeout: Duration,
    ) -> Result<Vec<Endorsement>, Error>
    where
        S: Stream<Item = (String, Result<BlockResponse, Error>)> + Unpin,
    {
        let gathering = async {
            while !self.is_complete() {
                match responses.next().await {
                    Some((peer, Ok(response))) => match response.endorsement {
                        Some(endorsement) => {
                            self.add(endorsement);
                        }
                        None if response.accepted => {
                            log::debug!("{} accepted block {} without endorsing", peer, self.block_hash)
                        }
                        None => log::warn!(
                            "{} rejected block {}: {}",
                            peer,
                            self.block_hash,
                            response.reason.unwrap_or_default()
                        ),
                    },
                    Some((peer, Err(e))) => log::warn!("skipping peer {}: {}", peer, e),
                    None => break,
                }
            }
        };

        if tokio::time::timeout(timeout, gathering).await.is_err() {
            log::warn!(
                "quorum timeout for block {} after {:?}",
                self.block_hash,
                timeout
            );
        }

        if self.is_complete() {
            log::info!(
                "quorum reached for block {} ({}/{})",
                self.block_hash,
                self.collected(),
                self.required
            );
            Ok(self.endorsements())
        } else {
            Err(Error::ConsensusTimeout {
                required: self.required,
                collected: self.collected(),
            })
        }
    }
}
