use crate::*;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// What a voter gets back for a cast ballot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Receipt {
    /// Hex SHA-256 of the ballot
    pub ballot_hash: String,

    pub key_image: KeyImage,

    pub election_id: Uuid,

    /// Milliseconds since the unix epoch
    pub received_at: u64,
}

/// Decryption material a node holds for an election
pub enum TallyKey {
    Whole(PaillierPrivateKey),
    Threshold(ThresholdKey),
}

// Keys are retired once the final tally has been decrypted
#[derive(Default)]
struct TallyKeys {
    keys: HashMap<Uuid, TallyKey>,
    retired: HashSet<Uuid>,
}

impl TallyKeys {
    fn insert(&mut self, election_id: Uuid, key: TallyKey) -> Result<(), Error> {
        if self.retired.contains(&election_id) {
            return Err(Error::TallyFinalized(election_id));
        }
        self.keys.insert(election_id, key);
        Ok(())
    }

    fn get(&self, election_id: Uuid) -> Result<&TallyKey, Error> {
        if self.retired.contains(&election_id) {
            return Err(Error::TallyFinalized(election_id));
        }
        self.keys
            .get(&election_id)
            .ok_or(Error::NoTallyKey(election_id))
    }

    fn retire(&mut self, election_id: Uuid) {
        self.keys.remove(&election_id);
        self.retired.insert(election_id);
        log::info!("election {} tallied, decryption key retired", election_id);
    }
}

/// Everything needed to bring up a node
pub struct NodeSettings {
    pub node_id: String,

    /// URL peers reach this node at
    pub url: String,

    /// Our signing key, if we are an authority
    pub authority: Option<AuthorityKeyPair>,

    pub authorities: AuthoritySet,

    pub consensus: ConsensusConfig,

    pub mix: MixConfig,
}

impl NodeSettings {
    pub fn new(node_id: &str, url: &str) -> Self {
        NodeSettings {
            node_id: node_id.to_string(),
            url: url.to_string(),
            authority: None,
            authorities: AuthoritySet::default(),
            consensus: ConsensusConfig::default(),
            mix: MixConfig::default(),
        }
    }
}

type PeerResponses<'a> = FuturesUnordered<BoxFuture<'a, (String, Result<BlockResponse, Error>)>>;

/// One voting node: its chain, peers, mixnet and pending pool.
///
/// Nothing here is global, so several nodes can live in one process.
pub struct Node {
    id: String,
    url: String,
    ledger: Ledger,
    peers: RwLock<IndexMap<String, PeerInfo>>,
    transport: Arc<dyn PeerTransport>,
    coordinator: ConsensusCoordinator,
    mixnet: Arc<Mixnet>,
    mix_output: tokio::sync::Mutex<UnboundedReceiver<Vec<Ballot>>>,
    sealing: tokio::sync::Mutex<()>,
    elections: ElectionDirectory,
    tally_keys: Mutex<TallyKeys>,
    reserved: Mutex<HashMap<Uuid, HashSet<KeyImage>>>,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, Error> {
        let NodeSettings {
            node_id,
            url,
            authority,
            authorities,
            consensus,
            mix,
        } = settings;

        if let Some(authority) = &authority {
            match authorities.get(&authority.id) {
                Some(key) if *key == authority.public_key() => {}
                _ => log::warn!(
                    "authority key {} is not in the authority set, its blocks will be rejected",
                    authority.id
                ),
            }
        }

        let ledger = Ledger::new(store, authorities, authority, consensus.difficulty)?;
        let (mixnet, mix_output) = Mixnet::new(mix);

        Ok(Node {
            id: node_id,
            url,
            ledger,
            peers: RwLock::new(IndexMap::new()),
            transport,
            coordinator: ConsensusCoordinator::new(consensus),
            mixnet: Arc::new(mixnet),
            mix_output: tokio::sync::Mutex::new(mix_output),
            sealing: tokio::sync::Mutex::new(()),
            elections: ElectionDirectory::default(),
            tally_keys: Mutex::new(TallyKeys::default()),
            reserved: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_authority(&self) -> bool {
        self.ledger.authority().is_some()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn mixnet(&self) -> &Arc<Mixnet> {
        &self.mixnet
    }

    pub fn coordinator(&self) -> &ConsensusCoordinator {
        &self.coordinator
    }

    pub fn elections(&self) -> &ElectionDirectory {
        &self.elections
    }

    // Elections and tally keys

    pub fn add_election(&self, election: ElectionParams) -> Result<(), Error> {
        log::info!(
            "registered election {} ({} candidates)",
            election.id,
            election.candidates.len()
        );
        self.elections.insert(election)
    }

    /// Put a voter on an election's roll. Their key is only a valid ring member in that election.
    pub fn register_voter(
        &self,
        election_id: Uuid,
        identity: &str,
        public_key: VoterPublicKey,
    ) -> Result<(), Error> {
        self.elections
            .register_voter(election_id, identity, public_key)
    }

    /// Hold the whole private key for an election
    pub fn install_tally_key(
        &self,
        election_id: Uuid,
        private_key: PaillierPrivateKey,
    ) -> Result<(), Error> {
        let election = self.elections.get(election_id)?;
        if private_key.public_key() != election.encryption_key {
            return Err(Error::CryptoParameter(
                "private key does not match the election key",
            ));
        }
        self.set_tally_key(election_id, TallyKey::Whole(private_key))
    }

    /// Tally this election from partial decryptions only
    pub fn install_threshold_key(&self, election_id: Uuid, key: ThresholdKey) -> Result<(), Error> {
        let election = self.elections.get(election_id)?;
        if key.public_key != election.encryption_key {
            return Err(Error::CryptoParameter(
                "threshold key does not match the election key",
            ));
        }
        self.set_tally_key(election_id, TallyKey::Threshold(key))
    }

    fn set_tally_key(&self, election_id: Uuid, key: TallyKey) -> Result<(), Error> {
        self.tally_keys()?.insert(election_id, key)
    }

    fn tally_keys(&self) -> Result<MutexGuard<TallyKeys>, Error> {
        self.tally_keys
            .lock()
            .map_err(|_| Error::Store("tally key lock poisoned".to_string()))
    }

    // Peers

    /// How peers should know us
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            url: self.url.clone(),
            node_id: self.id.clone(),
            is_authority: self.is_authority(),
        }
    }

    pub fn register_peer(&self, peer: PeerInfo) {
        if peer.url == self.url {
            return;
        }
        if let Ok(mut peers) = self.peers.write() {
            if !peers.contains_key(&peer.url) {
                log::info!("registered peer {} at {}", peer.node_id, peer.url);
            }
            peers.insert(peer.url.clone(), peer);
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Introduce ourselves to each of `urls` and remember the ones that answer
    pub async fn connect(&self, urls: &[String]) {
        let me = self.peer_info();
        for url in urls.iter().filter(|url| **url != self.url) {
            let info = match self.transport.node_info(url).await {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("could not reach peer {}: {}", url, e);
                    continue;
                }
            };
            self.register_peer(PeerInfo {
                url: url.clone(),
                node_id: info.node_id,
                is_authority: info.is_authority,
            });
            if let Err(e) = self.transport.register_peer(url, &me).await {
                log::warn!("peer {} did not take our registration: {}", url, e);
            }
        }
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.id.clone(),
            is_authority: self.is_authority(),
            public_key: self
                .ledger
                .authority()
                .map(|authority| hex::encode(authority.public_key().as_bytes())),
            peer_count: self.peers().len(),
            chain_length: self.ledger.len(),
        }
    }

    pub fn latest_block(&self) -> Result<LatestBlock, Error> {
        let block = self.ledger.latest_block()?;
        Ok(LatestBlock {
            hash: block.hash,
            previous_hash: block.previous_hash,
            timestamp: block.timestamp,
            block_number: self.ledger.len().saturating_sub(1),
        })
    }

    pub fn chain_from(&self, start: usize) -> Result<Vec<Block>, Error> {
        self.ledger.chain_from(start)
    }

    // Ballots

    /// Validate a ballot and hand it to the mixnet, or to an authority if we are not one.
    ///
    /// A ballot whose key image is already on chain or already queued here is a double vote.
    pub async fn cast_ballot(&self, ballot: Ballot) -> Result<Receipt, Error> {
        let election = self.elections.get(ballot.election_id)?;
        let voters = self.elections.voters(ballot.election_id)?;
        if let Err(e) = ballot.validate(&election, &voters) {
            log::warn!(
                "rejected ballot {} for election {}: {}",
                ballot.id,
                ballot.election_id,
                e
            );
            return Err(e.into());
        }

        let receipt = Receipt {
            ballot_hash: ballot.hash()?,
            key_image: ballot.key_image(),
            election_id: ballot.election_id,
            received_at: now_millis(),
        };
        self.reserve_key_image(receipt.election_id, &receipt.key_image)?;

        let queued = if self.is_authority() {
            self.mixnet.add_vote(ballot)
        } else {
            self.forward_transaction(ballot.into()).await
        };

        match queued {
            Ok(()) => Ok(receipt),
            Err(e) => {
                self.release_key_images(std::iter::once((receipt.election_id, receipt.key_image)));
                Err(e)
            }
        }
    }

    /// `POST blockchain/transaction`
    pub async fn receive_transaction(&self, transaction: Transaction) -> Result<Receipt, Error> {
        match transaction {
            Transaction::Ballot(ballot) => self.cast_ballot(ballot).await,
        }
    }

    fn reserve_key_image(&self, election_id: Uuid, key_image: &KeyImage) -> Result<(), Error> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| Error::Store("reserved key images lock poisoned".to_string()))?;

        if self.ledger.is_key_image_used(election_id, key_image)?
            || !reserved.entry(election_id).or_default().insert(*key_image)
        {
            log::warn!(
                "double vote attempt in election {} with key image {}",
                election_id,
                key_image
            );
            return Err(ValidationError::DoubleVoteDetected.into());
        }
        Ok(())
    }

    // Key images on chain no longer need a reservation
    fn release_key_images<I: IntoIterator<Item = (Uuid, KeyImage)>>(&self, images: I) {
        if let Ok(mut reserved) = self.reserved.lock() {
            for (election_id, key_image) in images {
                if let Some(set) = reserved.get_mut(&election_id) {
                    set.remove(&key_image);
                }
            }
        }
    }

    fn release_published(&self, block: &Block) {
        if let Ok(data) = block.payload() {
            self.release_key_images(
                data.ballots()
                    .iter()
                    .map(|ballot| (ballot.election_id, ballot.key_image())),
            );
        }
    }

    async fn forward_transaction(&self, transaction: Transaction) -> Result<(), Error> {
        for peer in self.peers().into_iter().filter(|peer| peer.is_authority) {
            match self.transport.send_transaction(&peer.url, &transaction).await {
                Ok(_) => {
                    log::debug!("forwarded ballot to {}", peer.url);
                    return Ok(());
                }
                Err(Error::PeerUnreachable(url)) => log::warn!("skipping unreachable peer {}", url),
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoAuthorityPeer)
    }

    /// Ciphertexts of every published ballot for the election
    pub fn get_election_votes(&self, election_id: Uuid) -> Result<Vec<Ciphertext>, Error> {
        self.elections.get(election_id)?;
        Ok(self
            .ledger
            .election_ballots(election_id)?
            .into_iter()
            .map(|ballot| ballot.encrypted_choice)
            .collect())
    }

    pub fn encrypted_tally(&self, election_id: Uuid) -> Result<EncryptedTally, Error> {
        let election = self.elections.get(election_id)?;
        EncryptedTally::from_ballots(&election, &self.ledger.election_ballots(election_id)?)
    }

    /// Sum and decrypt the election with the whole private key.
    ///
    /// This is the final tally: the key is retired afterwards and later calls fail with
    /// `TallyFinalized`.
    pub fn tally(&self, election_id: Uuid) -> Result<TallyResult, Error> {
        let election = self.elections.get(election_id)?;
        let tally = self.encrypted_tally(election_id)?;
        let mut keys = self.tally_keys()?;

        let result = match keys.get(election_id)? {
            TallyKey::Whole(private_key) => tally.finalize(&election, private_key)?,
            TallyKey::Threshold(key) => return Err(Error::NotEnoughShares(key.threshold, 0)),
        };
        keys.retire(election_id);
        Ok(result)
    }

    /// Decrypt the election from share holders' partial decryptions of `encrypted_tally().sum`.
    ///
    /// Like `tally`, this can succeed only once per election.
    pub fn tally_with_partials(
        &self,
        election_id: Uuid,
        partials: &[PartialDecryption],
    ) -> Result<TallyResult, Error> {
        let election = self.elections.get(election_id)?;
        let tally = self.encrypted_tally(election_id)?;
        let mut keys = self.tally_keys()?;

        let result = match keys.get(election_id)? {
            TallyKey::Threshold(key) => tally.finalize_threshold(&election, key, partials)?,
            TallyKey::Whole(_) => {
                return Err(Error::CryptoParameter(
                    "election key is not threshold shared",
                ))
            }
        };
        keys.retire(election_id);
        Ok(result)
    }

    // Blocks

    /// Seal `ballots` into a block on our head and publish it.
    ///
    /// With enough authorities configured the block is only appended once a quorum endorsed it;
    /// otherwise it is appended right away and broadcast best-effort. On failure the ballots go
    /// back to the pending pool.
    pub async fn add_block(&self, ballots: Vec<Ballot>) -> Result<Block, Error> {
        let _sealing = self.sealing.lock().await;
        let data = BlockData::Ballots {
            ballots: ballots.clone(),
        };

        let result = self.seal_block(&data).await;
        match &result {
            Ok(block) => self.release_published(block),
            Err(e) => {
                log::warn!("could not seal block of {} ballots: {}", ballots.len(), e);
                if !ballots.is_empty() {
                    self.coordinator.requeue(ballots)?;
                }
            }
        }
        result
    }

    async fn seal_block(&self, data: &BlockData) -> Result<Block, Error> {
        let mut block = self.ledger.prepare_block(data)?;
        let difficulty = self.ledger.difficulty();
        let mut block = tokio::task::spawn_blocking(move || {
            block.mine_block(difficulty)?;
            Ok::<_, Error>(block)
        })
        .await??;
        self.ledger.sign_block(&mut block)?;

        let message = BlockMessage {
            block: block.clone(),
            sender: self.url.clone(),
        };

        let mut responses = self.broadcast(&message);
        if self.coordinator.requires_quorum(self.ledger.authorities()) {
            let config = self.coordinator.config();
            let mut collector = QuorumCollector::new(
                &block.hash,
                config.required_signatures,
                self.ledger.authorities(),
            );
            if let Some(own) = self.ledger.endorse(&block.hash) {
                collector.add(own);
            }
            collector
                .collect(&mut responses, config.quorum_timeout())
                .await?;
        }
        self.ledger.append(block.clone())?;

        // peers that have not answered yet still get the block
        while let Some((peer, response)) = responses.next().await {
            match response {
                Ok(response) if response.accepted => {}
                Ok(response) => log::warn!(
                    "{} rejected block {}: {}",
                    peer,
                    block.hash,
                    response.reason.unwrap_or_default()
                ),
                Err(e) => log::warn!("skipping peer {}: {}", peer, e),
            }
        }

        Ok(block)
    }

    fn broadcast<'a>(&'a self, message: &'a BlockMessage) -> PeerResponses<'a> {
        self.peers()
            .into_iter()
            .map(|peer| {
                async move {
                    let response = self.transport.send_block(&peer.url, message).await;
                    (peer.url, response)
                }
                .boxed()
            })
            .collect()
    }

    /// `POST blockchain/block`: validate and append a peer's block, endorsing it if we are an
    /// authority.
    pub async fn receive_block(&self, message: BlockMessage) -> BlockResponse {
        let hash = message.block.hash.clone();
        let sender = message.sender.clone();
        match self.accept_block(message).await {
            Ok(endorsement) => BlockResponse::accepted(endorsement),
            Err(e) => {
                log::warn!("rejected block {} from {}: {}", hash, sender, e);
                BlockResponse::rejected(e.to_string())
            }
        }
    }

    async fn accept_block(&self, message: BlockMessage) -> Result<Option<Endorsement>, Error> {
        let BlockMessage { mut block, sender } = message;
        if self.ledger.countersign(&mut block) {
            log::info!("counter-signed unsigned block {} from {}", block.hash, sender);
        }
        self.check_ballots(&block)?;

        let appended = match self.ledger.receive(block.clone()) {
            Err(Error::ChainIntegrity(ChainIntegrityError::LinkMismatch(_))) => {
                log::info!(
                    "block {} does not extend our head, syncing from {}",
                    block.hash,
                    sender
                );
                self.sync_from_peer(&sender).await?;
                self.ledger.receive(block.clone())?
            }
            other => other?,
        };

        if appended {
            log::info!("accepted block {} from {}", block.hash, sender);
            self.release_published(&block);
        }
        Ok(self.ledger.endorse(&block.hash))
    }

    // Ballots in a peer's block must hold up on their own, not just carry a valid block signature
    fn check_ballots(&self, block: &Block) -> Result<(), Error> {
        let data = block.payload()?;
        for ballot in data.ballots() {
            let election = self.elections.get(ballot.election_id)?;
            let voters = self.elections.voters(ballot.election_id)?;
            ballot.validate(&election, &voters)?;
        }
        Ok(())
    }

    /// Adopt `url`'s chain if it is strictly longer than ours and valid.
    ///
    /// Returns whether we switched chains. Ballots stranded on our abandoned blocks are
    /// re-queued.
    pub async fn sync_from_peer(&self, url: &str) -> Result<bool, Error> {
        let latest = self.transport.latest_block(url).await?;
        if latest.block_number < self.ledger.len() {
            return Ok(false);
        }

        let blocks = self.transport.fetch_chain(url, 0).await?;
        match self.ledger.replace_chain(blocks) {
            Ok(Some(orphaned)) => {
                if !orphaned.is_empty() {
                    log::info!("re-queueing {} ballots from abandoned blocks", orphaned.len());
                    self.coordinator.requeue(orphaned)?;
                }
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                log::warn!("ignoring chain from {}: {}", url, e);
                Err(e)
            }
        }
    }

    /// Pull from every peer, keeping the longest valid chain. Unreachable peers are skipped.
    pub async fn sync_with_network(&self) -> bool {
        let mut adopted = false;
        for peer in self.peers() {
            match self.sync_from_peer(&peer.url).await {
                Ok(switched) => adopted |= switched,
                Err(Error::PeerUnreachable(url)) => log::warn!("skipping unreachable peer {}", url),
                Err(e) => log::debug!("not syncing from {}: {}", peer.url, e),
            }
        }
        adopted
    }

    /// Move mixed batches into the pending pool and seal the next block's worth.
    ///
    /// Ballots whose key image made it on chain in the meantime, or repeats within the batch,
    /// are dropped.
    pub async fn seal_pending(&self) -> Result<Option<Block>, Error> {
        if !self.is_authority() {
            return Ok(None);
        }

        self.collect_mixed_batches().await?;
        let batch = self.publishable(self.coordinator.take_batch()?)?;
        if batch.is_empty() {
            return Ok(None);
        }
        self.add_block(batch).await.map(Some)
    }

    async fn collect_mixed_batches(&self) -> Result<(), Error> {
        let mut output = self.mix_output.lock().await;
        while let Ok(batch) = output.try_recv() {
            self.coordinator.submit(batch)?;
        }
        Ok(())
    }

    fn publishable(&self, ballots: Vec<Ballot>) -> Result<Vec<Ballot>, Error> {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(ballots.len());
        for ballot in ballots {
            let key_image = ballot.key_image();
            if self.ledger.is_key_image_used(ballot.election_id, &key_image)?
                || !seen.insert((ballot.election_id, key_image))
            {
                log::info!("dropping ballot {}: key image already published", ballot.id);
                continue;
            }
            kept.push(ballot);
        }
        Ok(kept)
    }

    /// Flush the mixnet and seal everything pending, for example when an election closes
    pub async fn flush(&self) -> Result<Vec<Block>, Error> {
        self.mixnet.force_process_votes()?;
        self.collect_mixed_batches().await?;

        let mut blocks = Vec::new();
        while self.is_authority() && self.coordinator.pending_len() > 0 {
            if let Some(block) = self.seal_pending().await? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// The node's event loop: start the mixnet timer, then seal and sync on their intervals.
    pub async fn run(self: Arc<Self>) {
        self.mixnet.start();
        let config = self.coordinator.config().clone();
        let mut seal = tokio::time::interval(config.seal_interval());
        let mut sync = tokio::time::interval(config.sync_interval());

        loop {
            tokio::select! {
                _ = seal.tick() => {
                    if let Err(e) = self.seal_pending().await {
                        log::warn!("sealing failed: {}", e);
                    }
                }
                _ = sync.tick() => {
                    if self.sync_with_network().await {
                        log::info!("now at height {}", self.ledger.len());
                    }
                }
            }
        }
    }
}
