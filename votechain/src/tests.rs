use super::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Hands out the same bytes, from the start, on every request
pub(crate) struct FixedRng(pub Vec<u8>);

impl rand::RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for (byte, value) in dest.iter_mut().zip(self.0.iter().cycle()) {
            *byte = *value;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl rand::CryptoRng for FixedRng {}

/// A small election with registered voters, for tests.
///
/// Keys are deliberately short to keep the tests quick.
pub(crate) struct TestElection {
    pub params: ElectionParams,
    pub keys: PaillierKeyPair,
    pub authenticator: Authenticator,
    pub voters: VoterRegistry,
    pub voter_keys: Vec<VoterKeyPair>,
    authorizations: Mutex<HashMap<usize, BlindSignature>>,
}

impl TestElection {
    pub fn new(candidates: usize, num_voters: usize) -> Self {
        let keys = PaillierKeyPair::generate(512).unwrap();
        let authenticator = Authenticator::new(512).unwrap();
        let names = (0..candidates).map(|i| format!("candidate{}", i)).collect();
        let params = ElectionParams::new(
            "test election",
            names,
            100,
            keys.public_key.clone(),
            authenticator.public_key(),
        )
        .unwrap();

        let voters = VoterRegistry::default();
        let voter_keys: Vec<VoterKeyPair> = (0..num_voters)
            .map(|i| {
                let key = VoterKeyPair::generate();
                voters.register(&Self::identity(i), key.public).unwrap();
                key
            })
            .collect();

        TestElection {
            params,
            keys,
            authenticator,
            voters,
            voter_keys,
            authorizations: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(voter: usize) -> String {
        format!("voter{}", voter)
    }

    /// The voter's authorization for this election, obtained once through the blind-signature
    /// round trip and reused afterwards.
    pub fn authorize(&self, voter: usize) -> BlindSignature {
        let mut cache = self.authorizations.lock().unwrap();
        if let Some(authorization) = cache.get(&voter) {
            return authorization.clone();
        }

        let key = &self.voter_keys[voter];
        let public_key = &self.params.authorization_key;
        let request =
            AuthorizationRequest::new(public_key, self.params.id, key.key_image(self.params.id))
                .unwrap();
        let blind_signature = self
            .authenticator
            .authorize(
                &self.voters,
                &Self::identity(voter),
                self.params.id,
                &request.blinded,
            )
            .unwrap();
        let authorization = request.finalize(public_key, &blind_signature).unwrap();

        cache.insert(voter, authorization.clone());
        authorization
    }

    /// A ring-signed ballot from `voter` for the candidate at `position`
    pub fn ballot(&self, voter: usize, position: usize) -> Ballot {
        let key = &self.voter_keys[voter];
        let ring_size = self.params.ring_size.min(self.voter_keys.len());
        let ring = key
            .select_ring(self.params.id, &self.voters.public_keys(), ring_size)
            .unwrap();
        Ballot::new(&self.params, key, position, &ring, self.authorize(voter)).unwrap()
    }

    /// Make a node aware of this election and its voters
    pub fn install(&self, node: &Node) {
        node.add_election(self.params.clone()).unwrap();
        for (i, key) in self.voter_keys.iter().enumerate() {
            node.register_voter(self.params.id, &Self::identity(i), key.public)
                .unwrap();
        }
        node.install_tally_key(self.params.id, self.keys.private_key.clone())
            .unwrap();
    }
}

fn consensus(required_signatures: usize) -> ConsensusConfig {
    ConsensusConfig {
        required_signatures,
        quorum_timeout_ms: 2000,
        difficulty: 1,
        ..ConsensusConfig::default()
    }
}

fn mix() -> MixConfig {
    MixConfig {
        batch_size: 2,
        max_wait_secs: 3600,
        tick_ms: 1000,
    }
}

/// `count` authority nodes that know each other, sharing one in-process network
fn authority_nodes(
    count: usize,
    required_signatures: usize,
    election: &TestElection,
) -> (Arc<LocalNetwork>, Vec<Arc<Node>>) {
    let network = LocalNetwork::new();
    let keys: Vec<AuthorityKeyPair> = (0..count)
        .map(|i| AuthorityKeyPair::generate(&format!("authority{}", i)))
        .collect();
    let authorities = AuthoritySet::new(keys.iter().map(|key| key.info()).collect());

    let nodes: Vec<Arc<Node>> = keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| {
            let mut settings = NodeSettings::new(&key.id, &format!("local://node{}", i));
            settings.authority = Some(key);
            settings.authorities = authorities.clone();
            settings.consensus = consensus(required_signatures);
            settings.mix = mix();

            let node =
                Arc::new(Node::new(settings, Arc::new(MemStore::default()), network.clone()).unwrap());
            network.join(&node);
            election.install(&node);
            node
        })
        .collect();

    for node in &nodes {
        for other in &nodes {
            node.register_peer(other.peer_info());
        }
    }

    (network, nodes)
}

fn same_chain(nodes: &[Arc<Node>]) -> bool {
    let head = nodes[0].ledger().latest_block().unwrap();
    nodes
        .iter()
        .all(|node| node.ledger().latest_block().unwrap() == head && node.ledger().is_chain_valid())
}

#[test]
fn fresh_node_has_genesis_only() {
    let node = Node::new(
        NodeSettings::new("solo", "local://solo"),
        Arc::new(MemStore::default()),
        LocalNetwork::new(),
    )
    .unwrap();

    assert_eq!(node.ledger().len(), 1);
    let latest = node.latest_block().unwrap();
    assert_eq!(latest.previous_hash, "0");
    assert_eq!(latest.block_number, 0);
    assert!(node.ledger().is_chain_valid());
    assert!(!node.node_info().is_authority);
}

#[tokio::test]
async fn end_to_end_election() {
    let election = TestElection::new(3, 5);
    let (_network, nodes) = authority_nodes(1, 1, &election);
    let node = &nodes[0];

    // choices are 1-based on the ballot
    let choices = [1, 1, 1, 2, 2];
    for (voter, choice) in choices.iter().enumerate() {
        let ballot = election.ballot(voter, choice - 1);
        let receipt = node.cast_ballot(ballot.clone()).await.unwrap();
        assert_eq!(receipt.key_image, ballot.key_image());
        assert_eq!(receipt.ballot_hash, ballot.hash().unwrap());
    }

    node.flush().await.unwrap();
    assert_eq!(node.get_election_votes(election.params.id).unwrap().len(), 5);
    assert!(node.ledger().is_chain_valid());

    let result = node.tally(election.params.id).unwrap();
    assert_eq!(result.counts(), vec![3, 2, 0]);
    assert_eq!(result.ballots, 5);

    // one flipped byte anywhere in history breaks the chain
    let mut blocks = node.chain_from(0).unwrap();
    let last = blocks.len() - 1;
    let mut data = blocks[last].data.clone().into_bytes();
    data[0] ^= 1;
    blocks[last].data = String::from_utf8_lossy(&data).into_owned();
    assert!(Chain::validate_blocks(&blocks, node.ledger().authorities(), 1).is_err());
}

#[tokio::test]
async fn double_votes_are_rejected() {
    let election = TestElection::new(3, 3);
    let (_network, nodes) = authority_nodes(1, 1, &election);
    let node = &nodes[0];

    // while the first ballot is still in the mixnet
    node.cast_ballot(election.ballot(0, 0)).await.unwrap();
    let second = node.cast_ballot(election.ballot(0, 2)).await;
    assert!(matches!(
        second,
        Err(Error::Validation(ValidationError::DoubleVoteDetected))
    ));

    // and once it is on chain
    node.flush().await.unwrap();
    let third = node.cast_ballot(election.ballot(0, 1)).await;
    match third {
        Err(e) => assert_eq!(e.public_reason(), "ballot already cast"),
        Ok(_) => panic!("double vote accepted"),
    }

    node.cast_ballot(election.ballot(1, 1)).await.unwrap();
    node.flush().await.unwrap();

    let result = node.tally(election.params.id).unwrap();
    assert_eq!(result.counts(), vec![1, 1, 0]);
}

#[tokio::test]
async fn ballots_from_unknown_elections_are_rejected() {
    let election = TestElection::new(2, 2);
    let other = TestElection::new(2, 2);
    let (_network, nodes) = authority_nodes(1, 1, &election);

    let result = nodes[0].cast_ballot(other.ballot(0, 0)).await;
    assert!(matches!(result, Err(Error::UnknownElection(_))));
}

#[tokio::test]
async fn blocks_propagate_and_lagging_nodes_catch_up() {
    let election = TestElection::new(2, 4);
    let (network, nodes) = authority_nodes(3, 1, &election);

    nodes[0].cast_ballot(election.ballot(0, 0)).await.unwrap();
    nodes[0].flush().await.unwrap();
    assert_eq!(nodes[1].ledger().len(), 2);
    assert!(same_chain(&nodes));

    // node2 misses the next block
    network.set_offline(nodes[2].url(), true);
    nodes[1].cast_ballot(election.ballot(1, 1)).await.unwrap();
    nodes[1].flush().await.unwrap();
    assert_eq!(nodes[0].ledger().len(), 3);
    assert_eq!(nodes[2].ledger().len(), 2);

    network.set_offline(nodes[2].url(), false);
    assert!(nodes[2].sync_with_network().await);
    assert!(same_chain(&nodes));

    for node in &nodes {
        assert_eq!(node.tally(election.params.id).unwrap().counts(), vec![1, 1]);
    }
}

#[tokio::test]
async fn quorum_of_authorities() {
    let election = TestElection::new(2, 4);
    let (network, nodes) = authority_nodes(3, 2, &election);

    nodes[0].cast_ballot(election.ballot(0, 1)).await.unwrap();
    let blocks = nodes[0].flush().await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(same_chain(&nodes));

    // nobody else reachable: the block cannot gather a second signature
    network.set_offline(nodes[1].url(), true);
    network.set_offline(nodes[2].url(), true);
    nodes[0].cast_ballot(election.ballot(1, 0)).await.unwrap();
    let result = nodes[0].flush().await;
    assert!(matches!(
        result,
        Err(Error::ConsensusTimeout {
            required: 2,
            collected: 1
        })
    ));
    assert_eq!(nodes[0].ledger().len(), 2);
    assert_eq!(nodes[0].coordinator().pending_len(), 1);

    // the ballot goes out with the next round once peers are back
    network.set_offline(nodes[1].url(), false);
    network.set_offline(nodes[2].url(), false);
    let blocks = nodes[0].flush().await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(same_chain(&nodes));
    assert_eq!(
        nodes[2].tally(election.params.id).unwrap().counts(),
        vec![1, 1]
    );
}

#[tokio::test]
async fn losing_fork_ballots_are_resealed() {
    let election = TestElection::new(2, 4);
    let (network, nodes) = authority_nodes(2, 1, &election);
    let (alpha, beta) = (&nodes[0], &nodes[1]);

    // partitioned: both seal on top of genesis
    network.set_offline(alpha.url(), true);
    network.set_offline(beta.url(), true);
    alpha.cast_ballot(election.ballot(0, 0)).await.unwrap();
    alpha.flush().await.unwrap();
    alpha.cast_ballot(election.ballot(1, 0)).await.unwrap();
    alpha.flush().await.unwrap();
    beta.cast_ballot(election.ballot(2, 1)).await.unwrap();
    beta.flush().await.unwrap();
    assert_eq!(alpha.ledger().len(), 3);
    assert_eq!(beta.ledger().len(), 2);

    network.set_offline(alpha.url(), false);
    network.set_offline(beta.url(), false);

    // alpha keeps its longer chain
    assert!(!alpha.sync_with_network().await);
    assert!(beta.sync_with_network().await);
    assert_eq!(beta.coordinator().pending_len(), 1);

    beta.flush().await.unwrap();
    assert!(same_chain(&nodes));
    assert_eq!(alpha.tally(election.params.id).unwrap().counts(), vec![2, 1]);
}

#[tokio::test]
async fn chains_from_unknown_authorities_are_ignored() {
    let election = TestElection::new(2, 2);
    let (network, nodes) = authority_nodes(1, 1, &election);

    let mut settings = NodeSettings::new("rogue", "local://rogue");
    let rogue_key = AuthorityKeyPair::generate("rogue");
    settings.authorities = AuthoritySet::new(vec![rogue_key.info()]);
    settings.authority = Some(rogue_key);
    settings.consensus = consensus(1);
    let rogue = Arc::new(Node::new(settings, Arc::new(MemStore::default()), network.clone()).unwrap());
    network.join(&rogue);
    for _ in 0..3 {
        rogue.add_block(vec![]).await.unwrap();
    }
    assert_eq!(rogue.ledger().len(), 4);

    let result = nodes[0].sync_from_peer(rogue.url()).await;
    assert!(matches!(
        result,
        Err(Error::ChainIntegrity(ChainIntegrityError::UnknownValidator(1)))
    ));
    assert_eq!(nodes[0].ledger().len(), 1);

    // a pushed block from it is refused too
    let block = rogue.ledger().latest_block().unwrap();
    let response = nodes[0]
        .receive_block(BlockMessage {
            block,
            sender: rogue.url().to_string(),
        })
        .await;
    assert!(!response.accepted);
    assert_eq!(nodes[0].ledger().len(), 1);
}

#[tokio::test]
async fn non_authority_nodes_forward_ballots() {
    let election = TestElection::new(2, 3);
    let (network, nodes) = authority_nodes(1, 1, &election);
    let authority = &nodes[0];

    let mut settings = NodeSettings::new("observer", "local://observer");
    settings.authorities = authority.ledger().authorities().clone();
    settings.consensus = consensus(1);
    let observer =
        Arc::new(Node::new(settings, Arc::new(MemStore::default()), network.clone()).unwrap());
    network.join(&observer);
    election.install(&observer);

    observer.connect(&[authority.url().to_string()]).await;
    assert_eq!(observer.peers().len(), 1);
    assert!(observer.peers()[0].is_authority);
    assert_eq!(authority.node_info().peer_count, 1);

    observer.cast_ballot(election.ballot(0, 1)).await.unwrap();
    assert_eq!(authority.mixnet().len(), 1);
    assert!(observer.flush().await.unwrap().is_empty());

    authority.flush().await.unwrap();
    assert_eq!(observer.ledger().len(), 2);
    assert_eq!(observer.tally(election.params.id).unwrap().counts(), vec![0, 1]);

    // with no authority reachable the ballot is refused, not silently dropped
    network.set_offline(authority.url(), true);
    assert!(matches!(
        observer.cast_ballot(election.ballot(1, 0)).await,
        Err(Error::NoAuthorityPeer)
    ));
}

#[tokio::test]
async fn threshold_tally() {
    let election = TestElection::new(3, 3);
    let (_network, nodes) = authority_nodes(1, 1, &election);
    let node = &nodes[0];

    for voter in 0..3 {
        node.cast_ballot(election.ballot(voter, voter)).await.unwrap();
    }
    node.flush().await.unwrap();

    let (key, shares) = election
        .keys
        .private_key
        .generate_key_shares(5, 3)
        .unwrap();
    node.install_threshold_key(election.params.id, key).unwrap();
    assert!(matches!(
        node.tally(election.params.id),
        Err(Error::NotEnoughShares(3, 0))
    ));

    let sum = node.encrypted_tally(election.params.id).unwrap().sum;
    let partials: Vec<PartialDecryption> = shares
        .iter()
        .step_by(2)
        .map(|share| share.partial_decrypt(&sum).unwrap())
        .collect();

    let result = node
        .tally_with_partials(election.params.id, &partials)
        .unwrap();
    assert_eq!(result.counts(), vec![1, 1, 1]);
    assert!(matches!(
        node.tally_with_partials(election.params.id, &partials),
        Err(Error::TallyFinalized(_))
    ));
}

#[tokio::test]
async fn tally_key_is_retired_after_the_final_tally() {
    let election = TestElection::new(2, 3);
    let (_network, nodes) = authority_nodes(1, 1, &election);
    let node = &nodes[0];
    let id = election.params.id;

    node.cast_ballot(election.ballot(0, 0)).await.unwrap();
    node.cast_ballot(election.ballot(1, 1)).await.unwrap();
    node.flush().await.unwrap();
    assert_eq!(node.tally(id).unwrap().counts(), vec![1, 1]);

    // later ballots can still be recorded but never decrypted here
    node.cast_ballot(election.ballot(2, 1)).await.unwrap();
    node.flush().await.unwrap();
    assert!(matches!(node.tally(id), Err(Error::TallyFinalized(_))));
    assert!(matches!(
        node.install_tally_key(id, election.keys.private_key.clone()),
        Err(Error::TallyFinalized(_))
    ));
    assert!(matches!(node.tally(id), Err(Error::TallyFinalized(_))));
    assert_eq!(node.encrypted_tally(id).unwrap().ballots, 3);
}

#[tokio::test]
async fn voters_are_registered_per_election() {
    let election = TestElection::new(2, 3);
    let other = TestElection::new(2, 3);
    let (_network, nodes) = authority_nodes(1, 1, &election);
    let node = &nodes[0];
    node.add_election(other.params.clone()).unwrap();

    // enrolled in the wrong election
    for (i, key) in other.voter_keys.iter().enumerate() {
        node.register_voter(election.params.id, &format!("other{}", i), key.public)
            .unwrap();
    }
    let result = node.cast_ballot(other.ballot(0, 1)).await;
    assert!(matches!(
        result,
        Err(Error::Validation(ValidationError::RingMemberUnknown))
    ));

    for (i, key) in other.voter_keys.iter().enumerate() {
        node.register_voter(other.params.id, &TestElection::identity(i), key.public)
            .unwrap();
    }
    node.cast_ballot(other.ballot(0, 1)).await.unwrap();

    assert!(matches!(
        node.register_voter(Uuid::new_v4(), "stranger", other.voter_keys[0].public),
        Err(Error::UnknownElection(_))
    ));
}
