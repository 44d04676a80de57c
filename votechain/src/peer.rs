use crate::*;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// A peer as registered with `POST node/peers`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Base URL the peer protocol is served under
    pub url: String,

    pub node_id: String,

    pub is_authority: bool,
}

/// Response of `GET node/info`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,

    pub is_authority: bool,

    /// Hex ed25519 public key, for authorities
    #[serde(default)]
    pub public_key: Option<String>,

    pub peer_count: usize,

    pub chain_length: usize,
}

/// Response of `GET blockchain/latestBlock`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatestBlock {
    pub hash: String,

    pub previous_hash: String,

    pub timestamp: u64,

    /// Zero-based height of the block
    pub block_number: usize,
}

/// Body of `POST blockchain/block`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockMessage {
    pub block: Block,

    /// URL of the sending node, used to sync when the block does not link
    pub sender: String,
}

/// What a node answers to a proposed block
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlockResponse {
    pub accepted: bool,

    /// Present when the receiver is an authority and appended the block
    #[serde(default)]
    pub endorsement: Option<Endorsement>,

    /// Why the block was rejected
    #[serde(default)]
    pub reason: Option<String>,
}

impl BlockResponse {
    pub fn accepted(endorsement: Option<Endorsement>) -> Self {
        BlockResponse {
            accepted: true,
            endorsement,
            reason: None,
        }
    }

    pub fn rejected(reason: String) -> Self {
        BlockResponse {
            accepted: false,
            endorsement: None,
            reason: Some(reason),
        }
    }
}

/// Body of `POST blockchain/transaction`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransactionMessage {
    pub transaction: Transaction,
}

/// Client side of the peer protocol.
///
/// Every call is bounded and best-effort: a failure surfaces as `PeerUnreachable` or
/// `PeerRejected` and callers skip the peer.
pub trait PeerTransport: Send + Sync {
    fn node_info<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<NodeInfo, Error>>;

    fn latest_block<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<LatestBlock, Error>>;

    /// Blocks from height `start` onward
    fn fetch_chain<'a>(
        &'a self,
        peer: &'a str,
        start: usize,
    ) -> BoxFuture<'a, Result<Vec<Block>, Error>>;

    fn send_block<'a>(
        &'a self,
        peer: &'a str,
        message: &'a BlockMessage,
    ) -> BoxFuture<'a, Result<BlockResponse, Error>>;

    fn send_transaction<'a>(
        &'a self,
        peer: &'a str,
        transaction: &'a Transaction,
    ) -> BoxFuture<'a, Result<Receipt, Error>>;

    /// Announce `me` to `peer`
    fn register_peer<'a>(
        &'a self,
        peer: &'a str,
        me: &'a PeerInfo,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// The peer protocol over HTTP+JSON
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Every request, connect included, is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport { client })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        peer: &str,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Result<T, Error> {
        let response = self
            .client
            .get(&endpoint(peer, path))
            .query(&query)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        parse(peer, response).await
    }

    async fn post<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        peer: &str,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let response = self
            .client
            .post(&endpoint(peer, path))
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        parse(peer, response).await
    }
}

fn endpoint(peer: &str, path: &str) -> String {
    format!("{}/{}", peer.trim_end_matches('/'), path)
}

fn unreachable(peer: &str, e: reqwest::Error) -> Error {
    log::debug!("request to {} failed: {}", peer, e);
    Error::PeerUnreachable(peer.to_string())
}

async fn parse<T: DeserializeOwned>(peer: &str, response: reqwest::Response) -> Result<T, Error> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(rejection(peer, status.as_u16(), &body));
    }
    response.json().await.map_err(|e| unreachable(peer, e))
}

/// Turn a refused request back into an error. A ballot rejection relayed by another node keeps
/// its public reason.
fn rejection(peer: &str, status: u16, body: &str) -> Error {
    if (400..500).contains(&status) {
        if let Some(e) = ValidationError::from_public_reason(body.trim()) {
            return Error::Validation(e);
        }
    }
    Error::PeerRejected {
        peer: peer.to_string(),
        status,
    }
}

impl PeerTransport for HttpTransport {
    fn node_info<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<NodeInfo, Error>> {
        self.get(peer, "node/info", vec![]).boxed()
    }

    fn latest_block<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<LatestBlock, Error>> {
        self.get(peer, "blockchain/latestBlock", vec![]).boxed()
    }

    fn fetch_chain<'a>(
        &'a self,
        peer: &'a str,
        start: usize,
    ) -> BoxFuture<'a, Result<Vec<Block>, Error>> {
        self.get(peer, "blockchain/chain", vec![("startBlock", start.to_string())])
            .boxed()
    }

    fn send_block<'a>(
        &'a self,
        peer: &'a str,
        message: &'a BlockMessage,
    ) -> BoxFuture<'a, Result<BlockResponse, Error>> {
        self.post(peer, "blockchain/block", message).boxed()
    }

    fn send_transaction<'a>(
        &'a self,
        peer: &'a str,
        transaction: &'a Transaction,
    ) -> BoxFuture<'a, Result<Receipt, Error>> {
        async move {
            let message = TransactionMessage {
                transaction: transaction.clone(),
            };
            self.post(peer, "blockchain/transaction", &message).await
        }
        .boxed()
    }

    fn register_peer<'a>(
        &'a self,
        peer: &'a str,
        me: &'a PeerInfo,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let _peers: Vec<PeerInfo> = self.post(peer, "node/peers", me).await?;
            Ok(())
        }
        .boxed()
    }
}

/// An in-process network of nodes addressed by URL.
///
/// Nodes are held weakly so the network does not keep them alive. A node can be taken offline
/// to simulate an unreachable peer.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Weak<Node>>>,
    offline: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    /// Make `node` reachable at its URL
    pub fn join(&self, node: &Arc<Node>) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(node.url().to_string(), Arc::downgrade(node));
        }
    }

    pub fn set_offline(&self, url: &str, offline: bool) {
        if let Ok(mut set) = self.offline.write() {
            if offline {
                set.insert(url.to_string());
            } else {
                set.remove(url);
            }
        }
    }

    fn node(&self, peer: &str) -> Result<Arc<Node>, Error> {
        let offline = self
            .offline
            .read()
            .map(|set| set.contains(peer))
            .unwrap_or(true);
        if offline {
            return Err(Error::PeerUnreachable(peer.to_string()));
        }

        self.nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.get(peer).and_then(Weak::upgrade))
            .ok_or_else(|| Error::PeerUnreachable(peer.to_string()))
    }
}

impl PeerTransport for LocalNetwork {
    fn node_info<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<NodeInfo, Error>> {
        async move { Ok(self.node(peer)?.node_info()) }.boxed()
    }

    fn latest_block<'a>(&'a self, peer: &'a str) -> BoxFuture<'a, Result<LatestBlock, Error>> {
        async move { self.node(peer)?.latest_block() }.boxed()
    }

    fn fetch_chain<'a>(
        &'a self,
        peer: &'a str,
        start: usize,
    ) -> BoxFuture<'a, Result<Vec<Block>, Error>> {
        async move { self.node(peer)?.chain_from(start) }.boxed()
    }

    fn send_block<'a>(
        &'a self,
        peer: &'a str,
        message: &'a BlockMessage,
    ) -> BoxFuture<'a, Result<BlockResponse, Error>> {
        async move {
            let node = self.node(peer)?;
            Ok(node.receive_block(message.clone()).await)
        }
        .boxed()
    }

    fn send_transaction<'a>(
        &'a self,
        peer: &'a str,
        transaction: &'a Transaction,
    ) -> BoxFuture<'a, Result<Receipt, Error>> {
        async move {
            let node = self.node(peer)?;
            node.receive_transaction(transaction.clone()).await
        }
        .boxed()
    }

    fn register_peer<'a>(
        &'a self,
        peer: &'a str,
        me: &'a PeerInfo,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            self.node(peer)?.register_peer(me.clone());
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case() {
        let info = NodeInfo {
            node_id: "alpha".to_string(),
            is_authority: true,
            public_key: None,
            peer_count: 2,
            chain_length: 7,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["nodeId"], "alpha");
        assert_eq!(json["isAuthority"], true);
        assert_eq!(json["chainLength"], 7);

        let latest: LatestBlock = serde_json::from_str(
            r#"{"hash":"ab","previousHash":"0","timestamp":0,"blockNumber":0}"#,
        )
        .unwrap();
        assert_eq!(latest.previous_hash, "0");
    }

    #[test]
    fn endpoints_join_cleanly() {
        assert_eq!(
            endpoint("http://localhost:8000/", "node/info"),
            "http://localhost:8000/node/info"
        );
        assert_eq!(
            endpoint("http://localhost:8000", "blockchain/chain"),
            "http://localhost:8000/blockchain/chain"
        );
    }

    #[test]
    fn relayed_rejections_keep_their_reason() {
        let e = rejection("http://authority", 400, "ballot already cast");
        assert!(matches!(
            e,
            Error::Validation(ValidationError::DoubleVoteDetected)
        ));
        assert_eq!(e.public_reason(), "ballot already cast");

        assert!(matches!(
            rejection("http://authority", 400, "ballot credentials rejected"),
            Error::Validation(_)
        ));

        let e = rejection("http://authority", 400, "unknown election");
        assert!(matches!(e, Error::PeerRejected { status: 400, .. }));
        assert_eq!(e.public_reason(), "request rejected by authority");

        // a server error is never mistaken for a ballot rejection
        assert!(matches!(
            rejection("http://authority", 500, "ballot already cast"),
            Error::PeerRejected { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn unknown_local_peer_is_unreachable() {
        let network = LocalNetwork::new();
        assert!(matches!(
            network.node_info("local://nobody").await,
            Err(Error::PeerUnreachable(_))
        ));
    }
}
