use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::State;
use std::sync::Arc;
use uuid::Uuid;
use votechain::*;

type ApiResult<T> = Result<Json<T>, status::Custom<String>>;

fn failure(e: Error) -> status::Custom<String> {
    let code = match &e {
        Error::Validation(_) | Error::UnknownElection(_) | Error::CryptoParameter(_) => {
            Status::BadRequest
        }
        Error::JSON(_) | Error::CBOR(_) | Error::DeserializationUnknownFormat => {
            Status::BadRequest
        }
        Error::PeerRejected { status, .. } if (400..500).contains(status) => Status::BadRequest,
        Error::NoAuthorityPeer | Error::PeerUnreachable(_) => Status::ServiceUnavailable,
        _ => Status::InternalServerError,
    };
    status::Custom(code, e.public_reason().to_owned())
}

#[derive(FromForm)]
pub struct ChainQuery {
    #[field(name = "startBlock")]
    start_block: Option<usize>,
}

#[get("/node/info")]
pub fn node_info(node: &State<Arc<Node>>) -> Json<NodeInfo> {
    Json(node.node_info())
}

#[get("/node/peers")]
pub fn peers(node: &State<Arc<Node>>) -> Json<Vec<PeerInfo>> {
    Json(node.peers())
}

#[post("/node/peers", data = "<peer>")]
pub fn register_peer(node: &State<Arc<Node>>, peer: Json<PeerInfo>) -> Json<Vec<PeerInfo>> {
    node.register_peer(peer.0);
    Json(node.peers())
}

#[get("/blockchain/latestBlock")]
pub fn latest_block(node: &State<Arc<Node>>) -> ApiResult<LatestBlock> {
    node.latest_block().map(Json).map_err(failure)
}

#[get("/blockchain/chain?<query..>")]
pub fn chain(node: &State<Arc<Node>>, query: ChainQuery) -> ApiResult<Vec<Block>> {
    node.chain_from(query.start_block.unwrap_or(0)).map(Json).map_err(failure)
}

#[post("/blockchain/block", data = "<message>")]
pub async fn receive_block(
    node: &State<Arc<Node>>,
    message: Json<BlockMessage>,
) -> Json<BlockResponse> {
    Json(node.receive_block(message.0).await)
}

/// Accepts a `TransactionMessage` as JSON, or a bare transaction in CBOR
#[post("/blockchain/transaction", data = "<body>")]
pub async fn receive_transaction(node: &State<Arc<Node>>, body: Vec<u8>) -> ApiResult<Receipt> {
    let transaction = match serde_json::from_slice::<TransactionMessage>(&body) {
        Ok(message) => message.transaction,
        Err(_) => Transaction::from_bytes(&body).map_err(failure)?,
    };
    node.receive_transaction(transaction)
        .await
        .map(Json)
        .map_err(failure)
}

#[get("/elections/<id>/votes")]
pub fn election_votes(node: &State<Arc<Node>>, id: String) -> ApiResult<Vec<Ciphertext>> {
    let election_id = Uuid::parse_str(&id)
        .map_err(|_| status::Custom(Status::BadRequest, "bad election id".to_owned()))?;
    node.get_election_votes(election_id)
        .map(Json)
        .map_err(failure)
}

pub fn routes() -> Vec<rocket::Route> {
    routes![
        node_info,
        peers,
        register_peer,
        latest_block,
        chain,
        receive_block,
        receive_transaction,
        election_votes
    ]
}
