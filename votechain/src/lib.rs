#[macro_use]
extern crate serde;

mod authn;
mod authority;
mod ballot;
mod blind;
mod block;
mod chain;
mod consensus;
mod election;
mod encoding;
mod error;
mod ledger;
mod mix;
mod node;
mod paillier;
mod peer;
mod ring;
mod secret_share;
mod serde_hex;
mod store;
mod tally;
mod transaction;
mod util;

pub use authn::*;
pub use authority::*;
pub use ballot::*;
pub use blind::*;
pub use block::*;
pub use chain::*;
pub use consensus::*;
pub use election::*;
pub use encoding::*;
pub use error::*;
pub use ledger::*;
pub use mix::*;
pub use node::*;
pub use paillier::*;
pub use peer::*;
pub use ring::*;
pub use secret_share::*;
pub use serde_hex::*;
pub use store::*;
pub use tally::*;
pub use transaction::*;
pub use util::*;

#[cfg(test)]
mod tests;
