#[macro_use]
extern crate rocket;

#[macro_use]
extern crate serde;

use clap::{App, Arg, SubCommand};
use std::sync::Arc;
use votechain::*;

mod api;
mod config;

use config::NodeConfig;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("votechain")
        .version("0.1")
        .about("Runs a votechain authority or peer node")
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the node (configured through VOTECHAIN_* environment variables)")
                .arg(
                    Arg::with_name("address")
                        .long("address")
                        .takes_value(true)
                        .help("Address to bind to, overrides VOTECHAIN_ADDRESS"),
                )
                .arg(
                    Arg::with_name("port")
                        .long("port")
                        .short("p")
                        .takes_value(true)
                        .help("Port to listen on, overrides VOTECHAIN_PORT"),
                )
                .arg(
                    Arg::with_name("peer")
                        .long("peer")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("Peer URL to connect to, may be repeated"),
                ),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate an authority signing key")
                .arg(
                    Arg::with_name("ID")
                        .index(1)
                        .required(true)
                        .help("Authority id to pair with the public key"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        ("keygen", Some(matches)) => {
            command_keygen(matches);
            Ok(())
        }
        ("run", Some(matches)) => command_run(matches).await,
        _ => {
            eprintln!("{}", matches.usage());
            std::process::exit(1);
        }
    }
}

fn command_keygen(matches: &clap::ArgMatches) {
    let id = matches.value_of("ID").unwrap_or("authority");
    let (secret, public) = generate_keypair();

    println!("secret-key: {}", hex::encode(secret.to_bytes()));
    println!("authority: {}:{}", id, hex::encode(public.to_bytes()));
}

async fn command_run(matches: &clap::ArgMatches<'_>) -> anyhow::Result<()> {
    let mut config = NodeConfig::from_env()?;
    if let Some(address) = matches.value_of("address") {
        config.address = address.to_owned();
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse()?;
    }
    if let Some(peers) = matches.values_of("peer") {
        config.peers = peers.map(str::to_owned).collect();
    }

    let elections = config.elections()?;
    let store = config.block_store();
    let transport = Arc::new(HttpTransport::new(config.consensus.peer_timeout())?);
    let figment = rocket::Config::figment()
        .merge(("address", config.address.clone()))
        .merge(("port", config.port))
        .merge(("limits", limits()));
    let peers = config.peers.clone();

    let node = Arc::new(Node::new(config.into_settings(), store, transport)?);
    for setup in elections {
        let election_id = setup.election.id;
        node.add_election(setup.election)?;
        for voter in setup.voters {
            node.register_voter(election_id, &voter.identity, voter.public_key)?;
        }
    }

    log::info!(
        "starting node {} at {} (authority: {})",
        node.id(),
        node.url(),
        node.is_authority()
    );

    node.connect(&peers).await;
    if node.sync_with_network().await {
        log::info!("caught up to height {}", node.ledger().len());
    }
    tokio::spawn(node.clone().run());

    rocket::custom(figment)
        .manage(node)
        .mount("/", api::routes())
        .launch()
        .await?;

    Ok(())
}

fn limits() -> rocket::data::Limits {
    use rocket::data::{Limits, ToByteUnit};

    Limits::default()
        .limit("json", 16.mebibytes())
        .limit("bytes", 1.mebibytes())
}
