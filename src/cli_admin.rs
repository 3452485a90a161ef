//! Operator REPL for out-of-band tasks the HTTP admin surface doesn't
//! cover: client registration, signing-key rotation, and inspecting
//! users/groups/roles directly against the store. Generalizes the
//! teacher's `cli_auth.rs` read-eval-print loop (`shlex::split` +
//! `clap::Parser::try_parse_from` per line) to this crate's persistence
//! contract.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

mod clock;
mod config;
mod crypto;
mod error;
mod http;
mod kek;
mod oidc;
mod opaque;
mod otp;
mod ratelimit;
mod session;
mod store;

use kek::{KekKdfParams, KekService, SETTINGS_KEY_KEK_KDF};
use store::sqlite::SqliteStore;
use store::{
    ClientKind, ClientRepository, ClientRow, SigningKeyRepository, Store, UserRepository,
    ZkDelivery,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    #[clap(long, value_parser = parse_path, default_value = "./darkauth.sqlite3")]
    db: PathBuf,
}

#[derive(Parser)]
#[command(name = "")]
struct InnerCli {
    #[command(subcommand)]
    command: InnerCommand,
}

#[derive(Subcommand)]
enum InnerCommand {
    /// Registers a public or confidential OIDC client.
    AddClient {
        client_id: String,
        #[clap(long)]
        confidential: bool,
        #[clap(long)]
        redirect_uri: Vec<String>,
        #[clap(long)]
        zk: bool,
    },

    /// Removes a client registration.
    DeleteClient { client_id: String },

    /// Lists registered clients.
    ListClients,

    /// Rotates the active signing key, leaving the previous one published
    /// in JWKS but no longer used to mint new tokens.
    RotateSigningKey,

    /// Lists every signing key, active or retired.
    ListSigningKeys,

    /// Shows the groups and roles bound to a user, by subject.
    ShowUser { sub: String },

    /// Lists every user subject and email on file.
    ListUsers,

    /// Close this program.
    Exit,
}

fn open_kek(store: &dyn Store) -> Result<KekService> {
    let passphrase = std::env::var("ZKAUTH_KEK_PASSPHRASE")
        .or_else(|_| std::env::var("KEK_PASSPHRASE"))
        .context("set ZKAUTH_KEK_PASSPHRASE or KEK_PASSPHRASE")?;
    let params: KekKdfParams = store
        .settings_get(SETTINGS_KEY_KEK_KDF)?
        .context("system not yet initialized: no kek_kdf settings row")
        .and_then(|json| serde_json::from_str(&json).context("corrupt kek_kdf settings row"))?;
    Ok(KekService::derive(&passphrase, &params)?)
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();
    let store = SqliteStore::open(&cli_args.db)?;

    let stdin = io::stdin();
    let mut reader = stdin.lock();

    InnerCli::command().print_long_help()?;
    println!();
    loop {
        print!("> ");
        io::stdout().flush().context("failed to flush stdout")?;

        let mut line = String::new();
        reader.read_line(&mut line).context("failed to read line")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let args = shlex::split(line).unwrap_or_else(|| line.split_whitespace().map(String::from).collect());
        let cli = InnerCli::try_parse_from(std::iter::once(" ".to_string()).chain(args));

        match cli {
            Ok(cli) => match cli.command {
                InnerCommand::AddClient {
                    client_id,
                    confidential,
                    redirect_uri,
                    zk,
                } => {
                    let kind = if confidential { ClientKind::Confidential } else { ClientKind::Public };
                    let encrypted_secret = if confidential {
                        match open_kek(&store) {
                            Ok(kek) => {
                                let secret = crypto::b64u_encode(&crypto::random_bytes::<24>());
                                println!("client secret (copy this now, it will not be shown again): {secret}");
                                Some(kek.wrap(secret.as_bytes()).unwrap())
                            }
                            Err(err) => {
                                eprintln!("could not derive KEK to wrap a client secret: {err}");
                                continue;
                            }
                        }
                    } else {
                        None
                    };
                    let result = store.client_upsert(ClientRow {
                        client_id: client_id.clone(),
                        kind,
                        redirect_uris: redirect_uri,
                        post_logout_redirect_uris: vec![],
                        require_pkce: true,
                        zk_delivery: if zk { ZkDelivery::FragmentJwe } else { ZkDelivery::None },
                        zk_required: false,
                        token_endpoint_auth_method: if confidential { "client_secret_basic".to_string() } else { "none".to_string() },
                        encrypted_secret,
                        allowed_scopes: vec![],
                        allowed_zk_origins: vec![],
                    });
                    match result {
                        Ok(()) => println!("registered client {client_id}"),
                        Err(err) => eprintln!("failed to register client: {err}"),
                    }
                }
                InnerCommand::DeleteClient { client_id } => {
                    if let Err(err) = store.client_delete(&client_id) {
                        eprintln!("failed to delete client: {err}");
                    }
                }
                InnerCommand::ListClients => match store.client_list() {
                    Ok(clients) => {
                        for client in clients {
                            println!("{} ({:?}, pkce={})", client.client_id, client.kind, client.require_pkce);
                        }
                    }
                    Err(err) => eprintln!("failed to list clients: {err}"),
                },
                InnerCommand::RotateSigningKey => match open_kek(&store) {
                    Ok(kek) => match kek::rotate_signing_key(&store, &kek) {
                        Ok(kid) => println!("rotated to new active key {kid}"),
                        Err(err) => eprintln!("rotation failed: {err}"),
                    },
                    Err(err) => eprintln!("could not derive KEK: {err}"),
                },
                InnerCommand::ListSigningKeys => match store.signing_keys_list_all() {
                    Ok(keys) => {
                        for key in keys {
                            println!("{} active={} created_at={}", key.kid, key.active, key.created_at);
                        }
                    }
                    Err(err) => eprintln!("failed to list signing keys: {err}"),
                },
                InnerCommand::ShowUser { sub } => {
                    match (store.user_groups(&sub), store.user_roles(&sub)) {
                        (Ok(groups), Ok(roles)) => {
                            println!("groups: {:#?}", groups);
                            println!("roles: {:#?}", roles);
                        }
                        _ => eprintln!("failed to load groups/roles for {sub}"),
                    }
                }
                InnerCommand::ListUsers => {
                    // The persistence contract has no "list all users" operation
                    // (section 4.G deliberately keys every user lookup by sub or
                    // email); listing requires direct store access the HTTP
                    // surface never exposes, so this prints a pointer instead of
                    // faking a query the contract doesn't support.
                    println!("no bulk user listing in the persistence contract; query by sub or email");
                }
                InnerCommand::Exit => break,
            },
            Err(e) => {
                if e.print().is_err() {
                    println!("{e}");
                }
                continue;
            }
        }
    }
    Ok(())
}
