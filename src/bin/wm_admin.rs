//! wm_admin: offline operator CLI for credential issuance and chain
//! validation, without standing up the registry's HTTP server.
//!
//! Usage:
//!   wm_admin create-company --name <name>
//!   wm_admin anchor --text <text> --issuer-id <id> --signature <0x-hex>
//!   wm_admin validate-chain
//!
//! State is process-local (in-memory), so this is primarily useful for
//! smoke-testing the registry's core logic without a running server, or as
//! a template for wiring a persistent store in later.

#![forbid(unsafe_code)]

use std::env;

use watermark_provenance::registry::chain::{self, ChainStore, InMemoryChainStore};
use watermark_provenance::registry::credentials::{self, InMemoryCredentialStore};
use watermark_provenance::registry::signature::hash_text;

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  wm_admin create-company --name <name>");
    eprintln!("  wm_admin anchor --text <text> --issuer-id <id> --signature <0x-hex>");
    eprintln!("  wm_admin validate-chain");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        std::process::exit(2);
    };

    match command.as_str() {
        "create-company" => {
            let name = parse_flag(&args, "--name").ok_or_else(|| anyhow::anyhow!("--name is required"))?;
            let store = InMemoryCredentialStore::default();
            let (credential, secret) = credentials::create_company(&name, &store).await?;
            println!("issuer_id:        {}", credential.issuer_id);
            println!("eth_address:      {}", credential.eth_address);
            println!("public_key_hex:   {}", credential.public_key_hex);
            println!("private_key_hex:  {}  (save this now, it is never shown again)", secret.private_key_hex);
        }
        "anchor" => {
            let text = parse_flag(&args, "--text").ok_or_else(|| anyhow::anyhow!("--text is required"))?;
            let issuer_id: u32 = parse_flag(&args, "--issuer-id")
                .ok_or_else(|| anyhow::anyhow!("--issuer-id is required"))?
                .parse()?;
            let signature = parse_flag(&args, "--signature").ok_or_else(|| anyhow::anyhow!("--signature is required"))?;

            let store = InMemoryChainStore::default();
            let data_hash = hash_text(&text);
            let receipt = store.anchor(&data_hash, issuer_id, &signature, "{}").await;
            println!("data_hash:  {}", receipt.data_hash);
            println!("tx_hash:    {}", receipt.tx_hash);
            println!("block_num:  {}", receipt.block_num);
        }
        "validate-chain" => {
            let store = InMemoryChainStore::default();
            let (valid, message) = chain::validate_chain(&store).await;
            println!("{}", if valid { "OK" } else { "FAIL" });
            println!("{message}");
            if !valid {
                std::process::exit(1);
            }
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            std::process::exit(2);
        }
    }

    Ok(())
}
