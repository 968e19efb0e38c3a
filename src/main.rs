//! nvim-rpc - attach to a running host and print what it advertises.
//!
//! Usage: `nvim-rpc [ADDRESS]`
//!
//! `ADDRESS` is `host:port` or a socket path; without it the address is
//! taken from `$NVIM_LISTEN_ADDRESS` (or `$NVIM`).

use anyhow::{bail, Context, Result};

use nvim_rpc::{attach, logging, TransportTarget};

fn main() -> Result<()> {
    if let Err(e) = logging::init_from_env() {
        eprintln!("Logging disabled: {:#}", e);
    }

    let target = match std::env::args().nth(1) {
        Some(address) if address == "-h" || address == "--help" => {
            println!("Usage: nvim-rpc [ADDRESS]");
            return Ok(());
        }
        Some(address) => TransportTarget::from_address(&address),
        None => match TransportTarget::from_env() {
            Some(target) => target,
            None => bail!("No address given and NVIM_LISTEN_ADDRESS is not set"),
        },
    };

    tracing::info!("Connecting to {}", target);
    let session =
        attach(target.clone()).with_context(|| format!("Failed to attach to {}", target))?;
    let channel = session
        .handshake()
        .with_context(|| format!("Handshake with {} failed", target))?;

    println!("target:  {}", target);
    println!("channel: {}", channel);
    match session.codec().types() {
        Some(types) if !types.is_empty() => {
            println!("types:");
            for (code, name) in types.names() {
                println!("  {:>3}  {}", code, name);
            }
        }
        _ => println!("types:   (none)"),
    }

    Ok(())
}
