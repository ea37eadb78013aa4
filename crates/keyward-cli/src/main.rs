//! Command-line demonstrator: fork the key daemon, load a PEM private key,
//! and drive the proxy operations against it. The parent process (this
//! binary) never touches the secret half of the key.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use keyward::{KeyDaemon, RsaOps};
use openssl::nid::Nid;
use sha2::{Digest, Sha256, Sha384, Sha512};

#[derive(Debug, Parser)]
#[command(name = "keyward", version)]
struct Cli {
    /// PEM RSA private key to load into the daemon.
    #[arg(long)]
    key: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Sign a message through the daemon and print the signature as hex.
    Sign {
        /// Digest algorithm applied to the message before signing.
        #[arg(long, value_enum, default_value = "sha256")]
        digest: DigestAlg,

        message: String,
    },
    /// Print the public components the parent holds for the key.
    Pubkey,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DigestAlg {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlg {
    fn nid(self) -> Nid {
        match self {
            Self::Sha256 => Nid::SHA256,
            Self::Sha384 => Nid::SHA384,
            Self::Sha512 => Nid::SHA512,
        }
    }

    fn digest(self, msg: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(msg).to_vec(),
            Self::Sha384 => Sha384::digest(msg).to_vec(),
            Self::Sha512 => Sha512::digest(msg).to_vec(),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let daemon = KeyDaemon::spawn().context("failed to spawn the key daemon")?;
    let key = daemon
        .load_key(&cli.key)
        .with_context(|| format!("failed to load {}", cli.key.display()))?;

    match cli.cmd {
        Cmd::Sign { digest, message } => {
            let tbs = digest.digest(message.as_bytes());
            let sig = key.sign(digest.nid(), &tbs)?;
            if !key.verify(digest.nid(), &tbs, &sig)? {
                bail!("daemon produced a signature that does not verify");
            }
            println!("{}", hex::encode(sig));
        }
        Cmd::Pubkey => {
            let e = key.public().e().to_hex_str()?;
            let n = key.public().n().to_hex_str()?;
            println!("e = {}", &*e);
            println!("n = {}", &*n);
        }
    }
    Ok(())
}
