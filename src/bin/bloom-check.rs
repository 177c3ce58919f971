//! Check whether a certificate is in the revocation filter of a bloom filter
//! message. Exits with 0 if it is (possibly a false positive), 1 if it is
//! certainly not, and 2 on error.
use anyhow::Context;
use gpchain::{
    pcn::certificate_from_pem,
    relay::{BloomFilterState, BloomMessage},
    types::Fingerprint,
};
use std::{path::PathBuf, process::ExitCode};
use structopt::StructOpt;
use tracing::Level;

#[derive(StructOpt)]
struct App {
    #[structopt(long = "cert", help = "PEM certificate to look up.")]
    cert:   PathBuf,
    #[structopt(long = "filter", help = "Bloom filter message to look in.")]
    filter: PathBuf,
}

fn check(app: &App) -> anyhow::Result<bool> {
    let pem = std::fs::read(&app.cert).with_context(|| format!("Cannot read {}.", app.cert.display()))?;
    let key = Fingerprint::of_certificate(&*certificate_from_pem(&pem)?)?;
    let message: BloomMessage = serde_json::from_slice(
        &std::fs::read(&app.filter).with_context(|| format!("Cannot read {}.", app.filter.display()))?,
    )?;
    let filter = BloomFilterState::from_bytes(&message.filter)?;
    tracing::debug!("Filter of relay block {} with {} bits.", message.index, filter.bit_count());
    Ok(filter.contains(&key))
}

fn main() -> ExitCode {
    let app = App::from_args();
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    match check(&app) {
        Ok(true) => {
            println!("Revoked: {} is in the filter.", app.cert.display());
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("Not revoked: {} is not in the filter.", app.cert.display());
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}
