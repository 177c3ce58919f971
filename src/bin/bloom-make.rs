//! Build a revocation filter holding the given certificates and write it as a
//! bloom filter message, the form light clients receive from the relay.
use anyhow::Context;
use gpchain::{
    pcn::certificate_from_pem,
    relay::{BloomFilterState, BloomMessage, BloomParameters},
    types::Fingerprint,
};
use std::path::PathBuf;
use structopt::StructOpt;
use tracing::Level;

#[derive(StructOpt)]
struct App {
    #[structopt(long = "cert", help = "PEM certificate to add to the filter.")]
    certs:    Vec<PathBuf>,
    #[structopt(long = "out", help = "Where to write the bloom filter message.")]
    out:      PathBuf,
    #[structopt(long = "index", help = "Relay block index of the message.", default_value = "1")]
    index:    u32,
    #[structopt(
        long = "expected-items",
        help = "Number of revocations the filter is sized for.",
        default_value = "1000"
    )]
    capacity: usize,
    #[structopt(
        long = "false-positive-rate",
        help = "Target false positive rate at capacity.",
        default_value = "0.000001"
    )]
    rate:     f64,
}

fn main() -> anyhow::Result<()> {
    let app = App::from_args();
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut filter = BloomFilterState::new(&BloomParameters {
        expected_items:      app.capacity,
        false_positive_rate: app.rate,
    })?;
    for path in &app.certs {
        let pem = std::fs::read(path).with_context(|| format!("Cannot read {}.", path.display()))?;
        let cert = certificate_from_pem(&pem)?;
        let key = Fingerprint::of_certificate(&cert)?;
        filter.insert(&key);
        tracing::info!("Added {} with key {key}.", path.display());
    }
    let message = BloomMessage {
        index:  app.index,
        filter: filter.to_bytes(),
    };
    std::fs::write(&app.out, serde_json::to_vec(&message)?)
        .with_context(|| format!("Cannot write {}.", app.out.display()))?;
    println!(
        "Wrote a filter with {} certificates, {} bits and {} hashes to {}.",
        app.certs.len(),
        filter.bit_count(),
        filter.hash_count(),
        app.out.display()
    );
    Ok(())
}
