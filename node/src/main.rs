//! Switchyard transport daemon.
use std::path::PathBuf;
use std::process;

use argh::FromArgs;
use log::*;

use switchyard_common::identity::Identity;
use switchyard_node as node;
use switchyard_p2p::revocation;

#[derive(FromArgs)]
/// A peer-to-peer transport daemon.
struct Options {
    /// path to the configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// log debug output
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// produce a revocation certificate for our key and exit
    #[argh(switch)]
    revoke: bool,

    /// where to write the revocation certificate
    #[argh(option)]
    revocation_file: Option<PathBuf>,
}

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{:<5} [{}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

fn main() {
    let options: Options = argh::from_env();
    let level = if options.verbose {
        Level::Debug
    } else {
        Level::Info
    };
    log::set_boxed_logger(Box::new(Logger { level }))
        .map(|()| log::set_max_level(level.to_level_filter()))
        .ok();

    let config = match &options.config {
        Some(path) => match node::NodeConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(target: "node", "fatal: {}", err);
                process::exit(1);
            }
        },
        None => node::NodeConfig::default(),
    };

    if options.revoke {
        if let Err(err) = revoke(&config, options.revocation_file) {
            error!(target: "node", "fatal: {}", err);
            process::exit(1);
        }
        return;
    }

    let (_handle, commands) = node::handle();
    if let Err(err) = node::run(&config, commands) {
        error!(target: "node", "fatal: {}", err);
        process::exit(1);
    }
}

fn revoke(config: &node::NodeConfig, output: Option<PathBuf>) -> Result<(), node::Error> {
    let mut rng = fastrand::Rng::new();
    let identity = Identity::load_or_generate(&config.private_key, &mut rng)?;
    let path = output.unwrap_or_else(|| PathBuf::from("revocation.cert"));

    info!(
        target: "node",
        "searching a {}-bit proof of work for {}..",
        config.workbits,
        identity.peer_id()
    );
    let certificate = revocation::revoke(&identity, config.workbits, &mut rng);
    revocation::store(&certificate, &path)?;
    info!(target: "node", "revocation certificate written to {}", path.display());

    // Re-read and check what we wrote.
    let stored = revocation::load(&path)?;
    match revocation::validate_for(&stored, &identity.public_key(), config.workbits) {
        Ok(()) => info!(target: "node", "certificate validates"),
        Err(err) => {
            error!(target: "node", "stored certificate does not validate: {}", err);
            process::exit(1);
        }
    }
    Ok(())
}
