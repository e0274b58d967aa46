//! Standalone transport daemon glue: configuration, key bootstrap and the
//! cooperative drive loop around the protocol state machine.
pub mod config;

use std::path::Path;

use crossbeam_channel as chan;
use log::*;
use thiserror::Error;

use switchyard_common::identity::{Identity, IdentityError};
use switchyard_common::time::{LocalDuration, LocalTime, RefClock};
use switchyard_p2p::fsm::{Command, Io, StateMachine};
use switchyard_p2p::revocation::RevocationError;

pub use config::{load_friends, ConfigError, NodeConfig};

/// A daemon startup or runtime error.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration cannot be used.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The private key is missing or unusable. Fatal at startup.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    /// Producing or checking a revocation certificate failed.
    #[error("revocation error: {0}")]
    Revocation(#[from] RevocationError),
    /// An I/O error outside the protocol.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle for feeding commands into a running daemon.
#[derive(Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
}

impl Handle {
    /// Submit a command to the protocol.
    pub fn command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Build the protocol instance from configuration. Fails fast when the key
/// or the friends file is unusable.
pub fn setup(config: &NodeConfig) -> Result<StateMachine<RefClock>, Error> {
    let mut rng = fastrand::Rng::new();
    let identity = Identity::load_or_generate(Path::new(&config.private_key), &mut rng)?;
    info!(target: "node", "our identity is {}", identity.peer_id());

    let friends = match &config.friends_file {
        Some(path) => {
            let friends = load_friends(path)?;
            info!(target: "node", "{} friend(s) configured", friends.len());
            friends
        }
        None => Vec::new(),
    };
    if config.friends_only && friends.is_empty() {
        warn!(target: "node", "friends-only topology with an empty friends list");
    }

    let clock = RefClock::from(LocalTime::now());
    let protocol = StateMachine::new(identity, config.protocol(friends), rng, clock);

    Ok(protocol)
}

/// Run the daemon until the command channel closes.
///
/// Carrier drivers attach out-of-process in this build, so `Write`,
/// `Connect` and `Disconnect` intents without a registered carrier are
/// logged and dropped. Timers and client commands are serviced here.
pub fn run(config: &NodeConfig, commands: chan::Receiver<Command>) -> Result<(), Error> {
    let mut protocol = setup(config)?;
    protocol.initialize(LocalTime::now());

    let mut wake_at: Option<LocalTime> = None;
    loop {
        // Drain everything the machine wants done.
        let outputs: Vec<Io> = protocol.drain().collect();
        let now = LocalTime::now();
        for io in outputs {
            match io {
                Io::SetTimer(delay) => {
                    let deadline = now + delay;
                    wake_at = Some(wake_at.map_or(deadline, |at| at.min(deadline)));
                }
                Io::Write(session, message) => {
                    debug!(target: "node", "no carrier for {}: dropping {}", session, message.cmd());
                }
                Io::Connect(address) => {
                    debug!(target: "node", "no carrier to dial {}", address);
                }
                Io::Disconnect(session, reason) => {
                    debug!(target: "node", "no carrier for {}: {}", session, reason);
                }
                Io::Event(event) => {
                    trace!(target: "node", "{}", event);
                }
            }
        }

        // Sleep until the next timer or command, whichever comes first.
        let timeout = wake_at
            .map(|at| at - LocalTime::now())
            .unwrap_or(LocalDuration::from_secs(1));
        match commands.recv_timeout(timeout.into()) {
            Ok(command) => {
                protocol.tick(LocalTime::now());
                protocol.command(command);
            }
            Err(chan::RecvTimeoutError::Timeout) => {
                let now = LocalTime::now();
                protocol.tick(now);
                if wake_at.map_or(false, |at| now >= at) {
                    wake_at = None;
                    protocol.timer_expired();
                }
            }
            Err(chan::RecvTimeoutError::Disconnected) => {
                info!(target: "node", "command channel closed, shutting down");
                return Ok(());
            }
        }
    }
}

/// Create the command channel for [`run`].
pub fn handle() -> (Handle, chan::Receiver<Command>) {
    let (commands, receiver) = chan::unbounded();
    (Handle { commands }, receiver)
}
