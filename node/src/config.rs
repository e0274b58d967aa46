//! Configuration file handling.
//!
//! The format is a plain ini dialect: `[section]` headers, `key = value`
//! pairs, `#` or `;` comments. Unknown keys are ignored so configurations
//! can be shared with other tools.
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use switchyard_common::identity::PeerId;
use switchyard_common::time::LocalDuration;
use switchyard_p2p::fsm::{self, StaticEntry, TopologyConfig};

/// Sessions floor: the process cannot function with fewer descriptors.
const MIN_SESSIONS: usize = 64;

/// A configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A line that is neither a section, a pair nor a comment.
    #[error("line {0}: expected `[section]` or `key = value`")]
    Syntax(usize),
    /// A value that does not parse for its key.
    #[error("line {0}: invalid value for `{1}`")]
    Value(usize, String),
}

/// Everything the daemon reads from its configuration file.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path to the private key file.
    pub private_key: PathBuf,
    /// Validity interval of our own HELLO.
    pub hello_expiration: LocalDuration,
    /// Maximum simultaneous neighbours.
    pub neighbour_limit: usize,
    /// Maximum simultaneous sessions, floored at the system minimum.
    pub max_sessions: usize,
    /// Whether only friends may connect.
    pub friends_only: bool,
    /// Path to the friends file.
    pub friends_file: Option<PathBuf>,
    /// Strangers are refused below this many connected friends.
    pub minimum_friends: usize,
    /// Connection count target.
    pub target_connections: usize,
    /// Revocation proof-of-work difficulty, in bits.
    pub workbits: u32,
    /// Static blacklist entries.
    pub static_blacklist: Vec<StaticEntry>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: PathBuf::from("switchyard.key"),
            hello_expiration: LocalDuration::from_secs(12 * 60 * 60),
            neighbour_limit: 50,
            max_sessions: 128,
            friends_only: false,
            friends_file: None,
            minimum_friends: 0,
            target_connections: 16,
            workbits: switchyard_p2p::revocation::DEFAULT_WORKBITS,
            static_blacklist: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut section = String::new();

        for (index, line) in text.lines().enumerate() {
            let number = index + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_lowercase();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax(number));
            };
            let key = key.trim().to_uppercase();
            let value = value.trim();

            if let Some(rest) = section.strip_prefix("transport-blacklist") {
                // Sections named `transport-blacklist-<identity>` hold one
                // peer per line; an empty value denies every carrier.
                let _ = rest;
                let peer: PeerId = key
                    .to_lowercase()
                    .parse()
                    .map_err(|_| ConfigError::Value(number, key.clone()))?;
                config.static_blacklist.push(StaticEntry {
                    peer,
                    transport: if value.is_empty() {
                        None
                    } else {
                        Some(value.to_owned())
                    },
                });
                continue;
            }

            match (section.as_str(), key.as_str()) {
                ("peer", "PRIVATE_KEY") => config.private_key = PathBuf::from(value),
                ("transport", "HELLO_EXPIRATION") => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                    // A HELLO that never outlives its creation is useless.
                    if secs == 0 {
                        return Err(ConfigError::Value(number, key.clone()));
                    }
                    config.hello_expiration = LocalDuration::from_secs(secs);
                }
                ("transport", "NEIGHBOUR_LIMIT") => {
                    config.neighbour_limit = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                }
                ("transport", "MAX_FD") => {
                    let fds: usize = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                    config.max_sessions = fds.max(MIN_SESSIONS);
                }
                ("topology", "FRIENDS-ONLY") => {
                    config.friends_only = parse_yes_no(value)
                        .ok_or_else(|| ConfigError::Value(number, key.clone()))?;
                }
                ("topology", "FRIENDS") => config.friends_file = Some(PathBuf::from(value)),
                ("topology", "MINIMUM-FRIENDS") => {
                    config.minimum_friends = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                }
                ("topology", "TARGET-CONNECTION-COUNT") => {
                    config.target_connections = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                }
                ("revocation", "WORKBITS") => {
                    config.workbits = value
                        .parse()
                        .map_err(|_| ConfigError::Value(number, key.clone()))?;
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Produce the protocol configuration, given the loaded friends list.
    pub fn protocol(&self, friends: Vec<PeerId>) -> fsm::Config {
        fsm::Config {
            hello_expiration: self.hello_expiration,
            static_blacklist: self.static_blacklist.clone(),
            topology: TopologyConfig {
                friends,
                friends_only: self.friends_only,
                minimum_friends: self.minimum_friends,
                target_connections: self.target_connections,
            },
            limits: fsm::Limits {
                neighbour_limit: self.neighbour_limit,
                max_sessions: self.max_sessions,
            },
            ..fsm::Config::default()
        }
    }
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Read the friends file: one hex peer identity per line, `#` comments.
pub fn load_friends(path: &Path) -> Result<Vec<PeerId>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut friends = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let peer: PeerId = line
            .parse()
            .map_err(|_| ConfigError::Value(index + 1, line.to_owned()))?;
        friends.push(peer);
    }
    Ok(friends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_common::identity::encode_peer_id;

    #[test]
    fn test_parse_full_config() {
        let peer = PeerId::from_bytes([0xab; 32]);
        let text = format!(
            r#"
# switchyard configuration
[PEER]
PRIVATE_KEY = /var/lib/switchyard/private.key

[transport]
HELLO_EXPIRATION = 3600
NEIGHBOUR_LIMIT = 20
MAX_FD = 10

[topology]
FRIENDS-ONLY = yes
FRIENDS = /etc/switchyard/friends
MINIMUM-FRIENDS = 2
TARGET-CONNECTION-COUNT = 8

[revocation]
WORKBITS = 20

[transport-blacklist-0000]
{} = tcp
"#,
            encode_peer_id(&peer)
        );
        let config = NodeConfig::parse(&text).unwrap();

        assert_eq!(
            config.private_key,
            PathBuf::from("/var/lib/switchyard/private.key")
        );
        assert_eq!(config.hello_expiration, LocalDuration::from_secs(3600));
        assert_eq!(config.neighbour_limit, 20);
        // MAX_FD is floored at the system minimum.
        assert_eq!(config.max_sessions, 64);
        assert!(config.friends_only);
        assert_eq!(config.minimum_friends, 2);
        assert_eq!(config.target_connections, 8);
        assert_eq!(config.workbits, 20);
        assert_eq!(config.static_blacklist.len(), 1);
        assert_eq!(config.static_blacklist[0].peer, peer);
        assert_eq!(
            config.static_blacklist[0].transport.as_deref(),
            Some("tcp")
        );
    }

    #[test]
    fn test_zero_hello_expiration_is_rejected() {
        let err = NodeConfig::parse("[transport]\nHELLO_EXPIRATION = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Value(2, _)));
    }

    #[test]
    fn test_blacklist_entry_without_transport() {
        let peer = PeerId::from_bytes([0x11; 32]);
        let text = format!("[transport-blacklist-me]\n{} =\n", encode_peer_id(&peer));
        let config = NodeConfig::parse(&text).unwrap();

        assert_eq!(config.static_blacklist[0].transport, None);
    }

    #[test]
    fn test_syntax_error_is_reported_with_line() {
        let err = NodeConfig::parse("[transport]\nwhat even is this\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(2)));
    }

    #[test]
    fn test_friends_file() {
        let a = PeerId::from_bytes([1; 32]);
        let b = PeerId::from_bytes([2; 32]);
        let dir = std::env::temp_dir().join("switchyard-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("friends");
        std::fs::write(
            &path,
            format!(
                "# friends\n{}\n\n{}\n",
                encode_peer_id(&a),
                encode_peer_id(&b)
            ),
        )
        .unwrap();

        assert_eq!(load_friends(&path).unwrap(), vec![a, b]);
        std::fs::remove_file(&path).unwrap();
    }
}
