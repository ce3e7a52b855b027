use regex::Regex;
use std::sync::Arc;
use tracing::debug;

use crate::rcon::{ConsoleTransport, ServerEndpoint};

pub const LIST_PLAYERS_COMMAND: &str = "list";

/// Extract N from "There are N of a max M players online: ...".
///
/// Returns `None` when either marker is missing or N is not a non-negative
/// integer.
pub fn parse_player_count(response: &str) -> Option<u32> {
    let re = Regex::new(r"There are (.+?) of a max").ok()?;
    let caps = re.captures(response)?;
    caps.get(1)?.as_str().trim().parse::<u32>().ok()
}

/// Reads the live player count through the remote console.
#[derive(Clone)]
pub struct PlayerStatusReader {
    console: Arc<dyn ConsoleTransport>,
    max_players: u32,
}

impl PlayerStatusReader {
    pub fn new(console: Arc<dyn ConsoleTransport>, max_players: u32) -> Self {
        Self {
            console,
            max_players,
        }
    }

    /// Current player count, or `None` when it cannot be determined.
    pub async fn get_player_count(&self, endpoint: &ServerEndpoint) -> Option<u32> {
        match self.console.execute(endpoint, LIST_PLAYERS_COMMAND).await {
            Ok(response) => {
                let count = parse_player_count(&response);
                if count.is_none() {
                    debug!("Unrecognised player list response: {:?}", response);
                }
                count
            }
            Err(e) => {
                debug!("Player count unavailable: {}", e);
                None
            }
        }
    }

    /// Configured player limit; never asks the server.
    pub fn get_player_max(&self) -> u32 {
        self.max_players
    }
}
