pub mod cli;
pub mod config;
pub mod host;
pub mod mux;
pub mod resolve;
pub mod ssh;
pub mod state;
pub mod summary;
pub mod targets;
pub mod utils;

pub use cli::Cli;
pub use config::Settings;
pub use state::State;

use std::sync::Arc;

/// Stock SSH port used for every hop.
pub const SSH_PORT: u16 = 22;

/// Shared program context handed to every subsystem: the state serializer
/// handle and the resolved settings.
#[derive(Clone)]
pub struct Env {
    pub state: State,
    pub cfg: Arc<Settings>,
}

impl Env {
    pub fn new(state: State, cfg: Arc<Settings>) -> Self {
        Self { state, cfg }
    }
}
