//! Watches a running mpv over its JSON IPC socket and obtains the trakt
//! token used to sync what it plays.

pub mod config;
pub mod mpv;
pub mod trakt;

pub use config::{default_config_path, Config, ConfigError, MonitorConfig, TraktConfig};
pub use mpv::{MonitorError, MonitorHandler, MonitorState, MpvMonitor, NoopHandler};
pub use trakt::{TokenError, TraktAuth};
