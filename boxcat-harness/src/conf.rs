//! Generated `key = value` configuration for the server under test.

use boxcat_core::error::Result;
use std::path::{Path, PathBuf};

pub const CONF_FILE_NAME: &str = "server.conf";

/// `listen-port` value meaning "use the inherited descriptor".
pub const INHERITED_PORT: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConf {
    pub listen_port: i32,
    pub server_name: String,
}

impl ServerConf {
    pub fn render(&self) -> String {
        format!(
            "listen-port = {}\nserver-name = {}\n",
            self.listen_port, self.server_name
        )
    }

    /// Write the config into `dir` and return its path.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(CONF_FILE_NAME);
        tokio::fs::write(&path, self.render()).await?;
        Ok(path)
    }
}
