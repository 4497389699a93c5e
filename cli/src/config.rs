use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080/api";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub server_url: String,
    pub token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var_os("STRIDE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("", "", "stride")
                .context("Could not determine home directory")?
                .data_dir()
                .to_path_buf(),
        };
        Self::from_parts(
            data_dir,
            std::env::var("STRIDE_SERVER_URL").ok(),
            std::env::var("STRIDE_TOKEN").ok(),
        )
    }

    /// Resolve everything relative to `data_dir`. The token comes from
    /// `token` if set, otherwise from the `token` file in the data dir.
    pub fn from_parts(
        data_dir: PathBuf,
        server_url: Option<String>,
        token: Option<String>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let token = match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => Some(token.trim().to_string()),
            None => read_token(&token_path(&data_dir))?,
        };

        Ok(Config {
            db_path: data_dir.join("stride.db"),
            server_url: server_url
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            token,
            data_dir,
        })
    }

    /// Remove the stored token file. Returns whether one existed.
    pub fn forget_token(&self) -> Result<bool> {
        let path = token_path(&self.data_dir);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).context("Failed to remove token file")?;
        Ok(true)
    }
}

fn token_path(data_dir: &Path) -> PathBuf {
    data_dir.join("token")
}

fn read_token(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let token = std::fs::read_to_string(path).context("Failed to read token file")?;
    let token = token.trim();
    Ok((!token.is_empty()).then(|| token.to_string()))
}
