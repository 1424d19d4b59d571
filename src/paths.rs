//! Centralized path resolution for easel
//!
//! Follows XDG Base Directory Specification with 12-factor env var overrides.
//!
//! ## Directory Layout
//!
//! ```text
//! ~/.local/share/easel/        (XDG_DATA_HOME)
//! ├── lora.db
//! ├── content.db
//! ├── conversation.db
//! ├── hosting.db
//! └── images/
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EASEL_DATA_DIR` | Data directory | `~/.local/share/easel` |
//! | `EASEL_IMAGE_OUT_PATH` | Generated image output | `data_dir()/images` |

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::debug;

/// Get the XDG data directory for easel
///
/// Priority: `EASEL_DATA_DIR` > `XDG_DATA_HOME` > `~/.local/share`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("EASEL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("easel");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/easel");
    }

    // Last resort: current directory
    PathBuf::from(".")
}

/// Path to the LoRA catalog database
pub fn lora_db_path() -> PathBuf {
    data_dir().join("lora.db")
}

/// Path to the content taxonomy database
pub fn content_db_path() -> PathBuf {
    data_dir().join("content.db")
}

/// Path to the conversation/personality database
pub fn conversation_db_path() -> PathBuf {
    data_dir().join("conversation.db")
}

/// Path to the hosted-user/upload-history database
pub fn hosting_db_path() -> PathBuf {
    data_dir().join("hosting.db")
}

/// Directory generated images are written to
///
/// Priority: `EASEL_IMAGE_OUT_PATH` env var > `data_dir()/images`
pub fn image_out_dir() -> PathBuf {
    std::env::var("EASEL_IMAGE_OUT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("images"))
}

/// Ensure required directories exist
pub fn ensure_dirs() -> Result<()> {
    for dir in [data_dir(), image_out_dir()] {
        if !dir.exists() {
            debug!("creating directory: {}", dir.display());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify env vars
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_path_env_vars() {
        env::remove_var("EASEL_DATA_DIR");
        env::remove_var("EASEL_IMAGE_OUT_PATH");
        env::remove_var("XDG_DATA_HOME");
    }

    #[test]
    fn test_env_var_override_data_dir() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("EASEL_DATA_DIR", "/custom/easel");
        assert_eq!(data_dir(), PathBuf::from("/custom/easel"));
        assert_eq!(lora_db_path(), PathBuf::from("/custom/easel/lora.db"));
        clear_path_env_vars();
    }

    #[test]
    fn test_xdg_data_home_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("XDG_DATA_HOME", "/xdg/data");
        assert_eq!(data_dir(), PathBuf::from("/xdg/data/easel"));
        clear_path_env_vars();
    }

    #[test]
    fn test_image_out_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_path_env_vars();
        env::set_var("EASEL_IMAGE_OUT_PATH", "/srv/images");
        assert_eq!(image_out_dir(), PathBuf::from("/srv/images"));
        clear_path_env_vars();
    }
}
