use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory at {}", path.display()))
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Keeps resource ids usable inside a filename template.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::sanitize_component;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_component("abc/../x y"), "abc----x-y");
        assert_eq!(sanitize_component("dQw4w9WgXcQ"), "dQw4w9WgXcQ");
    }
}
