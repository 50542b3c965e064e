//! Reads the broker username and password from a local secret file.
//!
//! The file holds the username on its first line and the password on its
//! second; trailing spaces, tabs and line endings are ignored.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing::debug;

use crate::mqtt::config::Credentials;

pub fn parse_credentials(content: &str) -> Result<Credentials> {
    let mut lines = content.lines();
    let username = lines
        .next()
        .map(|line| line.trim_end_matches([' ', '\t', '\r', '\n']))
        .unwrap_or_default();
    let password = lines
        .next()
        .map(|line| line.trim_end_matches([' ', '\t', '\r', '\n']))
        .unwrap_or_default();

    if username.is_empty() {
        return Err(eyre!("Credentials file has no username on its first line"));
    }
    if password.is_empty() {
        return Err(eyre!("Credentials file has no password on its second line"));
    }
    Ok(Credentials::new(username, password))
}

pub async fn read_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        eyre!(
            "Password file not found at {}: {}",
            path.display(),
            e
        )
    })?;
    let credentials = parse_credentials(&content)?;
    debug!(
        "Read credentials for {} from {}",
        credentials.username,
        path.display()
    );
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_two_lines() {
        let credentials = parse_credentials("operator \r\nsecret\t\nignored\n").unwrap();
        assert_eq!(credentials, Credentials::new("operator", "secret"));
    }

    #[test]
    fn missing_password_is_an_error() {
        assert!(parse_credentials("operator\n").is_err());
        assert!(parse_credentials("").is_err());
        assert!(parse_credentials("\nsecret\n").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = read_credentials(Path::new("/nonexistent/mqttify/passwd.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Password file not found"));
    }
}
