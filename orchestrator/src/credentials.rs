//! One-time delivery of minted deployer credentials.
//!
//! The secret half is shown or written exactly once, at creation time,
//! and cannot be recovered afterwards. It goes to stdout or to an
//! owner-only file, never through the log stream.

use std::path::Path;

use secrecy::ExposeSecret;
use serde_json::json;

use crate::errors::OrchestratorError;
use crate::fsio::File;
use crate::provider::CredentialPair;

/// Print the pair to stdout, outside the log stream.
pub fn print_credentials(app: &str, pair: &CredentialPair) {
    println!();
    println!("Deployer credentials for {} (shown once, store them now):", app);
    println!("  access_key_id: {}", pair.access_key_id);
    println!("  secret:        {}", pair.secret.expose_secret());
    println!();
}

/// Write the pair to a file readable only by its owner.
pub async fn write_credentials(
    pair: &CredentialPair,
    path: &Path,
) -> Result<(), OrchestratorError> {
    let payload = json!({
        "access_key_id": pair.access_key_id,
        "secret": pair.secret.expose_secret(),
    });

    let file = File::new(path);
    file.write_atomic(serde_json::to_string_pretty(&payload)?.as_bytes()).await?;
    file.set_permissions_600().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsio::Dir;
    use secrecy::SecretString;

    fn pair() -> CredentialPair {
        CredentialPair {
            access_key_id: "RISE0123456789ABCDEF".to_string(),
            secret: SecretString::from("wJalrXUtnFEMI/K7MDENG/bPxRfiCY"),
        }
    }

    #[test]
    fn test_debug_rendering_redacts_the_secret() {
        let rendered = format!("{:?}", pair());
        assert!(rendered.contains("RISE0123456789ABCDEF"));
        assert!(!rendered.contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn test_written_file_is_owner_only() {
        let dir = Dir::create_temp_dir("credentials-test").await.unwrap();
        let path = dir.path().join("deployer.json");

        write_credentials(&pair(), &path).await.unwrap();

        let written: serde_json::Value = File::new(&path).read_json().await.unwrap();
        assert_eq!(written["access_key_id"], "RISE0123456789ABCDEF");
        assert_eq!(written["secret"], "wJalrXUtnFEMI/K7MDENG/bPxRfiCY");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        dir.delete().await.unwrap();
    }
}
