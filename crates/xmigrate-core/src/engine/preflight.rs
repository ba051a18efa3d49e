//! Checks that must pass before anything is written.

use crate::client::RestClient;
use crate::{MigrateError, Result};
use std::collections::BTreeSet;
use tracing::info;

/// Every datatype enabled on the source must be enabled on the destination,
/// otherwise sessions of that type cannot be created there.
pub async fn check_datatypes(source: &dyn RestClient, destination: &dyn RestClient) -> Result<()> {
    let on_source: BTreeSet<String> = source.datatypes().await?.into_iter().collect();
    let on_destination: BTreeSet<String> = destination.datatypes().await?.into_iter().collect();

    let missing: Vec<String> = on_source.difference(&on_destination).cloned().collect();
    if !missing.is_empty() {
        return Err(MigrateError::UnsupportedDatatype { missing });
    }
    info!("All {} source datatypes are enabled on destination", on_source.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryServer;
    use crate::network::ServerRole;

    #[tokio::test]
    async fn test_missing_datatypes_are_reported() {
        let source = InMemoryServer::new(ServerRole::Source, "SRC");
        source.set_datatypes(&["xnat:mrSessionData", "xnat:petSessionData"]);
        let destination = InMemoryServer::new(ServerRole::Destination, "DST");
        destination.set_datatypes(&["xnat:mrSessionData"]);

        let err = check_datatypes(&source, &destination).await.unwrap_err();
        assert!(err.is_fatal());
        match err {
            MigrateError::UnsupportedDatatype { missing } => {
                assert_eq!(missing, vec!["xnat:petSessionData".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_subset_passes() {
        let source = InMemoryServer::new(ServerRole::Source, "SRC");
        source.set_datatypes(&["xnat:mrSessionData"]);
        let destination = InMemoryServer::new(ServerRole::Destination, "DST");
        destination.set_datatypes(&["xnat:mrSessionData", "xnat:ctSessionData"]);
        assert!(check_datatypes(&source, &destination).await.is_ok());
    }
}
