//! Chooses which OAuth client a user's Gmail calls go through.
//!
//! Users in an organization with an active Gmail integration use that
//! organization's OAuth app; everyone else uses the platform app.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::db::models::IntegrationStatus;
use crate::db::{Database, DbError};

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct OAuthClientCredentials {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for OAuthClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientCredentials")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Platform,
    Organization,
}

pub struct CredentialResolver {
    db: Arc<Database>,
    platform: OAuthClientCredentials,
}

impl CredentialResolver {
    pub fn new(db: Arc<Database>, platform: OAuthClientCredentials) -> Self {
        Self { db, platform }
    }

    pub fn platform(&self) -> &OAuthClientCredentials {
        &self.platform
    }

    /// Never fails: lookup errors fall back to the platform credentials.
    pub fn resolve_oauth_client(&self, user_id: &str) -> OAuthClientCredentials {
        self.resolve_with_source(user_id).0
    }

    pub fn resolve_with_source(&self, user_id: &str) -> (OAuthClientCredentials, CredentialSource) {
        match self.lookup_org_credentials(user_id) {
            Ok(Some(credentials)) => {
                debug!(user_id, "using organization oauth client");
                (credentials, CredentialSource::Organization)
            }
            Ok(None) => (self.platform.clone(), CredentialSource::Platform),
            Err(error) => {
                warn!(
                    user_id,
                    "organization credential lookup failed, using platform client: {error}"
                );
                (self.platform.clone(), CredentialSource::Platform)
            }
        }
    }

    fn lookup_org_credentials(
        &self,
        user_id: &str,
    ) -> Result<Option<OAuthClientCredentials>, DbError> {
        let Some(org_id) = self.db.organization_for_user(user_id)? else {
            return Ok(None);
        };

        Ok(self
            .db
            .org_credentials(&org_id)?
            .filter(|credentials| credentials.status == IntegrationStatus::Active)
            .map(|credentials| OAuthClientCredentials {
                client_id: credentials.client_id,
                client_secret: credentials.client_secret,
                redirect_uri: credentials.redirect_uri,
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{CredentialResolver, CredentialSource, OAuthClientCredentials};
    use crate::db::models::{IntegrationStatus, OrgCredentials};
    use crate::db::Database;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("gmail-sync-credentials-{}.db", Uuid::new_v4()))
    }

    fn platform() -> OAuthClientCredentials {
        OAuthClientCredentials {
            client_id: "platform-client".to_string(),
            client_secret: "platform-secret".to_string(),
            redirect_uri: "https://platform.example.com/auth/gmail/callback".to_string(),
        }
    }

    fn org(status: IntegrationStatus) -> OrgCredentials {
        OrgCredentials {
            org_id: "org-1".to_string(),
            client_id: "org-client".to_string(),
            client_secret: "org-secret".to_string(),
            redirect_uri: "https://org.example.com/callback".to_string(),
            status,
        }
    }

    #[test]
    fn user_without_organization_gets_platform_credentials() {
        let path = temp_db_path();
        let db = Arc::new(Database::open(&path).expect("open db"));
        let resolver = CredentialResolver::new(db, platform());

        let (resolved, source) = resolver.resolve_with_source("solo-user");
        assert_eq!(resolved, platform());
        assert_eq!(source, CredentialSource::Platform);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn inactive_organization_credentials_fall_back_to_platform() {
        let path = temp_db_path();
        let db = Arc::new(Database::open(&path).expect("open db"));
        db.set_membership("u1", "org-1", "member").expect("membership");
        db.upsert_org_credentials(&org(IntegrationStatus::Inactive))
            .expect("org credentials");
        let resolver = CredentialResolver::new(db, platform());

        assert_eq!(resolver.resolve_oauth_client("u1"), platform());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn active_organization_credentials_win() {
        let path = temp_db_path();
        let db = Arc::new(Database::open(&path).expect("open db"));
        db.set_membership("u1", "org-1", "member").expect("membership");
        db.upsert_org_credentials(&org(IntegrationStatus::Active))
            .expect("org credentials");
        let resolver = CredentialResolver::new(db, platform());

        let (resolved, source) = resolver.resolve_with_source("u1");
        assert_eq!(resolved.client_id, "org-client");
        assert_eq!(resolved.client_secret, "org-secret");
        assert_eq!(resolved.redirect_uri, "https://org.example.com/callback");
        assert_eq!(source, CredentialSource::Organization);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn member_of_organization_without_integration_gets_platform() {
        let path = temp_db_path();
        let db = Arc::new(Database::open(&path).expect("open db"));
        db.set_membership("u1", "org-without-app", "owner")
            .expect("membership");
        let resolver = CredentialResolver::new(db, platform());

        assert_eq!(resolver.resolve_oauth_client("u1"), platform());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn lookup_failure_degrades_to_platform() {
        let path = temp_db_path();
        let db = Arc::new(Database::open(&path).expect("open db"));
        db.conn()
            .expect("conn")
            .execute_batch("DROP TABLE user_organizations;")
            .expect("drop table");
        let resolver = CredentialResolver::new(db, platform());

        assert_eq!(resolver.resolve_oauth_client("u1"), platform());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn debug_output_hides_client_secret() {
        let rendered = format!("{:?}", platform());
        assert!(rendered.contains("platform-client"));
        assert!(!rendered.contains("platform-secret"));
    }
}
