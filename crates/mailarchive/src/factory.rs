//! Provider credentials and the factory turning a source into a connector.

use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::connector::eml::EmlConnector;
use crate::connector::google::GoogleWorkspaceConnector;
use crate::connector::imap::ImapConnector;
use crate::connector::mbox::MboxConnector;
use crate::connector::microsoft::MicrosoftConnector;
use crate::connector::outlook_personal::OutlookPersonalConnector;
use crate::connector::pst::PstConnector;
use crate::connector::{ConnectorError, EmailConnector};
use crate::db::source_repo::IngestionSource;
use crate::retry::RetryPolicy;
use crate::source::ProviderKind;
use crate::storage::StorageService;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleWorkspaceCredentials {
    /// The service account key file contents (JSON).
    pub service_account_key_json: String,
    /// Admin the service account impersonates for directory calls.
    pub impersonated_admin_email: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microsoft365Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_secure")]
    pub secure: bool,
    pub username: String,
    pub password: String,
}

fn default_secure() -> bool {
    true
}

/// Where an uploaded archive lives: a storage key or a path on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileImportCredentials {
    #[serde(default)]
    pub uploaded_file_name: Option<String>,
    #[serde(default)]
    pub uploaded_file_path: Option<String>,
    #[serde(default)]
    pub local_file_path: Option<String>,
}

impl FileImportCredentials {
    /// The path the archive is read from, local path first.
    pub fn file_path(&self) -> Option<&str> {
        self.local_file_path
            .as_deref()
            .or(self.uploaded_file_path.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// The uploaded storage key to delete once imported. Local files are
    /// never deleted.
    pub fn uploaded_key(&self) -> Option<&str> {
        match self.local_file_path {
            Some(_) => None,
            None => self.uploaded_file_path.as_deref(),
        }
    }

    /// A name for the synthetic mailbox: the uploaded name, or the local
    /// file's stem.
    pub fn display_name(&self, extension: &str) -> String {
        if let Some(name) = self.uploaded_file_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        self.file_path()
            .and_then(|p| p.rsplit('/').next())
            .map(|f| f.trim_end_matches(extension).to_string())
            .unwrap_or_else(|| format!("{}-import", extension.trim_start_matches('.')))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookPersonalCredentials {
    pub account_email: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Access token expiry, epoch milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Decrypted credentials, tagged by provider kind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderCredentials {
    GoogleWorkspace(GoogleWorkspaceCredentials),
    #[serde(rename = "microsoft_365")]
    Microsoft365(Microsoft365Credentials),
    GenericImap(ImapCredentials),
    PstImport(FileImportCredentials),
    EmlImport(FileImportCredentials),
    MboxImport(FileImportCredentials),
    OutlookPersonal(OutlookPersonalCredentials),
}

impl ProviderCredentials {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderCredentials::GoogleWorkspace(_) => ProviderKind::GoogleWorkspace,
            ProviderCredentials::Microsoft365(_) => ProviderKind::Microsoft365,
            ProviderCredentials::GenericImap(_) => ProviderKind::GenericImap,
            ProviderCredentials::PstImport(_) => ProviderKind::PstImport,
            ProviderCredentials::EmlImport(_) => ProviderKind::EmlImport,
            ProviderCredentials::MboxImport(_) => ProviderKind::MboxImport,
            ProviderCredentials::OutlookPersonal(_) => ProviderKind::OutlookPersonal,
        }
    }

    /// The uploaded archive backing a file-import source, if any.
    pub fn file_import(&self) -> Option<&FileImportCredentials> {
        match self {
            ProviderCredentials::PstImport(f)
            | ProviderCredentials::EmlImport(f)
            | ProviderCredentials::MboxImport(f) => Some(f),
            _ => None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Application-level OAuth client used for Outlook personal accounts.
#[derive(Clone)]
pub struct OutlookAppCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Shared collaborators handed to every connector.
#[derive(Clone)]
pub struct FactoryContext {
    pub storage: Arc<dyn StorageService>,
    pub outlook_app: Option<OutlookAppCredentials>,
    pub retry: RetryPolicy,
    /// The `readpst` executable used for PST extraction.
    pub readpst_bin: String,
}

impl FactoryContext {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self {
            storage,
            outlook_app: None,
            retry: RetryPolicy::default(),
            readpst_bin: "readpst".to_string(),
        }
    }
}

/// Builds connectors. Implemented by tests to inject fakes.
pub trait ConnectorFactory: Send + Sync {
    fn create(
        &self,
        source: &IngestionSource,
        credentials: ProviderCredentials,
    ) -> Result<Box<dyn EmailConnector>, ConnectorError>;
}

/// The production factory over every supported provider.
pub struct ProviderConnectorFactory {
    ctx: FactoryContext,
}

impl ProviderConnectorFactory {
    pub fn new(ctx: FactoryContext) -> Self {
        Self { ctx }
    }
}

impl ConnectorFactory for ProviderConnectorFactory {
    fn create(
        &self,
        source: &IngestionSource,
        credentials: ProviderCredentials,
    ) -> Result<Box<dyn EmailConnector>, ConnectorError> {
        create_connector(source.provider, credentials, &self.ctx)
    }
}

/// Creates the connector for `provider`. The credentials must be of the
/// same kind.
pub fn create_connector(
    provider: ProviderKind,
    credentials: ProviderCredentials,
    ctx: &FactoryContext,
) -> Result<Box<dyn EmailConnector>, ConnectorError> {
    if credentials.kind() != provider {
        return Err(ConnectorError::UnsupportedProvider(format!(
            "source is {} but credentials are for {}",
            provider,
            credentials.kind()
        )));
    }

    let connector: Box<dyn EmailConnector> = match credentials {
        ProviderCredentials::GoogleWorkspace(c) => {
            Box::new(GoogleWorkspaceConnector::new(c, ctx.retry)?)
        }
        ProviderCredentials::Microsoft365(c) => Box::new(MicrosoftConnector::new(c, ctx.retry)?),
        ProviderCredentials::GenericImap(c) => Box::new(ImapConnector::new(c, ctx.retry)?),
        ProviderCredentials::PstImport(c) => Box::new(PstConnector::new(
            c,
            Arc::clone(&ctx.storage),
            ctx.readpst_bin.clone(),
        )),
        ProviderCredentials::EmlImport(c) => {
            Box::new(EmlConnector::new(c, Arc::clone(&ctx.storage)))
        }
        ProviderCredentials::MboxImport(c) => {
            Box::new(MboxConnector::new(c, Arc::clone(&ctx.storage)))
        }
        ProviderCredentials::OutlookPersonal(c) => {
            let app = ctx.outlook_app.clone().ok_or_else(|| {
                ConnectorError::Config("Outlook personal OAuth client is not configured".into())
            })?;
            Box::new(OutlookPersonalConnector::new(c, app, ctx.retry)?)
        }
    };
    Ok(connector)
}
