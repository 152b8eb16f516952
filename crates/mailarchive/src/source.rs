//! Ingestion source domain types: provider kinds and the lifecycle status
//! state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connector::ConnectorError;

/// The kind of mail origin a source pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleWorkspace,
    #[serde(rename = "microsoft_365")]
    Microsoft365,
    GenericImap,
    PstImport,
    EmlImport,
    MboxImport,
    OutlookPersonal,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 7] = [
        ProviderKind::GoogleWorkspace,
        ProviderKind::Microsoft365,
        ProviderKind::GenericImap,
        ProviderKind::PstImport,
        ProviderKind::EmlImport,
        ProviderKind::MboxImport,
        ProviderKind::OutlookPersonal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleWorkspace => "google_workspace",
            ProviderKind::Microsoft365 => "microsoft_365",
            ProviderKind::GenericImap => "generic_imap",
            ProviderKind::PstImport => "pst_import",
            ProviderKind::EmlImport => "eml_import",
            ProviderKind::MboxImport => "mbox_import",
            ProviderKind::OutlookPersonal => "outlook_personal",
        }
    }

    /// File-based kinds import an uploaded archive once and finish as
    /// `imported` rather than `active`.
    pub fn is_file_import(&self) -> bool {
        matches!(
            self,
            ProviderKind::PstImport | ProviderKind::EmlImport | ProviderKind::MboxImport
        )
    }

    /// Status a source of this kind settles into after a successful pass.
    pub fn settled_status(&self) -> SourceStatus {
        if self.is_file_import() {
            SourceStatus::Imported
        } else {
            SourceStatus::Active
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConnectorError::UnsupportedProvider(s.to_string()))
    }
}

/// Lifecycle status of an ingestion source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    PendingAuth,
    AuthSuccess,
    Importing,
    Active,
    Paused,
    Syncing,
    Error,
    Imported,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::PendingAuth => "pending_auth",
            SourceStatus::AuthSuccess => "auth_success",
            SourceStatus::Importing => "importing",
            SourceStatus::Active => "active",
            SourceStatus::Paused => "paused",
            SourceStatus::Syncing => "syncing",
            SourceStatus::Error => "error",
            SourceStatus::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending_auth" => SourceStatus::PendingAuth,
            "auth_success" => SourceStatus::AuthSuccess,
            "importing" => SourceStatus::Importing,
            "active" => SourceStatus::Active,
            "paused" => SourceStatus::Paused,
            "syncing" => SourceStatus::Syncing,
            "error" => SourceStatus::Error,
            "imported" => SourceStatus::Imported,
            _ => return None,
        })
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Re-entering the same status is always allowed so status-message
    /// updates stay idempotent. Any non-pending status may be forced back
    /// to `active`, which is how a force sync recovers a stuck source.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (PendingAuth, AuthSuccess) | (Error, AuthSuccess) => true,
            (AuthSuccess, Importing) | (AuthSuccess, Error) => true,
            (Importing, Active) | (Importing, Imported) | (Importing, Error) => true,
            (Importing, Paused) | (Active, Paused) | (Syncing, Paused) => true,
            (Active, Syncing) | (Error, Syncing) => true,
            (Syncing, Active) | (Syncing, Imported) | (Syncing, Error) => true,
            (Active, Error) | (Imported, Error) => true,
            (Active, Importing) | (Error, Importing) => true,
            (PendingAuth, _) => false,
            (_, Active) => true,
            _ => false,
        }
    }

    /// Statuses in which the scheduler may start a continuous sync.
    pub fn is_syncable(&self) -> bool {
        matches!(self, SourceStatus::Active | SourceStatus::Error)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
