//! Provider-specific incremental sync cursors.
//!
//! Each provider family keeps a structurally different cursor, so the state
//! is a tagged enum serialized into the source row. Connectors only ever
//! report the entries they touched; [`SyncState::merge`] folds those into the
//! stored state so concurrent per-user jobs do not overwrite each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Gmail keeps a single history id per user mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCursor {
    pub history_id: String,
}

/// Graph delta links, one per mail folder id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaCursor {
    pub delta_tokens: BTreeMap<String, String>,
}

/// Highest UID seen in an IMAP mailbox, valid for one UIDVALIDITY epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UidCursor {
    pub uid_validity: u32,
    pub max_uid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// No cursor: the next pass is a full scan. File imports stay here.
    #[default]
    Empty,
    /// Keyed by user email.
    Google(BTreeMap<String, HistoryCursor>),
    /// Keyed by user email.
    Microsoft(BTreeMap<String, DeltaCursor>),
    /// Keyed by the account email.
    OutlookPersonal(BTreeMap<String, DeltaCursor>),
    /// Keyed by mailbox (folder) name.
    Imap(BTreeMap<String, UidCursor>),
}

impl SyncState {
    pub fn is_empty(&self) -> bool {
        match self {
            SyncState::Empty => true,
            SyncState::Google(m) => m.is_empty(),
            SyncState::Microsoft(m) | SyncState::OutlookPersonal(m) => m.is_empty(),
            SyncState::Imap(m) => m.is_empty(),
        }
    }

    /// Folds `update` into `self`. Entries in `update` win per key; Graph
    /// delta maps are merged per folder. A state of a different provider
    /// family replaces `self` outright.
    pub fn merge(&mut self, update: SyncState) {
        match (self, update) {
            (_, SyncState::Empty) => {}
            (SyncState::Google(current), SyncState::Google(update)) => current.extend(update),
            (SyncState::Microsoft(current), SyncState::Microsoft(update))
            | (SyncState::OutlookPersonal(current), SyncState::OutlookPersonal(update)) => {
                for (user, cursor) in update {
                    current
                        .entry(user)
                        .or_default()
                        .delta_tokens
                        .extend(cursor.delta_tokens);
                }
            }
            (SyncState::Imap(current), SyncState::Imap(update)) => current.extend(update),
            (current, update) => *current = update,
        }
    }

    pub fn google_history(&self, user_email: &str) -> Option<&str> {
        match self {
            SyncState::Google(users) => users.get(user_email).map(|c| c.history_id.as_str()),
            _ => None,
        }
    }

    pub fn delta_tokens(&self, user_email: &str) -> Option<&BTreeMap<String, String>> {
        match self {
            SyncState::Microsoft(users) | SyncState::OutlookPersonal(users) => {
                users.get(user_email).map(|c| &c.delta_tokens)
            }
            _ => None,
        }
    }

    pub fn imap_cursors(&self) -> Option<&BTreeMap<String, UidCursor>> {
        match self {
            SyncState::Imap(folders) => Some(folders),
            _ => None,
        }
    }

    /// Encodes for the `sync_state` column; an empty state is stored as NULL.
    pub fn to_column(&self) -> Result<Option<String>, serde_json::Error> {
        if self.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(self).map(Some)
    }

    pub fn from_column(value: Option<&str>) -> Result<Self, serde_json::Error> {
        match value {
            None | Some("") => Ok(SyncState::Empty),
            Some(json) => serde_json::from_str(json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imap(entries: &[(&str, u32, u32)]) -> SyncState {
        SyncState::Imap(
            entries
                .iter()
                .map(|(name, validity, max)| {
                    (
                        name.to_string(),
                        UidCursor {
                            uid_validity: *validity,
                            max_uid: *max,
                        },
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_merge_imap_keeps_untouched_folders() {
        let mut state = imap(&[("INBOX", 1, 10), ("Sent", 1, 4)]);
        state.merge(imap(&[("INBOX", 1, 12)]));
        assert_eq!(state, imap(&[("INBOX", 1, 12), ("Sent", 1, 4)]));
    }

    #[test]
    fn test_merge_delta_tokens_per_folder() {
        let mut state = SyncState::Microsoft(BTreeMap::from([(
            "a@example.com".to_string(),
            DeltaCursor {
                delta_tokens: BTreeMap::from([
                    ("inbox".to_string(), "t1".to_string()),
                    ("archive".to_string(), "t2".to_string()),
                ]),
            },
        )]));
        state.merge(SyncState::Microsoft(BTreeMap::from([
            (
                "a@example.com".to_string(),
                DeltaCursor {
                    delta_tokens: BTreeMap::from([("inbox".to_string(), "t3".to_string())]),
                },
            ),
            ("b@example.com".to_string(), DeltaCursor::default()),
        ])));

        let tokens = state.delta_tokens("a@example.com").unwrap();
        assert_eq!(tokens.get("inbox").map(String::as_str), Some("t3"));
        assert_eq!(tokens.get("archive").map(String::as_str), Some("t2"));
        assert!(state.delta_tokens("b@example.com").is_some());
    }

    #[test]
    fn test_merge_empty_is_noop() {
        let mut state = imap(&[("INBOX", 7, 3)]);
        state.merge(SyncState::Empty);
        assert_eq!(state, imap(&[("INBOX", 7, 3)]));
    }

    #[test]
    fn test_merge_other_family_replaces() {
        let mut state = imap(&[("INBOX", 7, 3)]);
        state.merge(SyncState::Google(BTreeMap::from([(
            "u@example.com".to_string(),
            HistoryCursor {
                history_id: "99".to_string(),
            },
        )])));
        assert_eq!(state.google_history("u@example.com"), Some("99"));
        assert!(state.imap_cursors().is_none());
    }

    #[test]
    fn test_column_round_trip_shape() {
        let state = imap(&[("INBOX", 5, 42)]);
        let column = state.to_column().unwrap().unwrap();
        assert_eq!(column, r#"{"imap":{"INBOX":{"uidValidity":5,"maxUid":42}}}"#);
        assert_eq!(SyncState::from_column(Some(&column)).unwrap(), state);
        assert_eq!(SyncState::Empty.to_column().unwrap(), None);
        assert_eq!(SyncState::from_column(None).unwrap(), SyncState::Empty);
    }
}
