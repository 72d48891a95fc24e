use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::{CorrelationId, Fingerprint},
    error::{DomainError, ReplyError},
};

macro_rules! events {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Semantic message kind carried in an envelope's `event` field.
        ///
        /// Names outside the known set are kept verbatim in `Other` so they can
        /// be logged as unhandled instead of failing deserialization.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum Event {
            $($variant,)+
            Other(String),
        }

        impl Event {
            /// Every event known at build time, excluding `Other`.
            pub const ALL: &'static [Event] = &[$(Event::$variant,)+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(Event::$variant => $tag,)+
                    Event::Other(name) => name,
                }
            }
        }

        impl From<&str> for Event {
            fn from(value: &str) -> Self {
                match value {
                    $($tag => Event::$variant,)+
                    other => Event::Other(other.to_string()),
                }
            }
        }
    };
}

events! {
    SetArmored => "set-armored",
    DecryptMessage => "decrypt-message",
    DecryptedMessage => "decrypted-message",
    EframeRecipients => "eframe-recipients",
    EncryptMessage => "encrypt-message",
    SignOnly => "sign-only",
    GetRecipients => "get-recipients",
    SetArmoredText => "set-armored-text",
    VerifyInlineSig => "verify-inline-sig",
    VerifiedMessage => "verified-message",
    ImframeArmoredKey => "imframe-armored-key",
    ImportDone => "import-done",
    ImportError => "import-error",
    PwdDialogInit => "pwd-dialog-init",
    PwdDialogOk => "pwd-dialog-ok",
    PwdDialogCancel => "pwd-dialog-cancel",
    CloseDialog => "close-dialog",
    SyncEvent => "sync-event",
    SyncDone => "sync-done",
    BrowserAction => "browser-action",
    GetVersion => "get-version",
    GetAllKeyData => "get-all-key-data",
    GetPrefs => "get-prefs",
    SetPrefs => "set-prefs",
    Ready => "ready",
    GetWatchList => "get-watch-list",
    GenerateKey => "generate-key",
    ErrorMessage => "error-message",
}

impl Event {
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl From<String> for Event {
    fn from(value: String) -> Self {
        Event::from(value.as_str())
    }
}

impl From<Event> for String {
    fn from(value: Event) -> Self {
        match value {
            Event::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: Event,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    /// `Some(Value::Null)` is a reply whose result is `null`; `None` means no result field.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn notification(event: Event, data: Value, sender: impl Into<String>) -> Self {
        Self {
            event,
            data,
            sender: sender.into(),
            to: None,
            id: None,
            result: None,
            error: None,
        }
    }

    pub fn request(
        event: Event,
        data: Value,
        sender: impl Into<String>,
        id: CorrelationId,
    ) -> Self {
        Self {
            id: Some(id),
            ..Self::notification(event, data, sender)
        }
    }

    pub fn reply(
        event: Event,
        id: CorrelationId,
        outcome: Result<Value, ReplyError>,
        sender: impl Into<String>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        Self {
            event,
            data: Value::Null,
            sender: sender.into(),
            to: None,
            id: Some(id),
            result,
            error,
        }
    }

    pub fn addressed_to(mut self, group: impl Into<String>) -> Self {
        self.to = Some(group.into());
        self
    }

    /// A reply carries a correlation id together with a `result` or an `error`.
    pub fn is_reply(&self) -> bool {
        self.id.is_some() && (self.result.is_some() || self.error.is_some())
    }

    /// A request carries a correlation id and expects a reply.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && !self.is_reply()
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmoredPayload {
    pub armored: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientsPayload {
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptPayload {
    pub plaintext: String,
    #[serde(default)]
    pub sign: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub fingerprint: Fingerprint,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedPayload {
    pub plaintext: String,
    #[serde(default)]
    pub signatures: Vec<SignaturePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPayload {
    pub plaintext: String,
    pub signers: Vec<SignaturePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub fingerprint: Fingerprint,
    pub user_ids: Vec<String>,
    pub private: bool,
    pub created_at: DateTime<Utc>,
}

impl KeyRecord {
    /// Email addresses from user ids of the form `Name <address>` or a bare address.
    pub fn addresses(&self) -> impl Iterator<Item = String> + '_ {
        self.user_ids.iter().filter_map(|user_id| {
            let candidate = match (user_id.rfind('<'), user_id.rfind('>')) {
                (Some(start), Some(end)) if start < end => &user_id[start + 1..end],
                _ => user_id.as_str(),
            };
            candidate
                .contains('@')
                .then(|| candidate.trim().to_ascii_lowercase())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedPayload {
    pub keys: Vec<KeyRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPrompt {
    pub fingerprint: Fingerprint,
    pub user_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordAnswer {
    pub password: String,
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserActionPayload {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenPayload {
    pub user_ids: Vec<String>,
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preferences(pub BTreeMap<String, Value>);
