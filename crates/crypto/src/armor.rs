//! ASCII armor used by the passthrough provider and the in-memory key store.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::Fingerprint,
    error::{DomainError, ErrorCode},
    protocol::KeyRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Message,
    SignedMessage,
    PublicKey,
    PrivateKey,
}

impl Label {
    fn as_str(self) -> &'static str {
        match self {
            Label::Message => "PGP MESSAGE",
            Label::SignedMessage => "PGP SIGNED MESSAGE",
            Label::PublicKey => "PGP PUBLIC KEY BLOCK",
            Label::PrivateKey => "PGP PRIVATE KEY BLOCK",
        }
    }

    const ALL: [Label; 4] = [
        Label::Message,
        Label::SignedMessage,
        Label::PublicKey,
        Label::PrivateKey,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MessageBody {
    pub recipients: Vec<Fingerprint>,
    pub plaintext: String,
    #[serde(default)]
    pub signer: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBody {
    pub fingerprint: Fingerprint,
    pub user_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl KeyBody {
    pub fn into_record(self, private: bool) -> KeyRecord {
        KeyRecord {
            fingerprint: self.fingerprint,
            user_ids: self.user_ids,
            private,
            created_at: self.created_at,
        }
    }
}

impl From<&KeyRecord> for KeyBody {
    fn from(record: &KeyRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            user_ids: record.user_ids.clone(),
            created_at: record.created_at,
        }
    }
}

pub fn encode<T: Serialize>(label: Label, body: &T) -> Result<String, DomainError> {
    let json = serde_json::to_vec(body)
        .map_err(|err| DomainError::internal(format!("failed to encode armor body: {err}")))?;
    let encoded = STANDARD.encode(json);
    let mut armored = format!("-----BEGIN {}-----\n\n", label.as_str());
    for line in encoded.as_bytes().chunks(64) {
        armored.push_str(&String::from_utf8_lossy(line));
        armored.push('\n');
    }
    armored.push_str(&format!("-----END {}-----\n", label.as_str()));
    Ok(armored)
}

/// Splits `text` into every armored block it contains, in order.
pub fn blocks(text: &str) -> Vec<(Label, String)> {
    let mut found = Vec::new();
    let mut rest = text;
    loop {
        let next = Label::ALL
            .iter()
            .filter_map(|label| {
                let begin = format!("-----BEGIN {}-----", label.as_str());
                rest.find(&begin).map(|at| (at, *label, begin.len()))
            })
            .min_by_key(|(at, _, _)| *at);
        let Some((at, label, begin_len)) = next else {
            break;
        };
        let end = format!("-----END {}-----", label.as_str());
        let body_start = at + begin_len;
        let Some(end_at) = rest[body_start..].find(&end) else {
            break;
        };
        found.push((label, rest[body_start..body_start + end_at].to_string()));
        rest = &rest[body_start + end_at + end.len()..];
    }
    found
}

pub fn decode<T: DeserializeOwned>(
    expected: Label,
    armored: &str,
    code: ErrorCode,
) -> Result<T, DomainError> {
    let (_, body) = blocks(armored)
        .into_iter()
        .find(|(label, _)| *label == expected)
        .ok_or_else(|| {
            DomainError::new(code, format!("no {} block found", expected.as_str()))
        })?;
    decode_body(&body, code)
}

pub fn decode_body<T: DeserializeOwned>(body: &str, code: ErrorCode) -> Result<T, DomainError> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| DomainError::new(code, format!("invalid armor encoding: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| DomainError::new(code, format!("invalid armor payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_multiple_blocks_in_order() {
        let body = KeyBody {
            fingerprint: Fingerprint::from("AB12"),
            user_ids: vec!["a@example.org".into()],
            created_at: Utc::now(),
        };
        let public = encode(Label::PublicKey, &body).expect("public");
        let private = encode(Label::PrivateKey, &body).expect("private");
        let text = format!("intro\n{private}\nbetween\n{public}trailer");

        let labels: Vec<Label> = blocks(&text).into_iter().map(|(label, _)| label).collect();
        assert_eq!(labels, vec![Label::PrivateKey, Label::PublicKey]);

        let decoded: KeyBody =
            decode(Label::PublicKey, &text, ErrorCode::ImportFailed).expect("decode");
        assert_eq!(decoded, body);
    }

    #[test]
    fn missing_block_reports_given_code() {
        let err = decode::<KeyBody>(Label::Message, "plain text", ErrorCode::DecryptFailed)
            .expect_err("no block");
        assert_eq!(err.code, ErrorCode::DecryptFailed);
    }
}
