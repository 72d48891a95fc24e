use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const INSTANCE_ID_LEN: usize = 12;

macro_rules! token_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

token_newtype!(InstanceId);
token_newtype!(CorrelationId);
token_newtype!(Fingerprint);

impl InstanceId {
    /// Short random token used for dynamically created endpoints.
    pub fn random() -> Self {
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(INSTANCE_ID_LEN);
        Self(token)
    }
}

impl CorrelationId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("malformed endpoint name '{0}': expected '<kind>-<instanceId>'")]
    Malformed(String),
    #[error("unknown controller kind '{0}'")]
    UnknownKind(String),
}

macro_rules! controller_kinds {
    ($($variant:ident => $tag:literal),+ $(,)?) => {
        /// Logical type of a controller; the part of an endpoint name before the separator.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ControllerKind {
            $(#[serde(rename = $tag)] $variant,)+
        }

        impl ControllerKind {
            pub const ALL: &'static [ControllerKind] = &[$(ControllerKind::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ControllerKind::$variant => $tag,)+
                }
            }
        }

        impl FromStr for ControllerKind {
            type Err = NameError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($tag => Ok(ControllerKind::$variant),)+
                    other => Err(NameError::UnknownKind(other.to_string())),
                }
            }
        }
    };
}

controller_kinds! {
    DecryptFrame => "dFrame",
    EncryptFrame => "eFrame",
    VerifyFrame => "vFrame",
    ImportFrame => "imFrame",
    PasswordDialog => "pwdDialog",
    SyncHandler => "syncHandler",
    Menu => "menu",
    App => "app",
    MainContentScript => "mainCS",
    KeyGenDialog => "keyGenDialog",
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel name split into its routing parts.
///
/// The kind stays a raw string here so that a well-formed name with an
/// unregistered kind can be reported as such rather than as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointName {
    kind: String,
    instance: InstanceId,
}

impl EndpointName {
    pub fn new(kind: ControllerKind, instance: InstanceId) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            instance,
        }
    }

    /// Fresh name for a surface opened by this side.
    pub fn random(kind: ControllerKind) -> Self {
        Self::new(kind, InstanceId::random())
    }

    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let mut parts = raw.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(instance), None) if !kind.is_empty() && !instance.is_empty() => {
                Ok(Self {
                    kind: kind.to_string(),
                    instance: InstanceId(instance.to_string()),
                })
            }
            _ => Err(NameError::Malformed(raw.to_string())),
        }
    }

    pub fn kind_tag(&self) -> &str {
        &self.kind
    }

    pub fn kind(&self) -> Result<ControllerKind, NameError> {
        self.kind.parse()
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.instance)
    }
}

impl FromStr for EndpointName {
    type Err = NameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_and_instance() {
        let name = EndpointName::parse("dFrame-abc123").expect("name");
        assert_eq!(name.kind(), Ok(ControllerKind::DecryptFrame));
        assert_eq!(name.instance().as_str(), "abc123");
        assert_eq!(name.to_string(), "dFrame-abc123");
    }

    #[test]
    fn rejects_names_without_exactly_one_separator() {
        for raw in ["dFrame", "dFrame-a-b", "-abc", "dFrame-", ""] {
            assert!(
                matches!(EndpointName::parse(raw), Err(NameError::Malformed(_))),
                "{raw} should be malformed"
            );
        }
    }

    #[test]
    fn unknown_kind_is_distinct_from_malformed() {
        let name = EndpointName::parse("zFrame-1").expect("well formed");
        assert_eq!(
            name.kind(),
            Err(NameError::UnknownKind("zFrame".to_string()))
        );
    }

    #[test]
    fn random_instances_do_not_collide() {
        let a = EndpointName::random(ControllerKind::EncryptFrame);
        let b = EndpointName::random(ControllerKind::EncryptFrame);
        assert_ne!(a, b);
        assert_eq!(a.instance().as_str().len(), INSTANCE_ID_LEN);
        assert!(EndpointName::parse(&a.to_string()).is_ok());
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in ControllerKind::ALL {
            assert_eq!(kind.as_str().parse::<ControllerKind>(), Ok(*kind));
        }
    }
}
