use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for {field}: {value}")]
pub struct ParseEnumError {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(ParseEnumError {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(AuditAction {
    Save => "save",
    Update => "update",
    Delete => "delete",
    Restore => "restore",
    Import => "import",
    Export => "export",
    Migrate => "migrate",
});

str_enum!(ConflictStrategy {
    KeepNewer => "keep_newer",
    Overwrite => "overwrite",
    Skip => "skip",
});

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::KeepNewer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn audit_action_round_trip() {
        for (variant, s) in [
            (AuditAction::Save, "save"),
            (AuditAction::Update, "update"),
            (AuditAction::Delete, "delete"),
            (AuditAction::Restore, "restore"),
            (AuditAction::Import, "import"),
            (AuditAction::Export, "export"),
            (AuditAction::Migrate, "migrate"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(AuditAction::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn serde_uses_the_same_names() {
        let json = serde_json::to_string(&ConflictStrategy::KeepNewer).unwrap();
        assert_eq!(json, "\"keep_newer\"");
        let parsed: AuditAction = serde_json::from_str("\"migrate\"").unwrap();
        assert_eq!(parsed, AuditAction::Migrate);
    }

    #[test]
    fn invalid_enum_returns_error() {
        let err = ConflictStrategy::from_str("newest").unwrap_err();
        assert_eq!(err.field, "ConflictStrategy");
        assert!(AuditAction::from_str("").is_err());
    }
}
