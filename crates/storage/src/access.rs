//! Write access policy
//!
//! Access controllers expose their write list in different places. The
//! policy is taken from the first place that has one.

use serde::{Serialize, Serializer};

/// Access control data of a database
pub trait AccessController: Send + Sync {
    /// Write list held directly by the controller
    fn write(&self) -> Option<Vec<String>> {
        None
    }

    /// Keys granted `capability`, for controllers that store grants
    fn get(&self, _capability: &str) -> Option<Vec<String>> {
        None
    }

    /// Write list from the options the controller was created with
    fn options_write(&self) -> Option<Vec<String>> {
        None
    }

    /// Controller type name
    fn controller_type(&self) -> Option<String> {
        None
    }
}

/// Who may write to a database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePolicy {
    /// Identities (or `*`) allowed to write
    Keys(Vec<String>),
    /// No write list could be found
    Unavailable,
}

impl WritePolicy {
    /// Resolve the policy of `access`
    pub fn resolve(access: &dyn AccessController) -> Self {
        access
            .write()
            .or_else(|| access.get("write"))
            .or_else(|| access.options_write())
            .map(WritePolicy::Keys)
            .unwrap_or(WritePolicy::Unavailable)
    }

    /// Whether `identity` appears in the write list
    pub fn allows(&self, identity: &str) -> bool {
        match self {
            WritePolicy::Keys(keys) => keys.iter().any(|key| key == identity),
            WritePolicy::Unavailable => false,
        }
    }
}

impl Serialize for WritePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WritePolicy::Keys(keys) => keys.serialize(serializer),
            WritePolicy::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Access {
        write: Option<Vec<String>>,
        granted: Option<Vec<String>>,
        options: Option<Vec<String>>,
    }

    impl AccessController for Access {
        fn write(&self) -> Option<Vec<String>> {
            self.write.clone()
        }

        fn get(&self, capability: &str) -> Option<Vec<String>> {
            if capability == "write" {
                self.granted.clone()
            } else {
                None
            }
        }

        fn options_write(&self) -> Option<Vec<String>> {
            self.options.clone()
        }
    }

    fn keys(keys: &[&str]) -> Option<Vec<String>> {
        Some(keys.iter().map(|k| k.to_string()).collect())
    }

    #[test]
    fn test_fallback_chain() {
        let all = Access {
            write: keys(&["direct"]),
            granted: keys(&["granted"]),
            options: keys(&["options"]),
        };
        assert_eq!(WritePolicy::resolve(&all), WritePolicy::Keys(vec!["direct".into()]));

        let granted = Access {
            granted: keys(&["granted"]),
            options: keys(&["options"]),
            ..Default::default()
        };
        assert_eq!(WritePolicy::resolve(&granted), WritePolicy::Keys(vec!["granted".into()]));

        let options = Access {
            options: keys(&["options"]),
            ..Default::default()
        };
        assert_eq!(WritePolicy::resolve(&options), WritePolicy::Keys(vec!["options".into()]));

        assert_eq!(WritePolicy::resolve(&Access::default()), WritePolicy::Unavailable);
    }

    #[test]
    fn test_allows() {
        let policy = WritePolicy::Keys(vec!["me".into(), "you".into()]);
        assert!(policy.allows("me"));
        assert!(!policy.allows("them"));
        assert!(!WritePolicy::Unavailable.allows("me"));
    }

    #[test]
    fn test_serialized_forms() {
        let policy = WritePolicy::Keys(vec!["me".into()]);
        assert_eq!(serde_json::to_string(&policy).unwrap(), r#"["me"]"#);
        assert_eq!(serde_json::to_string(&WritePolicy::Unavailable).unwrap(), r#""unavailable""#);
    }
}
