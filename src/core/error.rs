use std::fmt;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Module label attached to every kernel-facing failure.
pub const FIREWALL_MODULE: &str = "firewall.nftables";

/// The kernel object a failed operation was addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Table(String),
    Chain(String),
    Set(String),
    Flowtable(String),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Entity::Table(n) | Entity::Chain(n) | Entity::Set(n) | Entity::Flowtable(n) => n,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Table(n) => write!(f, "table={n}"),
            Entity::Chain(n) => write!(f, "chain={n}"),
            Entity::Set(n) => write!(f, "set={n}"),
            Entity::Flowtable(n) => write!(f, "flowtable={n}"),
        }
    }
}

/// Core error types for the reconciliation engine
#[derive(Debug, Error)]
pub enum Error {
    /// A netlink transaction or query against nf_tables failed
    #[error("{module}: {op} failed ({entity}): {source}", module = FIREWALL_MODULE)]
    Firewall {
        op: &'static str,
        entity: Entity,
        #[source]
        source: io::Error,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Host inventory could not be read
    #[error("System error: {op} ({}): {source}", path.display())]
    System {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A host syscall with no backing path failed
    #[error("System error: {call}: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// Status or configuration could not be encoded as JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error category used by callers to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    #[strum(serialize = "firewall")]
    Firewall,
    #[strum(serialize = "validation")]
    Validation,
    #[strum(serialize = "system")]
    System,
    #[strum(serialize = "serialization")]
    Serialization,
}

impl Error {
    pub fn firewall(op: &'static str, entity: Entity, source: io::Error) -> Self {
        Error::Firewall { op, entity, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Firewall { .. } => ErrorKind::Firewall,
            Error::Validation { .. } | Error::Config(_) => ErrorKind::Validation,
            Error::System { .. } | Error::Syscall { .. } => ErrorKind::System,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Firewall and system failures may succeed on retry. Validation and
    /// encoding failures never do.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Firewall | ErrorKind::System)
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Error::Firewall { entity, .. } => Some(entity),
            _ => None,
        }
    }

    fn errno(&self) -> Option<Errno> {
        match self {
            Error::Firewall { source, .. }
            | Error::System { source, .. }
            | Error::Syscall { source, .. } => source.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Maps an engine error to an operator-facing explanation.
    pub fn from_error(err: &Error) -> Self {
        if let Error::Validation { field, message } = err {
            return ErrorTranslation::new(format!("Invalid configuration ({field}): {message}"))
                .with_suggestion("Fix the configuration; retrying will not help");
        }
        if let Error::Config(message) = err {
            return ErrorTranslation::new(format!("Unreadable configuration: {message}"))
                .with_suggestion("Check the file path and JSON syntax")
                .with_suggestion("`gwd-nft defaults` prints a valid starting point");
        }
        if let Error::Serialization(source) = err {
            return ErrorTranslation::new(format!("Cannot encode output as JSON: {source}"));
        }

        match err.errno() {
            Some(Errno::EPERM | Errno::EACCES) => {
                ErrorTranslation::new("Insufficient permissions to modify nftables")
                    .with_suggestion("Run as root or grant CAP_NET_ADMIN")
            }
            Some(Errno::EOPNOTSUPP | Errno::EAFNOSUPPORT | Errno::EPROTONOSUPPORT) => {
                ErrorTranslation::new("Kernel lacks the required nf_tables support")
                    .with_suggestion("Load nf_tables: sudo modprobe nf_tables")
                    .with_suggestion("Flowtables also need nf_flow_table and nf_flow_table_inet")
            }
            Some(Errno::EBUSY) => ErrorTranslation::new("nftables object is still in use")
                .with_suggestion("Another rule may reference the object; retry after it is released"),
            Some(Errno::ENOENT) if matches!(err.entity(), Some(Entity::Flowtable(_))) => {
                let name = err.entity().map(Entity::name).unwrap_or_default();
                ErrorTranslation::new(format!("A device hooked by flowtable {name} does not exist"))
                    .with_suggestion("Check flowtable_device_explicit/include against `ip link show`")
            }
            Some(Errno::ENODEV) => ErrorTranslation::new("Network device not found")
                .with_suggestion("Check flowtable_device_explicit/include against `ip link show`"),
            _ => match err {
                Error::Syscall { call, .. } => {
                    ErrorTranslation::new(format!("Cannot inspect host interfaces: {err}"))
                        .with_suggestion(format!("{call} failed; check that the network namespace is readable"))
                }
                Error::System { .. } => {
                    ErrorTranslation::new(format!("Cannot inspect host interfaces: {err}"))
                        .with_suggestion("Ensure /sys/class/net is mounted")
                }
                _ => ErrorTranslation::new(format!("Firewall error: {err}"))
                    .with_suggestion("The operation is idempotent; retrying is safe")
                    .with_suggestion("Inspect the kernel state: sudo nft list ruleset"),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn os_err(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    #[test]
    fn test_firewall_error_carries_module_op_and_entity() {
        let err = Error::firewall(
            "add set",
            Entity::Set("gwd_lan_cidrs".into()),
            os_err(Errno::EINVAL as i32),
        );
        let msg = err.to_string();
        assert!(msg.starts_with(FIREWALL_MODULE));
        assert!(msg.contains("add set"));
        assert!(msg.contains("set=gwd_lan_cidrs"));
        assert_eq!(err.kind(), ErrorKind::Firewall);
        assert!(err.is_transient());
    }

    #[test]
    fn test_validation_is_permanent() {
        let err = Error::Validation {
            field: "lan_cidrs".into(),
            message: "bad".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_transient());
        assert_eq!(err.kind().as_ref(), "validation");
    }

    #[test]
    fn test_permission_translation() {
        let err = Error::firewall("add table", Entity::Table("gwd".into()), os_err(Errno::EPERM as i32));
        let t = ErrorTranslation::from_error(&err);
        assert!(t.user_message.contains("permissions"));
        assert!(t.suggestions.iter().any(|s| s.contains("CAP_NET_ADMIN")));
    }

    #[test]
    fn test_missing_module_translation() {
        let err = Error::firewall(
            "add flowtable",
            Entity::Flowtable("gwd_ft".into()),
            os_err(Errno::EOPNOTSUPP as i32),
        );
        let t = ErrorTranslation::from_error(&err);
        assert!(t.suggestions.iter().any(|s| s.contains("modprobe")));
    }

    #[test]
    fn test_system_error_translation() {
        let err = Error::System {
            op: "list network devices",
            path: PathBuf::from("/sys/class/net"),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(err.kind(), ErrorKind::System);
        let t = ErrorTranslation::from_error(&err);
        assert!(t.suggestions.iter().any(|s| s.contains("/sys/class/net")));
    }

    #[test]
    fn test_missing_flowtable_device_names_the_flowtable() {
        let err = Error::firewall(
            "add flowtable",
            Entity::Flowtable("edge_ft".into()),
            os_err(Errno::ENOENT as i32),
        );
        let t = ErrorTranslation::from_error(&err);
        assert!(t.user_message.contains("flowtable edge_ft"));
    }

    #[test]
    fn test_syscall_error_has_no_path() {
        let err = Error::Syscall {
            call: "getifaddrs",
            source: os_err(Errno::ENOMEM as i32),
        };
        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.is_transient());
        let msg = err.to_string();
        assert!(msg.starts_with("System error: getifaddrs:"));
        assert!(!msg.contains("/sys/class/net"));
        let t = ErrorTranslation::from_error(&err);
        assert!(t.suggestions.iter().any(|s| s.contains("getifaddrs")));
        assert!(!t.suggestions.iter().any(|s| s.contains("/sys/class/net")));
    }

    #[test]
    fn test_json_encoding_error_is_its_own_kind() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = Error::from(source);
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(err.kind().as_ref(), "serialization");
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("Serialization error:"));
    }
}
