use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::validators::{validate_cidr, validate_interface, validate_object_name};

pub const DEFAULT_TABLE_NAME: &str = "gwd";
pub const DEFAULT_FLOWTABLE_NAME: &str = "gwd_ft";
pub const DEFAULT_LAN_SET_NAME: &str = "gwd_lan_cidrs";
pub const DEFAULT_INPUT_CHAIN_NAME: &str = "gwd_input";
pub const DEFAULT_FORWARD_CHAIN_NAME: &str = "gwd_forward";
pub const DEFAULT_OUTPUT_CHAIN_NAME: &str = "gwd_output";
pub const DEFAULT_INPUT_BYPASS_SET_NAME: &str = "gwd_input_bypass_ifaces";
pub const DEFAULT_FORWARD_BYPASS_SET_NAME: &str = "gwd_forward_bypass_ifaces";
pub const DEFAULT_FILTER_PRIORITY: i32 = 0;
pub const DEFAULT_FLOWTABLE_PRIORITY: i32 = -300;

/// RFC 1918 private ranges plus RFC 6598 carrier-grade NAT.
pub const DEFAULT_LAN_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
];

/// Netfilter hook a flowtable attaches to. Flowtables only support ingress.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FlowtableHook {
    #[default]
    Ingress,
}

impl FlowtableHook {
    pub fn hooknum(self) -> u32 {
        match self {
            FlowtableHook::Ingress => 0,
        }
    }
}

/// Declared state of the managed table.
///
/// Every field has a default, so a partial JSON document is a valid config.
/// Empty names and unset priorities are filled by [`Config::with_defaults`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub table_name: String,
    pub flowtable_name: String,
    pub lan_set_name: String,
    pub input_chain_name: String,
    pub forward_chain_name: String,
    pub output_chain_name: String,
    pub input_bypass_set_name: String,
    pub forward_bypass_set_name: String,

    pub filter_priority: Option<i32>,
    pub flowtable_hook: Option<FlowtableHook>,
    pub flowtable_priority: Option<i32>,

    /// LAN set contents; empty means detect from interface addresses.
    pub lan_cidrs: Vec<String>,

    /// When non-empty, the flowtable hooks exactly these devices.
    pub flowtable_device_explicit: Vec<String>,
    pub flowtable_device_include: Vec<String>,
    pub flowtable_device_exclude: Vec<String>,
    pub flowtable_device_exclude_prefixes: Vec<String>,

    pub input_bypass_ifaces: Vec<String>,
    pub forward_bypass_ifaces: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            flowtable_name: DEFAULT_FLOWTABLE_NAME.to_string(),
            lan_set_name: DEFAULT_LAN_SET_NAME.to_string(),
            input_chain_name: DEFAULT_INPUT_CHAIN_NAME.to_string(),
            forward_chain_name: DEFAULT_FORWARD_CHAIN_NAME.to_string(),
            output_chain_name: DEFAULT_OUTPUT_CHAIN_NAME.to_string(),
            input_bypass_set_name: DEFAULT_INPUT_BYPASS_SET_NAME.to_string(),
            forward_bypass_set_name: DEFAULT_FORWARD_BYPASS_SET_NAME.to_string(),
            filter_priority: Some(DEFAULT_FILTER_PRIORITY),
            flowtable_hook: Some(FlowtableHook::Ingress),
            flowtable_priority: Some(DEFAULT_FLOWTABLE_PRIORITY),
            lan_cidrs: Vec::new(),
            flowtable_device_explicit: Vec::new(),
            flowtable_device_include: Vec::new(),
            flowtable_device_exclude: Vec::new(),
            flowtable_device_exclude_prefixes: Vec::new(),
            input_bypass_ifaces: Vec::new(),
            forward_bypass_ifaces: Vec::new(),
        }
    }
}

fn fill(name: &mut String, default: &str) {
    if name.trim().is_empty() {
        *name = default.to_string();
    }
}

fn normalize(list: &mut Vec<String>) {
    *list = list
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
}

impl Config {
    /// Fills every empty name and unset priority with its default, and trims
    /// the interface lists and LAN CIDRs, dropping blank entries.
    pub fn with_defaults(mut self) -> Self {
        fill(&mut self.table_name, DEFAULT_TABLE_NAME);
        fill(&mut self.flowtable_name, DEFAULT_FLOWTABLE_NAME);
        fill(&mut self.lan_set_name, DEFAULT_LAN_SET_NAME);
        fill(&mut self.input_chain_name, DEFAULT_INPUT_CHAIN_NAME);
        fill(&mut self.forward_chain_name, DEFAULT_FORWARD_CHAIN_NAME);
        fill(&mut self.output_chain_name, DEFAULT_OUTPUT_CHAIN_NAME);
        fill(&mut self.input_bypass_set_name, DEFAULT_INPUT_BYPASS_SET_NAME);
        fill(
            &mut self.forward_bypass_set_name,
            DEFAULT_FORWARD_BYPASS_SET_NAME,
        );
        self.filter_priority.get_or_insert(DEFAULT_FILTER_PRIORITY);
        self.flowtable_hook.get_or_insert(FlowtableHook::Ingress);
        self.flowtable_priority
            .get_or_insert(DEFAULT_FLOWTABLE_PRIORITY);
        normalize(&mut self.lan_cidrs);
        for list in [
            &mut self.flowtable_device_explicit,
            &mut self.flowtable_device_include,
            &mut self.flowtable_device_exclude,
            &mut self.flowtable_device_exclude_prefixes,
            &mut self.input_bypass_ifaces,
            &mut self.forward_bypass_ifaces,
        ] {
            normalize(list);
        }
        self
    }

    pub fn filter_priority(&self) -> i32 {
        self.filter_priority.unwrap_or(DEFAULT_FILTER_PRIORITY)
    }

    pub fn flowtable_hook(&self) -> FlowtableHook {
        self.flowtable_hook.unwrap_or_default()
    }

    pub fn flowtable_priority(&self) -> i32 {
        self.flowtable_priority
            .unwrap_or(DEFAULT_FLOWTABLE_PRIORITY)
    }

    fn object_names(&self) -> [(&'static str, &str); 8] {
        [
            ("table_name", self.table_name.as_str()),
            ("flowtable_name", self.flowtable_name.as_str()),
            ("lan_set_name", self.lan_set_name.as_str()),
            ("input_chain_name", self.input_chain_name.as_str()),
            ("forward_chain_name", self.forward_chain_name.as_str()),
            ("output_chain_name", self.output_chain_name.as_str()),
            ("input_bypass_set_name", self.input_bypass_set_name.as_str()),
            ("forward_bypass_set_name", self.forward_bypass_set_name.as_str()),
        ]
    }

    fn interface_lists(&self) -> [(&'static str, &[String]); 6] {
        [
            ("flowtable_device_explicit", self.flowtable_device_explicit.as_slice()),
            ("flowtable_device_include", self.flowtable_device_include.as_slice()),
            ("flowtable_device_exclude", self.flowtable_device_exclude.as_slice()),
            (
                "flowtable_device_exclude_prefixes",
                self.flowtable_device_exclude_prefixes.as_slice(),
            ),
            ("input_bypass_ifaces", self.input_bypass_ifaces.as_slice()),
            ("forward_bypass_ifaces", self.forward_bypass_ifaces.as_slice()),
        ]
    }

    /// Checks names, interface lists and LAN CIDRs.
    ///
    /// Call on a defaulted config; empty names and padded interface entries
    /// are rejected here.
    pub fn validate(&self) -> Result<()> {
        for (field, name) in self.object_names() {
            validate_object_name(name).map_err(|message| Error::Validation {
                field: field.to_string(),
                message,
            })?;
        }

        for (field, list) in self.interface_lists() {
            for name in list {
                validate_interface(name).map_err(|message| Error::Validation {
                    field: field.to_string(),
                    message: format!("{message}: {name}"),
                })?;
            }
        }

        for cidr in self.lan_cidrs.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            validate_cidr(cidr).map_err(|message| Error::Validation {
                field: "lan_cidrs".to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

/// Loads a JSON configuration file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fully_populated() {
        let cfg = Config::default();
        assert_eq!(cfg.table_name, "gwd");
        assert_eq!(cfg.flowtable_name, "gwd_ft");
        assert_eq!(cfg.filter_priority(), 0);
        assert_eq!(cfg.flowtable_priority(), -300);
        assert_eq!(cfg.flowtable_hook(), FlowtableHook::Ingress);
        assert!(cfg.lan_cidrs.is_empty());
        assert_eq!(cfg.clone().with_defaults(), cfg);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_with_defaults_fills_blanks_only() {
        let cfg = Config {
            table_name: String::new(),
            lan_set_name: "  ".to_string(),
            forward_chain_name: "fwd".to_string(),
            filter_priority: None,
            flowtable_priority: Some(-100),
            ..Config::default()
        }
        .with_defaults();
        assert_eq!(cfg.table_name, "gwd");
        assert_eq!(cfg.lan_set_name, "gwd_lan_cidrs");
        assert_eq!(cfg.forward_chain_name, "fwd");
        assert_eq!(cfg.filter_priority, Some(0));
        assert_eq!(cfg.flowtable_priority, Some(-100));
    }

    #[test]
    fn test_with_defaults_trims_interface_lists() {
        let cfg = Config {
            lan_cidrs: vec![" 10.0.0.0/8".into(), String::new()],
            flowtable_device_include: vec![" veth7".into(), "  ".into()],
            flowtable_device_exclude: vec!["wg0 ".into()],
            forward_bypass_ifaces: vec!["\twan0".into(), "lan0".into()],
            ..Config::default()
        }
        .with_defaults();
        assert_eq!(cfg.lan_cidrs, ["10.0.0.0/8"]);
        assert_eq!(cfg.flowtable_device_include, ["veth7"]);
        assert_eq!(cfg.flowtable_device_exclude, ["wg0"]);
        assert_eq!(cfg.forward_bypass_ifaces, ["wan0", "lan0"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_padded_interface_entries() {
        let padded = Config {
            flowtable_device_exclude: vec!["wg0 ".into()],
            ..Config::default()
        };
        let err = padded.validate().unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Validation);
        assert!(err.to_string().contains("flowtable_device_exclude"));
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"table_name":"edge","lan_cidrs":["10.0.0.0/8"]}"#).unwrap();
        assert_eq!(cfg.table_name, "edge");
        assert_eq!(cfg.flowtable_name, "gwd_ft");
        assert_eq!(cfg.lan_cidrs, ["10.0.0.0/8"]);
        assert_eq!(cfg.flowtable_hook, Some(FlowtableHook::Ingress));
    }

    #[test]
    fn test_hook_serialises_lowercase() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains(r#""flowtable_hook":"ingress""#));
        assert_eq!(FlowtableHook::Ingress.to_string(), "ingress");
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let long_iface = Config {
            input_bypass_ifaces: vec!["sixteen-chars-00".to_string()],
            ..Config::default()
        };
        let err = long_iface.validate().unwrap_err();
        assert!(err.to_string().contains("input_bypass_ifaces"));

        let bad_cidr = Config {
            lan_cidrs: vec!["10.0.0.0/8".to_string(), "10.0.0.0/40".to_string()],
            ..Config::default()
        };
        assert!(bad_cidr.validate().is_err());

        let v6 = Config {
            lan_cidrs: vec!["fd00::/8".to_string()],
            ..Config::default()
        };
        assert!(v6.validate().unwrap_err().to_string().contains("unsupported address family"));

        let empty_name = Config {
            table_name: String::new(),
            ..Config::default()
        };
        assert!(empty_name.validate().is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gwd.json");
        std::fs::write(&path, r#"{"flowtable_device_exclude_prefixes":["veth"]}"#).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.flowtable_device_exclude_prefixes, ["veth"]);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config(&path), Err(Error::Config(_))));
        assert!(matches!(
            load_config(&dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }
}
