//! Input validation for configuration values
//!
//! Every value here ends up in a netlink attribute, so names are restricted
//! to what the kernel and `nft` accept. Validators return the normalized value
//! or a human-readable reason; [`crate::config::Config::validate`] attaches
//! the field name.

use crate::core::error::Error;
use crate::core::interval::{ifname_key, lan_elements};

/// `NFT_NAME_MAXLEN` minus the terminator.
pub const MAX_OBJECT_NAME_LEN: usize = 255;

/// Validates an interface name the way `dev_valid_name()` does, and checks
/// that it fits an interface-set key.
///
/// The kernel accepts any bytes except `/`, `:` and whitespace, so names such
/// as `wg+` or `br-lan.10` pass. Whitespace gets its own message because a
/// padded JSON entry is the common mistake.
///
/// # Errors
///
/// Returns the reason the name could never match a kernel device.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name is empty".to_string());
    }
    if name == "." || name == ".." {
        return Err("Interface name cannot be '.' or '..'".to_string());
    }
    if name.chars().any(char::is_whitespace) {
        return Err("Interface name contains whitespace".to_string());
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | ':')) {
        return Err(format!("Interface name contains '{c}'"));
    }
    match ifname_key(name) {
        Ok(_) => Ok(name.to_string()),
        Err(Error::Validation { message, .. }) => Err(message),
        Err(e) => Err(e.to_string()),
    }
}

/// Validates a table, chain, set or flowtable name.
///
/// # Errors
///
/// Returns `Err` for empty names, names longer than 255 bytes, names that do
/// not start with a letter, and names with characters outside
/// `[A-Za-z0-9_.-]`.
///
/// # Examples
///
/// ```
/// use gwd_nft::validators::validate_object_name;
///
/// assert!(validate_object_name("gwd_forward").is_ok());
/// assert!(validate_object_name("").is_err());
/// assert!(validate_object_name("gwd forward").is_err());
/// ```
pub fn validate_object_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Name is required".to_string());
    }

    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err(format!(
            "Name too long (max {MAX_OBJECT_NAME_LEN} characters)"
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(format!("Name must start with a letter: {name}"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("Name contains invalid characters: {name}"));
    }

    Ok(name.to_string())
}

/// Validates a LAN CIDR: parseable, IPv4, and not covering the whole space.
///
/// # Errors
///
/// Returns the same reasons the LAN set builder would fail with.
pub fn validate_cidr(input: &str) -> Result<String, String> {
    let cidr = input.trim();
    match lan_elements(&[cidr]) {
        Ok(_) => Ok(cidr.to_string()),
        Err(Error::Validation { message, .. }) => Err(message),
        Err(e) => Err(e.to_string()),
    }
}
