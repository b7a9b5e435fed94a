//! URL composition for the network namespace
//!
//! Every node is indexed by a canonical URL. The namespace root is `smb://`,
//! workgroups and servers sit directly below it (`smb://WORKGROUP`,
//! `smb://SERVER`), and shares and their contents are slash separated below
//! their server (`smb://SERVER/share/dir/file`).

use crate::error::FsError;
use crate::types::NodeKind;
use crate::{MAX_FILENAME_LEN, MAX_URL_LEN};

/// URL of the namespace root
pub const NETWORK_URL: &str = "smb://";

/// URL of the entry `name` inside the directory `dir_url` of kind `dir_kind`
pub fn entry_url(dir_url: &str, dir_kind: NodeKind, name: &str) -> String {
    match dir_kind {
        NodeKind::Network => format!("{}{}", dir_url, name),
        // Servers are addressed directly, not through their workgroup
        NodeKind::Workgroup => format!("{}{}", NETWORK_URL, name),
        _ => format!("{}/{}", dir_url, name),
    }
}

/// Like `entry_url`, but rejects names that cannot form a single component
pub fn checked_entry_url(dir_url: &str, dir_kind: NodeKind, name: &str) -> Result<String, FsError> {
    validate_name(name)?;
    let url = entry_url(dir_url, dir_kind, name);
    if url.len() > MAX_URL_LEN {
        return Err(FsError::NameTooLong);
    }
    Ok(url)
}

/// Validate an entry name (single component)
pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidArgument);
    }

    if name.contains('\0') || name.contains('/') {
        return Err(FsError::InvalidArgument);
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(FsError::NameTooLong);
    }

    Ok(())
}

/// Last component of a URL
pub fn name_of(url: &str) -> &str {
    let rest = url.strip_prefix(NETWORK_URL).unwrap_or(url);
    rest.rsplit('/').next().unwrap_or(rest)
}
