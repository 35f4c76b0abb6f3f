//! Service allow-list.
//!
//! The daemon maps request names to local executables through a fixed table
//! seeded from the standard service set, with per-service enable flags the
//! startup arguments may toggle. Resolution re-checks the executable on
//! every request so an unpacked or chmod-ed binary takes effect without a
//! restart.

use std::path::{Path, PathBuf};

use crate::error::TxnError;

/// What a service does with its data channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceKind {
    /// Backup-type service: primary data must not start relaying before the
    /// control channel has delivered the header-complete sentinel.
    Backup,
    /// Size-estimation service.
    Estimate,
    /// Host self-check service.
    Check,
    /// No-op connectivity probe.
    Noop,
}

impl ServiceKind {
    /// Whether the primary data channel is held until the control channel
    /// has carried the header-complete sentinel.
    #[must_use]
    pub const fn holds_data_until_header(self) -> bool {
        matches!(self, Self::Backup)
    }
}

/// One allow-list entry.
#[derive(Clone, Debug)]
pub struct ServiceEntry {
    /// Service name as it appears in `SERVICE` request lines.
    pub name: String,
    /// Resolved executable path.
    pub path: PathBuf,
    /// Administrative enable flag.
    pub enabled: bool,
    /// Channel-ordering classification.
    pub kind: ServiceKind,
}

/// The allow-list of services this daemon will dispatch.
#[derive(Clone, Debug, Default)]
pub struct ServiceTable {
    entries: Vec<ServiceEntry>,
}

impl ServiceTable {
    /// Builds the standard service set rooted at `libexec_dir`.
    #[must_use]
    pub fn standard(libexec_dir: &Path) -> Self {
        let entry = |name: &str, kind: ServiceKind| ServiceEntry {
            name: name.to_owned(),
            path: libexec_dir.join(name),
            enabled: true,
            kind,
        };
        Self {
            entries: vec![
                entry("noop", ServiceKind::Noop),
                entry("sendbackup", ServiceKind::Backup),
                entry("sendsize", ServiceKind::Estimate),
                entry("selfcheck", ServiceKind::Check),
            ],
        }
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, entry: ServiceEntry) {
        self.entries.retain(|existing| existing.name != entry.name);
        self.entries.push(entry);
    }

    /// Toggles a service's enable flag. Returns `false` for unknown names.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Resolves a requested name to a runnable entry.
    pub fn resolve(&self, name: &str) -> Result<&ServiceEntry, TxnError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| TxnError::UnknownService {
                name: name.to_owned(),
            })?;

        if !entry.enabled {
            return Err(TxnError::DisabledService {
                name: name.to_owned(),
            });
        }
        if !is_executable(&entry.path) {
            return Err(TxnError::NotExecutable {
                name: name.to_owned(),
                path: entry.path.clone(),
            });
        }
        Ok(entry)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn table_with_script(name: &str, mode: u32) -> (tempfile::TempDir, ServiceTable) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod");
        let table = ServiceTable::standard(dir.path());
        (dir, table)
    }

    #[test]
    fn resolves_enabled_executable_services() {
        let (_dir, table) = table_with_script("noop", 0o755);
        let entry = table.resolve("noop").expect("resolvable");
        assert_eq!(entry.kind, ServiceKind::Noop);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let (_dir, table) = table_with_script("noop", 0o755);
        assert!(matches!(
            table.resolve("mystery"),
            Err(TxnError::UnknownService { .. })
        ));
    }

    #[test]
    fn disabled_services_are_rejected() {
        let (_dir, mut table) = table_with_script("noop", 0o755);
        assert!(table.set_enabled("noop", false));
        assert!(matches!(
            table.resolve("noop"),
            Err(TxnError::DisabledService { .. })
        ));
    }

    #[test]
    fn non_executable_services_are_rejected() {
        let (_dir, table) = table_with_script("noop", 0o644);
        assert!(matches!(
            table.resolve("noop"),
            Err(TxnError::NotExecutable { .. })
        ));
    }

    #[test]
    fn missing_binaries_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = ServiceTable::standard(dir.path());
        assert!(matches!(
            table.resolve("sendbackup"),
            Err(TxnError::NotExecutable { .. })
        ));
    }

    #[test]
    fn only_backup_services_gate_the_data_channel() {
        assert!(ServiceKind::Backup.holds_data_until_header());
        assert!(!ServiceKind::Estimate.holds_data_until_header());
        assert!(!ServiceKind::Noop.holds_data_until_header());
    }
}
