//! Removable volume discovery backed by the kernel mount table.

use crate::config::WatchCfg;
use crate::error::{KeywardError, KeywardResult};
use log::debug;
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const MOUNTS_OVERRIDE_ENV: &str = "KEYWARD_MOUNTS_PATH";
const PROC_MOUNTS: &str = "/proc/mounts";

/// Root directory of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountPoint(PathBuf);

impl MountPoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for MountPoint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<PathBuf> for MountPoint {
    fn from(value: PathBuf) -> Self {
        Self(value)
    }
}

/// Anything that can list the removable volumes currently mounted.
pub trait VolumeSource: Send + Sync {
    /// Enumerate removable mount points, in no particular order.
    fn removable_mounts(&self) -> KeywardResult<Vec<MountPoint>>;

    /// Whether `mount` is mounted and ready right now. An enumeration failure is
    /// returned as-is; it says nothing about this particular mount.
    fn is_mounted(&self, mount: &MountPoint) -> KeywardResult<bool> {
        Ok(self.removable_mounts()?.contains(mount))
    }
}

/// One parsed line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Mount table reader that treats block devices mounted below the configured
/// roots (`/media`, `/run/media`, ...) as removable.
#[derive(Debug, Clone)]
pub struct MountTable {
    roots: Vec<PathBuf>,
    table_path: Option<PathBuf>,
}

impl MountTable {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            table_path: None,
        }
    }

    pub fn from_config(watch: &WatchCfg) -> Self {
        Self::new(
            watch
                .mount_roots
                .iter()
                .map(|root| root.trim())
                .filter(|root| !root.is_empty()),
        )
    }

    /// Read the table from `path` instead of `/proc/mounts`.
    pub fn with_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.table_path = Some(path.into());
        self
    }

    /// Every entry of the mount table.
    pub fn entries(&self) -> KeywardResult<Vec<MountEntry>> {
        let contents = match &self.table_path {
            Some(path) => fs::read(path)?,
            None => read_mount_table()?,
        };
        Ok(parse_mount_bytes(&contents))
    }

    fn is_removable(&self, entry: &MountEntry) -> bool {
        entry.device.starts_with("/dev/")
            && self
                .roots
                .iter()
                .any(|root| entry.mountpoint.starts_with(root) && entry.mountpoint != *root)
    }
}

impl VolumeSource for MountTable {
    fn removable_mounts(&self) -> KeywardResult<Vec<MountPoint>> {
        let unique: BTreeSet<PathBuf> = self
            .entries()?
            .into_iter()
            .filter(|entry| self.is_removable(entry))
            .map(|entry| entry.mountpoint)
            .collect();
        Ok(unique.into_iter().map(MountPoint::from).collect())
    }
}

/// Locate where `devnode` is mounted, if anywhere.
pub fn find_mount_point(devnode: &Path) -> KeywardResult<Option<PathBuf>> {
    let mounts = read_mount_table()?;
    let devnode_str = devnode.to_string_lossy();
    Ok(parse_mount_bytes(&mounts)
        .into_iter()
        .find(|entry| entry.device == devnode_str.as_ref())
        .map(|entry| entry.mountpoint))
}

fn read_mount_table() -> KeywardResult<Vec<u8>> {
    if let Ok(path) = env::var(MOUNTS_OVERRIDE_ENV) {
        return fs::read(&path).map_err(|err| {
            KeywardError::Io(std::io::Error::new(
                err.kind(),
                format!("read mounts file {path}: {err}"),
            ))
        });
    }
    Ok(fs::read(PROC_MOUNTS)?)
}

/// Parse the whitespace-separated `/proc/mounts` format, skipping short lines.
pub fn parse_mount_table(mounts: &str) -> Vec<MountEntry> {
    parse_mount_bytes(mounts.as_bytes())
}

/// Same as [`parse_mount_table`] on raw table bytes. Lines that are not valid
/// UTF-8 are skipped one by one; the rest of the table still parses.
pub fn parse_mount_bytes(mounts: &[u8]) -> Vec<MountEntry> {
    mounts
        .split(|byte| *byte == b'\n')
        .filter_map(|raw| match std::str::from_utf8(raw) {
            Ok(line) => parse_mount_line(line),
            Err(err) => {
                debug!("skipping undecodable mount table line: {err}");
                None
            }
        })
        .collect()
}

fn parse_mount_line(line: &str) -> Option<MountEntry> {
    let mut parts = line.split_whitespace();
    let device = parts.next()?;
    let mountpoint = parts.next()?;
    let fstype = parts.next().unwrap_or_default();
    Some(MountEntry {
        device: unescape_mount_field(device),
        mountpoint: PathBuf::from(unescape_mount_field(mountpoint)),
        fstype: fstype.to_string(),
    })
}

fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<String>) -> Self {
            let prev = env::var(key).ok();
            env::set_var(key, value.into());
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.prev {
                env::set_var(self.key, prev);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    const SNAPSHOT: &str = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/alice/KEY\\040STICK vfat rw,nosuid 0 0
/dev/sdc1 /run/media/bob/BACKUP exfat rw 0 0
tmpfs /media/ram tmpfs rw 0 0
/dev/sdd1 /media vfat rw 0 0
/dev/sdb1 /media/alice/KEY\\040STICK vfat rw,nosuid 0 0
";

    #[test]
    fn parse_mount_table_decodes_fields() {
        let entries = parse_mount_table(SNAPSHOT);
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[2].device, "/dev/sdb1");
        assert_eq!(entries[2].mountpoint, PathBuf::from("/media/alice/KEY STICK"));
        assert_eq!(entries[2].fstype, "vfat");
    }

    #[test]
    fn removable_mounts_filters_by_root_and_device() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(&table, SNAPSHOT).unwrap();

        let source = MountTable::new(["/media", "/run/media"]).with_table_path(&table);
        let mounts = source.removable_mounts().unwrap();
        assert_eq!(
            mounts,
            vec![
                MountPoint::from("/media/alice/KEY STICK"),
                MountPoint::from("/run/media/bob/BACKUP"),
            ]
        );
        assert!(source
            .is_mounted(&MountPoint::from("/run/media/bob/BACKUP"))
            .unwrap());
        assert!(!source.is_mounted(&MountPoint::from("/media")).unwrap());
    }

    #[test]
    fn undecodable_line_does_not_hide_other_mounts() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        let mut contents = b"/dev/sdz1 /srv/caf\xe9 ext4 rw 0 0\n".to_vec();
        contents.extend_from_slice(b"/dev/sdb1 /media/KEY vfat rw 0 0\n");
        fs::write(&table, contents).unwrap();

        let source = MountTable::new(["/media"]).with_table_path(&table);
        assert_eq!(source.entries().unwrap().len(), 1);
        assert_eq!(
            source.removable_mounts().unwrap(),
            vec![MountPoint::from("/media/KEY")]
        );
        assert!(source.is_mounted(&MountPoint::from("/media/KEY")).unwrap());
    }

    #[test]
    fn unreadable_table_is_an_error_not_an_absence() {
        let dir = tempdir().unwrap();
        let source = MountTable::new(["/media"]).with_table_path(dir.path().join("missing"));
        assert!(source.is_mounted(&MountPoint::from("/media/KEY")).is_err());
    }

    #[test]
    fn find_mount_point_honours_override() {
        let dir = tempdir().unwrap();
        let mount_file = dir.path().join("mounts");
        fs::write(&mount_file, "/dev/sdb1 /media/keyward vfat rw,relatime 0 0\n").unwrap();

        let _guard = EnvGuard::set(
            MOUNTS_OVERRIDE_ENV,
            mount_file.to_string_lossy().into_owned(),
        );

        let result = find_mount_point(Path::new("/dev/sdb1")).unwrap();
        assert_eq!(result, Some(PathBuf::from("/media/keyward")));
        assert_eq!(find_mount_point(Path::new("/dev/sdz9")).unwrap(), None);
    }

    #[test]
    fn unescape_mount_field_decodes_octals() {
        assert_eq!(unescape_mount_field("/media/KEY\\040STICK"), "/media/KEY STICK");
        assert_eq!(unescape_mount_field("/mnt/keys"), "/mnt/keys");
        assert_eq!(unescape_mount_field("/mnt/odd\\9"), "/mnt/odd\\9");
    }
}
