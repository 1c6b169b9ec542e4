//! Network-filesystem detection for watch-strategy selection.
//!
//! Inotify-style watchers miss events on NFS/CIFS mounts, so paths that
//! resolve onto a network filesystem fall back to polling.

use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Filesystem types that do not deliver reliable change notifications.
const NETWORK_FS_TYPES: &[&str] = &[
    "nfs", "nfs4", "cifs", "smbfs", "smb3", "afs", "sshfs", "fuse.sshfs",
];

/// One `/proc/mounts` row we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MountPoint {
    pub path: PathBuf,
    pub fs_type: String,
}

/// Parses `/proc/mounts`-formatted data (`src mountpoint fstype options 0 0`).
/// Rows that do not parse are skipped.
pub(super) fn parse_mounts(reader: impl BufRead) -> Vec<MountPoint> {
    reader
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(1);
            let path = PathBuf::from(fields.next()?);
            let fs_type = fields.next()?.to_string();
            Some(MountPoint { path, fs_type })
        })
        .collect()
}

/// Filesystem type of the longest mount point containing `path`, if any.
pub(super) fn fs_type_of<'a>(
    mounts: &'a [MountPoint],
    path: &Path,
) -> Option<&'a str> {
    mounts
        .iter()
        .filter(|mount| path.starts_with(&mount.path))
        .max_by_key(|mount| mount.path.as_os_str().len())
        .map(|mount| mount.fs_type.as_str())
}

/// Whether `path` lives on a network filesystem. Non-Linux platforms and
/// unreadable mount tables answer `false`, keeping the native watcher.
pub(super) fn is_network_filesystem(path: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        use std::fs::File;
        use std::io::BufReader;

        let canonical =
            path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let Ok(file) = File::open("/proc/mounts") else {
            return false;
        };
        let mounts = parse_mounts(BufReader::new(file));
        fs_type_of(&mounts, &canonical)
            .is_some_and(|fs_type| NETWORK_FS_TYPES.contains(&fs_type))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNT_TABLE: &str = "\
proc /proc proc rw,nosuid 0 0
/dev/sda1 / ext4 rw,relatime 0 0
fileserver:/export /mnt/media nfs4 rw,vers=4.2 0 0
//nas/backup /mnt/media/backup cifs rw 0 0
tmpfs /tmp tmpfs rw 0 0
garbage-line
";

    #[test]
    fn test_parse_mounts_skips_malformed_rows() {
        let mounts = parse_mounts(MOUNT_TABLE.as_bytes());
        assert_eq!(mounts.len(), 5);
        assert_eq!(mounts[1].path, PathBuf::from("/"));
        assert_eq!(mounts[1].fs_type, "ext4");
    }

    #[test]
    fn test_longest_mount_prefix_wins() {
        let mounts = parse_mounts(MOUNT_TABLE.as_bytes());
        assert_eq!(
            fs_type_of(&mounts, Path::new("/mnt/media/movies/a.mkv")),
            Some("nfs4")
        );
        assert_eq!(
            fs_type_of(&mounts, Path::new("/mnt/media/backup/old")),
            Some("cifs")
        );
        assert_eq!(
            fs_type_of(&mounts, Path::new("/home/user/file")),
            Some("ext4")
        );
    }

    #[test]
    fn test_network_types_recognized() {
        for fs_type in ["nfs", "nfs4", "cifs", "sshfs"] {
            assert!(NETWORK_FS_TYPES.contains(&fs_type));
        }
        assert!(!NETWORK_FS_TYPES.contains(&"ext4"));
        assert!(!NETWORK_FS_TYPES.contains(&"tmpfs"));
    }
}
