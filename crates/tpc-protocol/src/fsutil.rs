/// Permission-aware file helpers shared by the key store and audit log.
///
/// On non-unix targets the mode arguments are ignored.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

/// Owner read/write/execute.
pub(crate) const DIR_MODE: u32 = 0o700;
/// Owner read/write.
pub(crate) const PRIVATE_FILE_MODE: u32 = 0o600;
/// Owner read/write, world read.
pub(crate) const PUBLIC_FILE_MODE: u32 = 0o644;

/// Create `dir` (and parents) with owner-only permissions if missing.
pub(crate) fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir)
}

/// Replace `path` with `data`, forcing `mode` regardless of umask.
///
/// An existing file is tightened to `mode` before it is truncated, so the
/// new bytes never sit behind the old, looser permissions.
pub(crate) fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(false);
    #[cfg(unix)]
    options.mode(mode);
    let mut file = options.open(path)?;
    set_mode(&file, mode)?;
    file.set_len(0)?;
    file.write_all(data)?;
    file.flush()
}

/// Open `path` for appending, creating it owner-only.
pub(crate) fn open_append_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    options.mode(PRIVATE_FILE_MODE);
    options.open(path)
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn private_dir_is_owner_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a").join("b");
        create_private_dir(&dir).unwrap();
        assert_eq!(mode_of(&dir), DIR_MODE);
        create_private_dir(&dir).unwrap();
    }

    #[test]
    fn write_with_mode_overrides_existing_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        write_with_mode(&path, b"one", PUBLIC_FILE_MODE).unwrap();
        assert_eq!(mode_of(&path), PUBLIC_FILE_MODE);
        write_with_mode(&path, b"two", PRIVATE_FILE_MODE).unwrap();
        assert_eq!(mode_of(&path), PRIVATE_FILE_MODE);
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn overwrite_of_loose_file_tightens_and_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("private.pem");
        fs::write(&path, b"previous, much longer contents").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        write_with_mode(&path, b"new", PRIVATE_FILE_MODE).unwrap();
        assert_eq!(mode_of(&path), PRIVATE_FILE_MODE);
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }
}
