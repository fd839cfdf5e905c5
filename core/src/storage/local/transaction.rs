use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::error;

/// The backup of a single file, held in a scratch file that disappears when
/// the backup is dropped.
struct Backup {
    original: PathBuf,
    scratch: NamedTempFile,
}

impl Backup {
    /// Captures the current content of `path`. Returns `None` if the file
    /// does not exist yet.
    fn capture(path: &Path) -> io::Result<Option<Self>> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut scratch = NamedTempFile::new()?;
        scratch.write_all(&content)?;
        scratch.flush()?;

        Ok(Some(Self {
            original: path.to_path_buf(),
            scratch,
        }))
    }

    fn restore(&self) -> io::Result<()> {
        let content = fs::read(self.scratch.path())?;
        fs::write(&self.original, content)
    }
}

/// Records a sequence of file updates and deletes and can roll all of them
/// back. Dropping a transaction without calling [`Transaction::rollback`]
/// keeps the changes (backups are discarded).
///
/// Not crash-atomic across files: a crash mid-transaction leaves each file
/// individually in either its old or its new state.
#[derive(Default)]
pub struct Transaction {
    backups: Vec<Backup>,
    created: Vec<PathBuf>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `content` to `path`, creating parent directories as needed.
    pub fn update(&mut self, path: &Path, content: &[u8]) -> io::Result<()> {
        let backup = Backup::capture(path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        match backup {
            Some(backup) => self.backups.push(backup),
            None => self.created.push(path.to_path_buf()),
        }
        Ok(())
    }

    /// Deletes `path`. Deleting a file that does not exist is a no-op.
    pub fn delete(&mut self, path: &Path) -> io::Result<()> {
        let Some(backup) = Backup::capture(path)? else {
            return Ok(());
        };

        fs::remove_file(path)?;
        self.backups.push(backup);
        Ok(())
    }

    /// Keeps the changes and discards all backups.
    pub fn apply(self) {}

    /// Removes newly created files and restores every touched file from its
    /// backup.
    pub fn rollback(self) {
        for path in &self.created {
            if let Err(err) = fs::remove_file(path) {
                error!(path = %path.display(), %err, "error removing created file");
            }
        }
        for backup in &self.backups {
            if let Err(err) = backup.restore() {
                error!(path = %backup.original.display(), %err, "error restoring backup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rollback_restores_previous_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.conf");
        fs::write(&path, b"old").unwrap();

        let mut t = Transaction::new();
        t.update(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");

        t.rollback();
        assert_eq!(fs::read(&path).unwrap(), b"old");
    }

    #[test]
    fn rollback_removes_created_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("a.conf");

        let mut t = Transaction::new();
        t.update(&path, b"new").unwrap();
        assert!(path.exists());

        t.rollback();
        assert!(!path.exists());
    }

    #[test]
    fn rollback_restores_deleted_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.conf");
        fs::write(&path, b"content").unwrap();

        let mut t = Transaction::new();
        t.delete(&path).unwrap();
        assert!(!path.exists());

        t.rollback();
        assert_eq!(fs::read(&path).unwrap(), b"content");
    }

    #[test]
    fn apply_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let updated = dir.path().join("a.conf");
        let deleted = dir.path().join("b.conf");
        fs::write(&updated, b"old").unwrap();
        fs::write(&deleted, b"going away").unwrap();

        let mut t = Transaction::new();
        t.update(&updated, b"new").unwrap();
        t.delete(&deleted).unwrap();
        t.apply();

        assert_eq!(fs::read(&updated).unwrap(), b"new");
        assert!(!deleted.exists());
    }

    #[test]
    fn deleting_a_missing_file_is_a_noop() {
        let dir = TempDir::new().unwrap();

        let mut t = Transaction::new();
        t.delete(&dir.path().join("missing.conf")).unwrap();
        t.rollback();
    }

    #[test]
    fn rollback_covers_multiple_files() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.conf");
        let second = dir.path().join("second.conf");
        fs::write(&first, b"first-old").unwrap();

        let mut t = Transaction::new();
        t.update(&first, b"first-new").unwrap();
        t.update(&second, b"second-new").unwrap();

        t.rollback();
        assert_eq!(fs::read(&first).unwrap(), b"first-old");
        assert!(!second.exists());
    }
}
