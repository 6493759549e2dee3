//! Size- and age-rotated log file.
//!
//! The active file is `<dir>/<name>`. When a write would push it past the
//! size limit, it is renamed to `<name>.1` (older backups shift to `.2`,
//! `.3`, ...), backups beyond `max_backups` are deleted, and so are backups
//! last modified more than `max_age_days` ago.

use crate::config::FileRotation;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// A file writer that rotates itself by size and prunes by count and age.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    max_backups: usize,
    max_age: Duration,
}

impl RotatingFile {
    /// Open `<rotation.directory>/<file_name>` for appending, creating the
    /// directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be created.
    pub fn open(rotation: &FileRotation, file_name: &str) -> io::Result<Self> {
        fs::create_dir_all(&rotation.directory)?;
        let path = rotation.directory.join(file_name);
        let file = open_append(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            size,
            max_size: rotation.max_size_bytes(),
            max_backups: rotation.max_backups,
            max_age: Duration::from_secs(rotation.max_age_days.saturating_mul(SECONDS_PER_DAY)),
        })
    }

    /// Path of the active file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = self.backup_path(self.max_backups);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for index in (1..self.max_backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = open_append(&self.path)?;
        self.size = 0;
        self.prune_expired();
        Ok(())
    }

    fn prune_expired(&self) {
        if self.max_age.is_zero() {
            return;
        }
        let now = SystemTime::now();
        for index in 1..=self.max_backups {
            let backup = self.backup_path(index);
            let expired = fs::metadata(&backup)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.max_age);
            if expired {
                if let Err(e) = fs::remove_file(&backup) {
                    tracing::warn!(
                        path = %backup.display(),
                        error = %e,
                        "Failed to prune expired log file"
                    );
                }
            }
        }
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let incoming = buf.len() as u64;
        if self.max_size > 0 && self.size > 0 && self.size + incoming > self.max_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
