//! Stale profile-lock cleanup for crashed predecessor processes.

use std::io;
use std::path::Path;

use tracing::debug;

/// Lock artifacts a crashed browser/driver leaves behind in a profile dir.
/// `Singleton*` entries may be dangling symlinks.
const LOCK_FILE_NAMES: &[&str] = &["SingletonLock", "SingletonCookie", "SingletonSocket", "lockfile"];

/// Removes known lock artifacts from `profile_dir`, returning how many were
/// deleted. Missing files are not an error; the directory itself may not
/// exist yet.
pub fn clear_stale_locks(profile_dir: &Path) -> io::Result<usize> {
	let mut removed = 0;
	for name in LOCK_FILE_NAMES {
		let path = profile_dir.join(name);
		match std::fs::remove_file(&path) {
			Ok(()) => {
				debug!(target = "gate.client", path = %path.display(), "removed stale lock");
				removed += 1;
			}
			Err(err) if err.kind() == io::ErrorKind::NotFound => {}
			Err(err) => return Err(err),
		}
	}
	Ok(removed)
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn removes_known_lock_files() {
		let temp = TempDir::new().unwrap();
		std::fs::write(temp.path().join("SingletonLock"), b"").unwrap();
		std::fs::write(temp.path().join("SingletonCookie"), b"").unwrap();
		std::fs::write(temp.path().join("session.json"), b"{}").unwrap();

		let removed = clear_stale_locks(temp.path()).unwrap();
		assert_eq!(removed, 2);
		assert!(temp.path().join("session.json").exists());
		assert!(!temp.path().join("SingletonLock").exists());
	}

	#[test]
	fn missing_directory_removes_nothing() {
		let temp = TempDir::new().unwrap();
		let gone = temp.path().join("nope");
		assert_eq!(clear_stale_locks(&gone).unwrap(), 0);
	}
}
