use crate::core::error::{Error, Result};
use redb::Database;
use std::io::Read;
use std::path::Path;

/// File name of the per-domain redb database
pub const DATABASE_FILE_NAME: &str = "index.redb";

/// First bytes of every redb file
const REDB_MAGIC: [u8; 9] = [b'r', b'e', b'd', b'b', 0x1A, 0x0A, 0xA9, 0x0D, 0x0A];

/// Open or create a domain database.
///
/// A non-empty file without the redb header, or one that redb refuses to
/// open for any reason other than being held by another process, is
/// treated as corrupt: it is deleted and recreated empty, and the reason is
/// returned so the caller can surface a warning.
pub fn open_database(path: &Path) -> Result<(Database, Option<String>)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if let Some(problem) = header_problem(path)? {
        return recreate(path, problem);
    }

    match Database::create(path) {
        Ok(db) => Ok((db, None)),
        Err(redb::DatabaseError::DatabaseAlreadyOpen) => Err(Error::Database(format!(
            "{} is locked. Another lodestone process may be running. Close other instances and try again.",
            path.display()
        ))),
        Err(e) => recreate(path, e.to_string()),
    }
}

/// Why an existing file cannot be a redb database, if it cannot.
///
/// redb reinitializes a file with a bad header instead of failing.
fn header_problem(path: &Path) -> Result<Option<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }

    let mut header = [0u8; REDB_MAGIC.len()];
    match file.read_exact(&mut header) {
        Ok(()) if header == REDB_MAGIC => Ok(None),
        Ok(()) => Ok(Some("missing redb file header".to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Some("truncated redb file header".to_string())),
        Err(e) => Err(e.into()),
    }
}

fn recreate(path: &Path, problem: String) -> Result<(Database, Option<String>)> {
    let reason = format!("discarded unreadable database {}: {}", path.display(), problem);
    tracing::warn!(path = %path.display(), error = %problem, "recreating corrupted database");
    std::fs::remove_file(path)?;
    let db = Database::create(path)?;
    Ok((db, Some(reason)))
}
