use std::fs;
use std::io::{self, Write};

use camino::Utf8Path;
use tempfile::Builder;

/// Write `content` to a temp file next to `path`, then rename it over `path`.
///
/// Readers observe either the previous file or the complete new one.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())?;
    let mut temp = Builder::new()
        .prefix(".tsetmc-tmp")
        .tempfile_in(parent.as_std_path())?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path.as_std_path()).map_err(|err| err.error)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Utf8Path) -> io::Result<()> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(".tsetmc-tmp")
}
