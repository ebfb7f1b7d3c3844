use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{error, warn};

use super::FindError;

/// Storage keys map straight to file names under the data directory, so
/// they are restricted to a charset that cannot escape it.
fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

fn entry_path(root: &Path, key: &str) -> PathBuf {
    root.join(key)
}

pub fn read(root: &Path, key: &str) -> Result<String, FindError> {
    if !valid_key(key) {
        error!("invalid storage key \"{key}\"");
        return Err(FindError::Internal);
    }

    fs::read_to_string(entry_path(root, key)).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            return FindError::NotFound;
        }
        error!("read \"{key}\": {e:?}");
        FindError::Internal
    })
}

pub fn write(root: &Path, key: &str, value: &str) -> Result<(), std::io::Error> {
    if !valid_key(key) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "invalid storage key",
        ));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(entry_path(root, key))?;

    file.write_all(value.as_bytes())
}

pub fn remove(root: &Path, key: &str) -> Result<(), FindError> {
    if !valid_key(key) {
        error!("invalid storage key \"{key}\"");
        return Err(FindError::Internal);
    }

    fs::remove_file(entry_path(root, key)).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            return FindError::NotFound;
        }
        error!("remove \"{key}\": {e:?}");
        FindError::Internal
    })
}

pub fn keys(root: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut keys = vec![];

    for ent in fs::read_dir(root)? {
        let ent = ent?;
        if !ent.file_type()?.is_file() {
            continue;
        }

        let fname = ent.file_name();
        let key = match fname.into_string() {
            Ok(k) => k,
            Err(e) => {
                warn!("couldn't convert path into string: {e:?}");
                continue;
            }
        };

        if valid_key(&key) {
            keys.push(key);
        }
    }

    Ok(keys)
}
