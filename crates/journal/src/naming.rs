use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Pick the journal path for a session.
///
/// Without a requested path the name is `<device>_<YYYY-MM-DD_HH-MM-SS>`.
/// The extension is appended unless the path already ends with it, compared
/// case-insensitively.
pub fn resolve_journal_path(
    requested: Option<&Path>,
    device_name: Option<&str>,
    now: NaiveDateTime,
    extension: &str,
) -> PathBuf {
    let path = match requested {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => {
            let device = device_name
                .filter(|name| !name.is_empty())
                .unwrap_or("UnknownDevice");
            PathBuf::from(format!("{device}_{}", now.format("%Y-%m-%d_%H-%M-%S")))
        }
    };

    let has_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
    if has_extension || extension.is_empty() {
        return path;
    }

    let mut name = OsString::from(path);
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
