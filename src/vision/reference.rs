//! Reference image lookup.
//!
//! References live in a read-only directory and are named
//! `btn{NN}_{name}_cam{C}.{ext}`, where `NN` is the one-based button
//! number, `name` the normalised button name and `C` the camera index.
//! Re-captured references may carry a suffix (`btn03_vol_up_cam1_v2.png`);
//! when several files match, the most recently modified one wins.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Lowercase, with every run of non-alphanumeric characters collapsed to a
/// single underscore.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// File stem for a button/camera pair. `button_index` is zero-based.
pub fn reference_stem(button_index: usize, button_name: &str, camera: u8) -> String {
    format!(
        "btn{:02}_{}_cam{}",
        button_index + 1,
        normalize_name(button_name),
        camera
    )
}

/// Find the reference for a button/camera pair, newest first.
pub fn find_reference(
    button_index: usize,
    button_name: &str,
    camera: u8,
    reference_dir: &Path,
) -> Option<PathBuf> {
    let stem = reference_stem(button_index, button_name, camera);
    let versioned = format!("{stem}_");

    let entries = match std::fs::read_dir(reference_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %reference_dir.display(), error = %e, "reference directory unreadable");
            return None;
        }
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            let ext = path.extension()?.to_str()?.to_ascii_lowercase();
            if !EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            let file_stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
            if file_stem != stem && !file_stem.starts_with(&versioned) {
                return None;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, path))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize_name("Vol +"), "vol");
        assert_eq!(normalize_name("  CH Up / Down "), "ch_up_down");
        assert_eq!(normalize_name("POWER"), "power");
        assert_eq!(reference_stem(0, "Power", 2), "btn01_power_cam2");
    }

    #[test]
    fn missing_reference_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_reference(0, "power", 1, dir.path()).is_none());
        assert!(find_reference(0, "power", 1, &dir.path().join("absent")).is_none());
    }

    #[test]
    fn lookup_respects_camera_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("btn01_power_cam1.png")).unwrap();
        File::create(dir.path().join("btn01_power_cam2.txt")).unwrap();
        File::create(dir.path().join("btn01_power_cam10.png")).unwrap();

        let found = find_reference(0, "Power", 1, dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "btn01_power_cam1.png");
        assert!(find_reference(0, "Power", 2, dir.path()).is_none());
    }

    #[test]
    fn newest_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("btn02_mute_cam1.png");
        let new = dir.path().join("btn02_mute_cam1_v2.png");
        File::create(&old).unwrap();
        File::create(&new).unwrap();

        let now = SystemTime::now();
        File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(now - Duration::from_secs(3600))
            .unwrap();
        File::options().write(true).open(&new).unwrap().set_modified(now).unwrap();

        assert_eq!(find_reference(1, "Mute", 1, dir.path()).unwrap(), new);

        fs::remove_file(&new).unwrap();
        assert_eq!(find_reference(1, "Mute", 1, dir.path()).unwrap(), old);
    }
}
