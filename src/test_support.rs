use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::time::Instant;

/// Writes an executable `/bin/sh` script standing in for yt-dlp.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub(crate) fn job_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with("vd_"))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Job files are removed on a background task; polls until `expected` remain.
pub(crate) async fn wait_for_job_files(dir: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let names = job_files(dir);
        if names.len() == expected || Instant::now() >= deadline {
            return names;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
