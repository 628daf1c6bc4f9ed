//! 录音目标路径
//!
//! 相对路径以基准目录为根，缺少扩展名时补 `.wav`。
//! 目标已存在且策略为 `Suffix` 时，追加 `_1`、`_2` … 中第一个未被占用的编号。

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::FileExistsPolicy;

/// 解析录音目标路径（不检查是否存在）
pub fn resolve_output_path(file: &Path, base_dir: &Path) -> PathBuf {
    let mut path = if file.is_absolute() {
        file.to_path_buf()
    } else {
        base_dir.join(file)
    };

    let has_wav = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if !has_wav {
        let mut name = OsString::from(path.as_os_str());
        name.push(".wav");
        path = PathBuf::from(name);
    }
    path
}

/// 下一个未被占用的带编号路径
///
/// 文件名已以 `_N` 结尾时从 `N+1` 继续，否则从 `_1` 开始。只读取目录状态。
pub fn next_free_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());

    let (base, mut n) = match stem.rsplit_once('_') {
        Some((base, digits))
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match digits.parse::<u64>() {
                Ok(current) => (base.to_string(), current + 1),
                Err(_) => (stem.clone(), 1),
            }
        }
        _ => (stem.clone(), 1),
    };

    loop {
        let candidate = dir.join(format!("{}_{}.{}", base, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// 按策略决定最终写入的路径
pub fn apply_file_policy(path: PathBuf, policy: FileExistsPolicy) -> PathBuf {
    if !path.exists() {
        return path;
    }
    match policy {
        FileExistsPolicy::Overwrite => {
            log::warn!("Overwriting existing file {}", path.display());
            path
        }
        FileExistsPolicy::Suffix => {
            let next = next_free_path(&path);
            log::info!(
                "{} exists, recording to {}",
                path.display(),
                next.display()
            );
            next
        }
    }
}
