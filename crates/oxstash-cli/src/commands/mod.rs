pub mod cat;
pub mod ls;
pub mod mirror;
pub mod rm;
pub mod stat;
pub mod write;

/// Turn a user-supplied path into a store path: no leading or trailing
/// slashes, root as the empty string.
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
