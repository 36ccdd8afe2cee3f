//! Provides formatting helpers for durations and byte sizes.
use anyhow::anyhow;

/// Formats a duration given in microseconds.
///
/// This function determines the ideal unit (ranging from microseconds to seconds) to provide
/// a concise representation.
///
/// Note that a helper function [format_short_duration](format_short_duration) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_micros(micros: i32, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if micros < 1_000 {
        write!(f, "{} us", micros)
    } else if micros < 10_000 {
        write!(f, "{:.2} ms", micros as f32 / 1_000.)
    } else if micros < 100_000 {
        write!(f, "{:.1} ms", micros as f32 / 1_000.)
    } else if micros < 1_000_000 {
        write!(f, "{} ms", micros / 1_000)
    } else if micros < 10_000_000 {
        write!(f, "{:.2} s", micros as f32 / 1_000_000.)
    } else if micros < 100_000_000 {
        write!(f, "{:.1} s", micros as f32 / 1_000_000.)
    } else {
        write!(f, "{} s", micros / 1_000_000)
    }
}

/// Formats a duration given in microseconds and returns a String representation.
///
/// # Examples
///
/// ```
/// assert_eq!(hivecache::fmt::format_short_duration(100), "100 us");
/// assert_eq!(hivecache::fmt::format_short_duration(8_192), "8.19 ms");
/// assert_eq!(hivecache::fmt::format_short_duration(32_768), "32.8 ms");
/// assert_eq!(hivecache::fmt::format_short_duration(128_123), "128 ms");
/// assert_eq!(hivecache::fmt::format_short_duration(1_128_123), "1.13 s");
/// assert_eq!(hivecache::fmt::format_short_duration(10_128_123), "10.1 s");
/// assert_eq!(hivecache::fmt::format_short_duration(101_000_000), "101 s");
/// ```
pub fn format_short_duration(duration_in_micros: i32) -> String {
    let mut result = String::new();
    let _ = format_micros(duration_in_micros, &mut result);
    result
}

/// Formats a given size in bytes.
///
/// This function determines the ideal unit (ranging from bytes to petabytes) to provide
/// a concise representation.
///
/// Note that a helper function [format_size](format_size) is also provided
/// which directly returns a String. This function also provides some examples.
pub fn format_bytes(size_in_bytes: usize, f: &mut dyn std::fmt::Write) -> std::fmt::Result {
    if size_in_bytes == 1 {
        return write!(f, "1 byte");
    } else if size_in_bytes < 1024 {
        return write!(f, "{} bytes", size_in_bytes);
    }

    let mut magnitude = 0;
    let mut size = size_in_bytes as f32;
    while size > 1024. && magnitude < 5 {
        size /= 1024.;
        magnitude += 1;
    }

    if size <= 10. {
        write!(f, "{:.2} ", size)?;
    } else if size <= 100. {
        write!(f, "{:.1} ", size)?;
    } else {
        write!(f, "{:.0} ", size)?;
    }

    match magnitude {
        0 => write!(f, "Bytes"),
        1 => write!(f, "KiB"),
        2 => write!(f, "MiB"),
        3 => write!(f, "GiB"),
        4 => write!(f, "TiB"),
        _ => write!(f, "PiB"),
    }
}

/// Formats a given size in bytes and returns a String representation.
///
/// # Examples
///
/// ```
/// assert_eq!(hivecache::fmt::format_size(0), "0 bytes");
/// assert_eq!(hivecache::fmt::format_size(1), "1 byte");
/// assert_eq!(hivecache::fmt::format_size(100), "100 bytes");
/// assert_eq!(hivecache::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(hivecache::fmt::format_size(873_400), "853 KiB");
/// assert_eq!(hivecache::fmt::format_size(8_734_000), "8.33 MiB");
/// assert_eq!(hivecache::fmt::format_size(8_734_000_000), "8.13 GiB");
/// assert_eq!(hivecache::fmt::format_size(8_734_000_000_000), "7.94 TiB");
/// assert_eq!(hivecache::fmt::format_size(8_734_000_000_000_000), "7.76 PiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let mut result = String::new();
    let _ = format_bytes(size_in_bytes, &mut result);

    result
}

/// Parses a byte size from a given string.
///
/// This string can have the following suffixes:
/// * **b** or **B**: keeps the value as is (plain bytes)
/// * **k** or **K**: multiplies the given value by 1024 thus treats the value as KiB
/// * **m** or **M**: multiplies the given value by 1.048.576 thus treats the value as MiB
/// * **g** or **G**: multiplies the given value by 1.073.741.824 thus treats the value as GiB
/// * **t** or **T**: multiplies the given value by 1.099.511.627.776 thus treats the value as TiB
///
/// Returns an **Err** if either a non-integer value is given or if an unknown suffix was
/// provided.
///
/// # Examples
///
/// ```
/// assert_eq!(hivecache::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(hivecache::fmt::parse_size("100b").unwrap(), 100);
/// assert_eq!(hivecache::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(hivecache::fmt::parse_size("8m").unwrap(), 8 * 1024 * 1024);
/// assert_eq!(hivecache::fmt::parse_size("4 G").unwrap(), 4 * 1024 * 1024 * 1024);
/// assert_eq!(hivecache::fmt::parse_size("3 T").unwrap(), 3 * 1024 * 1024 * 1024 * 1024);
/// assert_eq!(hivecache::fmt::parse_size("").is_err(), true);
/// assert_eq!(hivecache::fmt::parse_size("5x").is_err(), true);
/// ```
pub fn parse_size(input: &str) -> anyhow::Result<usize> {
    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(anyhow!("No size was given!"));
    }

    let (digits, factor): (&str, usize) = if let Some(digits) = normalized.strip_suffix('b') {
        (digits, 1)
    } else if let Some(digits) = normalized.strip_suffix('k') {
        (digits, 1024)
    } else if let Some(digits) = normalized.strip_suffix('m') {
        (digits, 1024 * 1024)
    } else if let Some(digits) = normalized.strip_suffix('g') {
        (digits, 1024 * 1024 * 1024)
    } else if let Some(digits) = normalized.strip_suffix('t') {
        (digits, 1024 * 1024 * 1024 * 1024)
    } else {
        (normalized.as_str(), 1)
    };

    match digits.trim().parse::<usize>() {
        Ok(value) => Ok(value * factor),
        Err(_) => Err(anyhow!("Cannot parse '{}' as a size in bytes!", input)),
    }
}
