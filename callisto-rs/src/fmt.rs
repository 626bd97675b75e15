//! Provides formatting helpers for byte sizes.
//!
//! Cache capacities in the settings file are given as strings like `64m` or `2g`. These
//! helpers translate between such expressions and raw byte counts.

/// Formats the given size in bytes into a concise representation.
///
/// # Examples
/// ```
/// # use callisto::fmt::format_size;
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(2048), "2.00 KiB");
/// assert_eq!(format_size(3 * 1024 * 1024), "3.00 MiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    let size = size_in_bytes as f64;
    if size < 1024. {
        format!("{} B", size_in_bytes)
    } else if size < 1024. * 1024. {
        format!("{:.2} KiB", size / 1024.)
    } else if size < 1024. * 1024. * 1024. {
        format!("{:.2} MiB", size / 1024. / 1024.)
    } else {
        format!("{:.2} GiB", size / 1024. / 1024. / 1024.)
    }
}

/// Parses a size expression like `1024`, `16k`, `64m`, `2g` or `1t` into bytes.
///
/// # Examples
/// ```
/// # use callisto::fmt::parse_size;
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("2k").unwrap(), 2048);
/// assert_eq!(parse_size("16 M").unwrap(), 16 * 1024 * 1024);
/// assert!(parse_size("a lot").is_err());
/// ```
pub fn parse_size(input: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_SUFFIX: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *([bBkKmMgGtT]?) *$").unwrap();
    }

    match NUMBER_AND_SUFFIX.captures(input.as_ref()) {
        Some(captures) => {
            let number = captures[1].parse::<usize>().unwrap();
            match &captures[2] {
                "k" | "K" => Ok(number * 1024),
                "m" | "M" => Ok(number * 1024 * 1024),
                "g" | "G" => Ok(number * 1024 * 1024 * 1024),
                "t" | "T" => Ok(number * 1024 * 1024 * 1024 * 1024),
                _ => Ok(number),
            }
        }
        None => Err(anyhow::anyhow!(
            "Cannot parse '{}' into a size expression. \
             Expected a positive number and optionally 'b', 'k', 'm', 'g' or 't' as suffix.",
            input.as_ref()
        )),
    }
}
