/// Display difficulty of a 256-bit target, read from its top 8 bytes.
/// `diff = 2^64 / target[0..8]`, scaled with a T/G/M/K suffix.
pub fn format_difficulty(target_hex: &str) -> String {
    const UNITS: [(f64, &str); 4] = [(1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "K")];
    let prefix = target_hex
        .get(..16)
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .unwrap_or(0);
    if prefix == 0 {
        return "?".to_string();
    }
    let diff = u64::MAX as f64 / prefix as f64;
    for (threshold, unit) in UNITS {
        if diff > threshold {
            return format!("{:.2}{}", diff / threshold, unit);
        }
    }
    format!("{diff:.2}")
}
