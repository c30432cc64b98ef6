//! Resource quantity parsing.
//!
//! Quantities arrive as strings (`500m`, `1`, `128Mi`, `80Gi`, `750M`).
//! Parsers are total: malformed input parses as zero, matching how the
//! scheduler treats absent requests.

/// Parse a CPU quantity into milli-units. `500m` is 500, `2` is 2000.
pub fn parse_cpu(cpu_str: &str) -> u64 {
    let cpu_str = cpu_str.trim();
    if let Some(millis) = cpu_str.strip_suffix('m') {
        millis.parse::<u64>().unwrap_or(0)
    } else {
        (cpu_str.parse::<f64>().unwrap_or(0.0) * 1000.0) as u64
    }
}

/// Parse a memory quantity into bytes. Binary (`Ki`/`Mi`/`Gi`/`Ti`) and
/// decimal (`k`/`M`/`G`/`T`) suffixes are both accepted.
pub fn parse_memory(memory_str: &str) -> u64 {
    let memory_str = memory_str.trim().to_lowercase();
    if let Some(v) = memory_str.strip_suffix("ki") {
        v.parse::<u64>().unwrap_or(0) * 1024
    } else if let Some(v) = memory_str.strip_suffix("mi") {
        v.parse::<u64>().unwrap_or(0) * 1024 * 1024
    } else if let Some(v) = memory_str.strip_suffix("gi") {
        v.parse::<u64>().unwrap_or(0) * 1024 * 1024 * 1024
    } else if let Some(v) = memory_str.strip_suffix("ti") {
        v.parse::<u64>().unwrap_or(0) * 1024 * 1024 * 1024 * 1024
    } else if let Some(v) = memory_str.strip_suffix('k') {
        v.parse::<u64>().unwrap_or(0) * 1000
    } else if let Some(v) = memory_str.strip_suffix('m') {
        v.parse::<u64>().unwrap_or(0) * 1000 * 1000
    } else if let Some(v) = memory_str.strip_suffix('g') {
        v.parse::<u64>().unwrap_or(0) * 1000 * 1000 * 1000
    } else if let Some(v) = memory_str.strip_suffix('t') {
        v.parse::<u64>().unwrap_or(0) * 1000 * 1000 * 1000 * 1000
    } else {
        memory_str.parse::<u64>().unwrap_or(0)
    }
}

/// Parse a bare count, e.g. an accelerator quantity (`nvidia.com/gpu: "2"`).
pub fn parse_count(count_str: &str) -> u64 {
    count_str.trim().parse::<u64>().unwrap_or(0)
}

/// Render milli-units back into a CPU quantity string.
pub fn format_cpu(millis: u64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

/// Render bytes back into a memory quantity string, preferring binary units.
pub fn format_memory(bytes: u64) -> String {
    const GI: u64 = 1024 * 1024 * 1024;
    const MI: u64 = 1024 * 1024;
    const KI: u64 = 1024;
    if bytes >= GI && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes >= MI && bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else if bytes >= KI && bytes % KI == 0 {
        format!("{}Ki", bytes / KI)
    } else {
        format!("{bytes}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("500m"), 500);
        assert_eq!(parse_cpu("2"), 2000);
        assert_eq!(parse_cpu("0.5"), 500);
        assert_eq!(parse_cpu(""), 0);
        assert_eq!(parse_cpu("bogus"), 0);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("128Mi"), 128 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("750M"), 750_000_000);
        assert_eq!(parse_memory("80Gi"), 80 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1024"), 1024);
        assert_eq!(parse_memory(""), 0);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("2"), 2);
        assert_eq!(parse_count(" 8 "), 8);
        assert_eq!(parse_count("none"), 0);
    }

    #[test]
    fn test_format_round_trip() {
        assert_eq!(format_cpu(1000), "1");
        assert_eq!(format_cpu(500), "500m");
        assert_eq!(format_memory(1024 * 1024 * 1024), "1Gi");
        assert_eq!(format_memory(750_000_000), "750000000");
        assert_eq!(parse_cpu(&format_cpu(1500)), 1500);
        assert_eq!(parse_memory(&format_memory(64 * 1024 * 1024)), 64 * 1024 * 1024);
    }
}
