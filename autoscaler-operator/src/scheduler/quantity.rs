//! Parses Kubernetes resource `Quantity` strings (e.g. `"500m"`, `"2"`,
//! `"128Mi"`, `"4Gi"`) into the millicore/byte integers the
//! [`super::PendingPod`] and [`crate::analyzer::InstanceInfo`] types use.
//! Grounded on the suffix table used by Kubernetes itself (decimal SI
//! suffixes for CPU, binary suffixes for memory); scientific notation and
//! negative quantities are not handled, matching what this autoscaler's
//! inputs actually produce.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const DEC_SUFFIXES: &[(&str, i32)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
];

const BIN_SUFFIXES: &[(&str, i32)] = &[
    ("", 0),
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
];

fn split_suffix<'a>(s: &'a str, suffixes: &[(&str, i32)]) -> Option<(f64, i32)> {
    let mut best: Option<(&str, i32)> = None;
    for (suffix, exp) in suffixes {
        if s.ends_with(suffix) && best.is_none_or(|(b, _)| suffix.len() > b.len()) {
            best = Some((suffix, *exp));
        }
    }
    let (suffix, exp) = best?;
    let numeric = &s[..s.len() - suffix.len()];
    let value: f64 = numeric.parse().ok()?;
    Some((value, exp))
}

/// Parses a CPU quantity into millicores (`"500m"` → 500, `"2"` → 2000).
pub fn cpu_millicores(q: &Quantity) -> u64 {
    let s = q.0.trim();
    match split_suffix(s, DEC_SUFFIXES) {
        Some((value, exp)) => (value * 10f64.powi(exp + 3)).round().max(0.0) as u64,
        None => 0,
    }
}

/// Parses a memory quantity into bytes (`"128Mi"` → 134217728).
pub fn memory_bytes(q: &Quantity) -> u64 {
    let s = q.0.trim();
    if let Some((value, exp)) = split_suffix(s, BIN_SUFFIXES) {
        if exp != 0 || s.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return (value * 2f64.powi(exp)).round().max(0.0) as u64;
        }
    }
    if let Some((value, exp)) = split_suffix(s, DEC_SUFFIXES) {
        return (value * 10f64.powi(exp)).round().max(0.0) as u64;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_millis_suffix() {
        assert_eq!(cpu_millicores(&Quantity("500m".into())), 500);
    }

    #[test]
    fn cpu_bare_cores() {
        assert_eq!(cpu_millicores(&Quantity("2".into())), 2000);
        assert_eq!(cpu_millicores(&Quantity("1.5".into())), 1500);
    }

    #[test]
    fn memory_binary_suffix() {
        assert_eq!(memory_bytes(&Quantity("128Mi".into())), 128 * 1024 * 1024);
        assert_eq!(memory_bytes(&Quantity("4Gi".into())), 4 * 1024 * 1024 * 1024);
    }

    #[test]
    fn memory_decimal_suffix() {
        assert_eq!(memory_bytes(&Quantity("1k".into())), 1000);
        assert_eq!(memory_bytes(&Quantity("2M".into())), 2_000_000);
    }

    #[test]
    fn memory_bare_bytes() {
        assert_eq!(memory_bytes(&Quantity("1024".into())), 1024);
    }
}
