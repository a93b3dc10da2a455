//! OWASP Top 10 2021 category taxonomy: hint mapping, relationship weights,
//! and the per-category tool catalog used by the Execution Subgraph.

use rustc_hash::FxHashMap;

pub const DEFAULT_CATEGORY: &str = "A04:2021-Insecure Design";

/// `category_hint -> category` table used by the Analysis Mapper (4.6).
pub fn map_category_hint(hint: &str) -> &'static str {
    match hint.trim().to_lowercase().as_str() {
        "injection" => "A03:2021-Injection",
        "broken_access_control" => "A01:2021-Broken Access Control",
        "cryptographic_failures" => "A02:2021-Cryptographic Failures",
        "security_misconfiguration" => "A05:2021-Security Misconfiguration",
        "vulnerable_components" => "A06:2021-Vulnerable and Outdated Components",
        "insecure_transport" => DEFAULT_CATEGORY,
        _ => DEFAULT_CATEGORY,
    }
}

/// Extracts the `Axx` code out of a full category string, or `"A00"` if the
/// string doesn't carry a recognizable OWASP prefix.
pub fn owasp_id(category: &str) -> String {
    let prefix = category.split(':').next().unwrap_or("").trim();
    if prefix.len() == 3 && prefix.starts_with('A') && prefix[1..].chars().all(|c| c.is_ascii_digit()) {
        prefix.to_string()
    } else {
        "A00".to_string()
    }
}

/// Deterministic fraction of a source category's base score added to a
/// target category (Correlation Applier, 4.7).
pub fn correlation_weights() -> FxHashMap<&'static str, Vec<(&'static str, f64)>> {
    let mut m: FxHashMap<&'static str, Vec<(&'static str, f64)>> = FxHashMap::default();
    m.insert("A01", vec![("A05", 0.15)]);
    m.insert("A02", vec![("A05", 0.10)]);
    m.insert("A03", vec![("A05", 0.20)]);
    m.insert("A05", vec![("A01", 0.10), ("A03", 0.10)]);
    m.insert("A06", vec![("A05", 0.15)]);
    m
}

/// Fixed table category → default tool set for the Execution Subgraph's
/// Tool Selector (4.8). Anything not listed falls back to
/// `["generic_pattern_scan"]`.
pub fn category_tool_catalog() -> FxHashMap<&'static str, Vec<&'static str>> {
    let mut m = FxHashMap::default();
    m.insert("A01:2021-Broken Access Control", vec!["access_path_scan", "policy_gap_scan"]);
    m.insert(
        "A02:2021-Cryptographic Failures",
        vec!["crypto_key_scan", "config_entropy_check"],
    );
    m.insert("A03:2021-Injection", vec!["ast_deep_scan", "regex_injection", "taint_sim"]);
    m
}

pub fn tools_for_category(category: &str) -> Vec<&'static str> {
    category_tool_catalog()
        .get(category)
        .cloned()
        .unwrap_or_else(|| vec!["generic_pattern_scan"])
}

/// Fixed weight table used by the Tool Prioritizer (4.8) to order tools
/// within a category, descending.
pub fn tool_weight(tool: &str) -> i32 {
    match tool {
        "taint_sim" => 100,
        "ast_deep_scan" => 90,
        "regex_injection" => 80,
        "crypto_key_scan" => 85,
        "config_entropy_check" => 70,
        "access_path_scan" => 75,
        "policy_gap_scan" => 65,
        _ => 50,
    }
}

/// Category → tool→severity inference table for Tool Runtime (4.3) when a
/// finding omits severity.
pub fn infer_severity(tool: &str) -> &'static str {
    const HIGH_TOOLS: &[&str] = &["taint_sim", "crypto_key_scan", "access_path_scan"];
    if HIGH_TOOLS.contains(&tool) {
        "high"
    } else {
        "medium"
    }
}

/// Category inference table for Tool Runtime (4.3) when a finding omits
/// category.
pub fn infer_category(tool: &str) -> &'static str {
    match tool {
        "access_path_scan" | "policy_gap_scan" => "A01:2021-Broken Access Control",
        "crypto_key_scan" | "config_entropy_check" => "A02:2021-Cryptographic Failures",
        "ast_deep_scan" | "regex_injection" | "taint_sim" => "A03:2021-Injection",
        _ => DEFAULT_CATEGORY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_hint_defaults_to_insecure_design() {
        assert_eq!(map_category_hint("whatever"), DEFAULT_CATEGORY);
    }

    #[test]
    fn owasp_id_extracts_prefix() {
        assert_eq!(owasp_id("A03:2021-Injection"), "A03");
        assert_eq!(owasp_id("not-a-category"), "A00");
    }
}
