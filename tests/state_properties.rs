#[macro_use]
extern crate proptest;

use proptest::prelude::*;
use scan_orchestrator::state::build_initial_state;

/// Generate a key that is plausible ad-hoc `repo_metadata` JSON key.
fn metadata_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,16}").unwrap()
}

proptest! {
    /// Universal invariant (§8): no key in the result matches
    /// `(?i).*(token|key).*` except the allow-listed `github_token`.
    #[test]
    fn prop_write_guard_rejects_every_secret_like_key_but_the_allow_listed_one(
        suffix in metadata_key_strategy(),
        use_token_word in any::<bool>(),
    ) {
        let state = build_initial_state("https://github.com/o/r", "proj-1", None);
        let word = if use_token_word { "token" } else { "key" };
        let candidate = format!("{suffix}_{word}");

        let result = state.merge(|s| {
            s.repo_metadata.insert(candidate.clone(), serde_json::Value::Null);
        });

        if candidate == "github_token" {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
        }
    }

    /// Round-trip law (§8): `merge(merge(s, {}), {}) == s` for every
    /// scan id / project id pair.
    #[test]
    fn prop_double_no_op_merge_preserves_identity(
        scan_seed in "[a-z]{1,12}",
        project_seed in "[a-z]{1,12}",
    ) {
        let s = build_initial_state("https://github.com/o/r", &project_seed, None);
        let once = s.merge(|_| {}).unwrap();
        let twice = once.merge(|_| {}).unwrap();

        prop_assert_eq!(s.scan_id, twice.scan_id);
        prop_assert_eq!(s.project_id.clone(), twice.project_id);
        prop_assert_eq!(s.errors.len(), twice.errors.len());
        prop_assert_eq!(s.phase_timeline.len(), twice.phase_timeline.len());
        let _ = scan_seed;
    }
}
