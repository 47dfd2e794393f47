use std::path::{Path, PathBuf};

use arch_lint::rules::{NoErrorSwallowing, NoSilentResultDrop};
use arch_lint::{Analyzer, Severity};

const CRATES: [&str; 4] = ["hoist-core", "hoist-build", "hoist-cloud", "hoist-cli"];

fn crates_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("crates directory")
        .to_path_buf()
}

/// AL003 (no-error-swallowing) and AL013 (no-silent-result-drop) over one
/// crate's sources. Test code is excluded.
fn lint(crate_name: &str) -> Option<String> {
    let analyzer = Analyzer::builder()
        .root(crates_dir().join(crate_name))
        .exclude("**/target/**")
        .exclude("**/tests/**")
        .rule(NoErrorSwallowing::new())
        .rule(NoSilentResultDrop::new())
        .build()
        .expect("build analyzer");

    let result = analyzer.analyze().expect("analyze");
    result
        .has_violations_at(Severity::Warning)
        .then(|| format!("{crate_name}:\n{}", result.format_test_report(Severity::Warning)))
}

#[test]
fn no_swallowed_errors_in_any_crate() {
    let reports: Vec<String> = CRATES.iter().filter_map(|name| lint(name)).collect();
    if !reports.is_empty() {
        panic!("{}", reports.join("\n"));
    }
}
