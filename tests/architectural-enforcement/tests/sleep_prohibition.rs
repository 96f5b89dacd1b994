//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, channels, or timers tied to a
//! deadline. It never sleeps to poll or to paper over a race.
//! **Exceptions**: retry backoff, the scripted provider's pacing step, test code.

use architectural_enforcement::{code_part, production_sources, window_contains};

/// Files whose sleeps are part of their contract
const ALLOWED_FILES: &[&str] = &["provider/scripted.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        if ALLOWED_FILES.iter().any(|f| file.unix_path().ends_with(f)) {
            continue;
        }
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                continue;
            }
            let backoff = window_contains(
                &file.lines,
                idx.saturating_sub(15),
                idx + 5,
                &["backoff", "retry", "reopen"],
            );
            if backoff {
                continue;
            }
            violations.push(format!(
                "{}:{} - {}",
                file.path.display(),
                idx + 1,
                line.trim()
            ));
        }
    }

    assert!(
        violations.is_empty(),
        "\nFound {} sleep violation(s) in production code:\n  {}\n",
        violations.len(),
        violations.join("\n  ")
    );
}

#[test]
fn test_no_thread_sleep_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if code_part(line).contains("thread::sleep") {
                violations.push(format!("{}:{}", file.path.display(), idx + 1));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "std::thread::sleep blocks a runtime worker: {violations:?}"
    );
}
