//! Integration Test: Credential Hygiene
//!
//! **Policy**: A decrypted provider key is only read where a request header
//! is built. It never appears in a log macro, an error message, or a
//! serialized type.

use architectural_enforcement::{code_part, production_sources, window_contains};

/// Files allowed to call `expose()`
const EXPOSE_ALLOWED: &[&str] = &[
    "provider/openai.rs",
    "provider/anthropic.rs",
    "provider/mistral.rs",
    "credentials.rs",
];

const LOG_MACROS: &[&str] = &[
    "trace!(", "debug!(", "info!(", "warn!(", "error!(", "format!(", "println!(", "eprintln!(",
];

/// First line of the statement that contains `lines[idx]`
fn statement_start(lines: &[String], idx: usize) -> usize {
    let mut start = idx;
    while start > 0 {
        let prev = code_part(&lines[start - 1]).trim_end();
        if prev.ends_with(';') || prev.ends_with('{') || prev.ends_with('}') {
            break;
        }
        start -= 1;
    }
    start
}

#[test]
fn test_expose_only_at_request_build_sites() {
    let mut violations = Vec::new();

    for file in production_sources() {
        let path = file.unix_path();
        let allowed = EXPOSE_ALLOWED.iter().any(|f| path.ends_with(f));

        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if !code.contains(".expose()") {
                continue;
            }
            if !allowed {
                violations.push(format!("{path}:{} - expose() outside providers", idx + 1));
                continue;
            }
            let start = statement_start(&file.lines, idx);
            if window_contains(&file.lines, start, idx + 1, LOG_MACROS) {
                violations.push(format!("{path}:{} - expose() inside a macro", idx + 1));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "\nCredential exposure violations:\n  {}\n",
        violations.join("\n  ")
    );
}

#[test]
fn test_credential_type_is_not_serializable_or_displayable() {
    let credentials = production_sources()
        .into_iter()
        .find(|f| f.unix_path().ends_with("conductor/core/src/credentials.rs"))
        .expect("credentials.rs exists");

    let source = credentials.lines.join("\n");
    let decl = source
        .find("pub struct ProviderCredential")
        .expect("ProviderCredential declared");
    let derive_start = source[..decl].rfind("#[derive(").unwrap_or(decl);
    let derives = &source[derive_start..decl];

    assert!(!derives.contains("Debug"), "Debug must be hand-written and redacted");
    assert!(!derives.contains("Serialize"), "credentials are never serialized");
    assert!(
        !source.contains("impl fmt::Display for ProviderCredential"),
        "credentials have no Display"
    );
    assert!(source.contains("<redacted>"));
}

#[test]
fn test_no_credential_fields_in_persisted_types() {
    let mut violations = Vec::new();

    for file in production_sources() {
        let path = file.unix_path();
        if !(path.ends_with("model.rs") || path.contains("/store/") || path.ends_with("messages.rs"))
        {
            continue;
        }
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains("ProviderCredential") || code.contains("api_key") {
                violations.push(format!("{path}:{} - {}", idx + 1, line.trim()));
            }
        }
    }

    assert!(
        violations.is_empty(),
        "persisted or wire types reference credentials: {violations:?}"
    );
}
