//! Static analysis of sandbox code bodies.
//!
//! Before any code reaches the interpreter the planner needs to know which
//! provider stubs it imports and which functions it calls, so discovery
//! discipline can be enforced, and whether it smuggles in a top-level wrapper
//! that would break the fixed execution template.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Servers imported and functions called by a sandbox body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SandboxAnalysis {
    /// Providers imported from `sandbox_py.servers`
    pub used_servers: BTreeSet<String>,
    /// Function names called per server alias
    pub calls_by_server: BTreeMap<String, BTreeSet<String>>,
}

fn import_from_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*from\s+sandbox_py\.servers\s+import\s+(.+)$").expect("valid regex")
    })
}

fn import_module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*import\s+sandbox_py\.servers\.(\w+)").expect("valid regex")
    })
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\w+)\.(\w+)\s*\(").expect("valid regex"))
}

/// Wrappers the execution template already provides; user bodies must not
/// redefine them.
const FORBIDDEN_WRAPPERS: &[&str] = &[
    "async def main",
    "def main",
    "if __name__ ==",
    "asyncio.run(",
];

/// Detect forbidden top-level wrappers in a sandbox body.
pub fn find_forbidden_wrapper(code: &str) -> Option<&'static str> {
    FORBIDDEN_WRAPPERS
        .iter()
        .find(|wrapper| code.contains(*wrapper))
        .copied()
}

/// Lightweight syntax gate for sandbox bodies.
///
/// This is not a Python parser: it catches the failure modes the planner LLM
/// actually produces (unbalanced delimiters, escaped-newline one-liners) so
/// the syntax-error back-pressure rule can engage without spawning a process.
/// Genuine syntax errors still surface from the interpreter at run time.
pub fn check_syntax(code: &str) -> Result<()> {
    if code.trim().is_empty() {
        return Err(Error::Sandbox("sandbox code body is empty".to_string()));
    }
    // A body arriving as a single line with literal \n escapes was serialized
    // wrong by the model.
    if !code.contains('\n') && code.contains("\\n") {
        return Err(Error::Sandbox(
            "code contains literal \\n escapes; send real newlines".to_string(),
        ));
    }

    let mut stack: Vec<char> = Vec::new();
    let mut string_delim: Option<char> = None;
    let mut escaped = false;
    for ch in code.chars() {
        if let Some(delim) = string_delim {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == delim {
                string_delim = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => string_delim = Some(ch),
            '(' | '[' | '{' => stack.push(ch),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(expected) {
                    return Err(Error::Sandbox(format!("unbalanced '{}'", ch)));
                }
            }
            _ => {}
        }
    }
    if let Some(open) = stack.last() {
        return Err(Error::Sandbox(format!("unclosed '{}'", open)));
    }
    if string_delim.is_some() {
        return Err(Error::Sandbox("unterminated string literal".to_string()));
    }
    Ok(())
}

/// Extract imported servers and per-server function calls from a body.
pub fn analyze_sandbox(code: &str) -> Result<SandboxAnalysis> {
    check_syntax(code)?;

    let mut analysis = SandboxAnalysis::default();
    // Binding name (import alias) → real server name.
    let mut bindings: BTreeMap<String, String> = BTreeMap::new();

    for captures in import_from_re().captures_iter(code) {
        for name in captures[1].split(',') {
            let mut parts = name.trim().split_whitespace();
            let server = parts.next().unwrap_or_default();
            if server.is_empty() {
                continue;
            }
            let alias = match (parts.next(), parts.next()) {
                (Some("as"), Some(alias)) => alias,
                _ => server,
            };
            analysis.used_servers.insert(server.to_string());
            bindings.insert(alias.to_string(), server.to_string());
        }
    }
    for captures in import_module_re().captures_iter(code) {
        let server = captures[1].to_string();
        bindings.insert(server.clone(), server.clone());
        analysis.used_servers.insert(server);
    }

    for captures in call_re().captures_iter(code) {
        let receiver = &captures[1];
        let function = captures[2].to_string();
        if let Some(server) = bindings.get(receiver) {
            analysis
                .calls_by_server
                .entry(server.clone())
                .or_default()
                .insert(function);
        }
    }

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_imports_and_calls() {
        let code = "\
from sandbox_py.servers import gmail, slack
results = await gmail.gmail_search(query='from:alice')
await slack.slack_post_message(channel='#general', text='done')
summary = helper.format(results)
";
        let analysis = analyze_sandbox(code).unwrap();
        assert!(analysis.used_servers.contains("gmail"));
        assert!(analysis.used_servers.contains("slack"));
        assert!(analysis.calls_by_server["gmail"].contains("gmail_search"));
        assert!(analysis.calls_by_server["slack"].contains("slack_post_message"));
        // Calls on receivers that are not imported servers are ignored.
        assert!(!analysis.calls_by_server.contains_key("helper"));
    }

    #[test]
    fn test_analyze_module_import_form() {
        let code = "import sandbox_py.servers.gmail\nresult = {}";
        let analysis = analyze_sandbox(code).unwrap();
        assert!(analysis.used_servers.contains("gmail"));
    }

    #[test]
    fn test_analyze_import_alias() {
        let code = "from sandbox_py.servers import gmail as g\nawait g.gmail_search(query='x')";
        let analysis = analyze_sandbox(code).unwrap();
        assert!(analysis.used_servers.contains("gmail"));
        assert!(analysis.calls_by_server["gmail"].contains("gmail_search"));
    }

    #[test]
    fn test_forbidden_wrappers() {
        assert_eq!(
            find_forbidden_wrapper("async def main():\n    pass"),
            Some("async def main")
        );
        assert_eq!(
            find_forbidden_wrapper("if __name__ == '__main__':\n    run()"),
            Some("if __name__ ==")
        );
        assert_eq!(
            find_forbidden_wrapper("asyncio.run(work())"),
            Some("asyncio.run(")
        );
        assert!(find_forbidden_wrapper("x = 1").is_none());
    }

    #[test]
    fn test_check_syntax_unbalanced() {
        assert!(check_syntax("x = (1 + 2").is_err());
        assert!(check_syntax("x = [1, 2}").is_err());
        assert!(check_syntax("x = 'unterminated").is_err());
        assert!(check_syntax("x = sorted(set([3, 1, 4]))").is_ok());
    }

    #[test]
    fn test_check_syntax_literal_newlines() {
        assert!(check_syntax("x = 1\\ny = 2").is_err());
        assert!(check_syntax("x = 1\ny = 2").is_ok());
    }

    #[test]
    fn test_check_syntax_string_contents_ignored() {
        assert!(check_syntax("x = 'an ( unbalanced paren inside a string'").is_ok());
    }
}
