//! Scoped agent context — filter shared state by a reader's declared scope.
//!
//! Agents with a `context_scope` set only see entries tagged with a matching
//! scope. No declared scope means "sees everything" (backward compatible
//! with an agent that never opts into scoping).

/// Closed set of recognized scope tags. A tag outside this set is not an
/// error — it simply never matches anything, per the "unknown scope sees
/// nothing extra" error-handling policy.
pub const SCOPE_TAGS: &[&str] = &[
    "financial",
    "operational",
    "market",
    "technical",
    "hr",
    "strategic",
    "all",
];

/// Infer a scope from an agent's name when no explicit `context_scope` is
/// set (e.g. `"CFO"` implies `"financial"`).
pub fn infer_scope_from_name(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    const NAME_SCOPE_MAP: &[(&str, &str)] = &[
        ("financial", "financial"),
        ("cfo", "financial"),
        ("revenue", "financial"),
        ("cro", "financial"),
        ("technology", "technical"),
        ("cto", "technical"),
        ("marketing", "market"),
        ("cmo", "market"),
        ("operations", "operational"),
        ("coo", "operational"),
    ];
    for (keyword, scope) in NAME_SCOPE_MAP {
        if lower.contains(keyword) {
            return scope;
        }
    }
    "all"
}

/// Returns true when a reader whose scopes are `reader_scopes` is allowed to
/// see an entry tagged `entry_scope`, written by `author`.
///
/// - No declared reader scopes: sees everything.
/// - Reader scopes containing `"all"`: sees everything.
/// - Entry tagged `"all"` or matching one of the reader's scopes: visible.
/// - Author is `"system"`: always visible, regardless of scope.
pub fn is_visible(reader_scopes: Option<&[String]>, entry_scope: &str, author: &str) -> bool {
    if author == "system" {
        return true;
    }
    let scopes = match reader_scopes {
        None => return true,
        Some(s) if s.is_empty() => return true,
        Some(s) => s,
    };
    if scopes.iter().any(|s| s == "all") {
        return true;
    }
    entry_scope == "all" || scopes.iter().any(|s| s == entry_scope)
}
