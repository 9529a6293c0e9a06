//! Response body rewriting for path-prefixed serving
//!
//! The public URL is `<server>/<clientId>/...`, not a distinct origin per
//! client, so root-relative references emitted by the local service would
//! resolve against the relay's root. Eligible textual bodies get those
//! references prefixed with the client id. This is best-effort text
//! substitution, not a markup or script parse.

use bytes::Bytes;
use regex_lite::Regex;
use std::sync::OnceLock;

/// Content types eligible for rewriting (substring match)
const REWRITABLE_TYPES: &[&str] = &[
    "text/html",
    "text/javascript",
    "application/javascript",
    "text/css",
];

/// Whether a response content type is eligible for rewriting
pub fn needs_rewrite(content_type: &str) -> bool {
    REWRITABLE_TYPES
        .iter()
        .any(|kind| content_type.contains(kind))
}

/// Rewrite rules, one per reference form.
///
/// Each matches a single leading slash not followed by a second slash;
/// a second slash would be a protocol-relative URL and is left alone.
/// `{id}` in the replacement marks the client id insertion point.
fn rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            // src="/app.js", href="/style.css", action="/submit"
            (
                r#"\b(src|href|action)="/((?:[^/"][^"]*)?)""#,
                r#"${1}="/{id}/${2}""#,
            ),
            (
                r#"\b(src|href|action)='/((?:[^/'][^']*)?)'"#,
                r#"${1}='/{id}/${2}'"#,
            ),
            // url("/img/a.png"), url('/img/a.png')
            (r#"url\("/((?:[^/"][^"]*)?)"\)"#, r#"url("/{id}/${1}")"#),
            (r#"url\('/((?:[^/'][^']*)?)'\)"#, r#"url('/{id}/${1}')"#),
            // import "/mod.js", from "/mod.js"
            (
                r#"\b(import|from)(\s+)"/((?:[^/"][^"]*)?)""#,
                r#"${1}${2}"/{id}/${3}""#,
            ),
            (
                r#"\b(import|from)(\s+)'/((?:[^/'][^']*)?)'"#,
                r#"${1}${2}'/{id}/${3}'"#,
            ),
            // import("/mod.js")
            (
                r#"\bimport\(\s*"/((?:[^/"][^"]*)?)""#,
                r#"import("/{id}/${1}""#,
            ),
            (
                r#"\bimport\(\s*'/((?:[^/'][^']*)?)'"#,
                r#"import('/{id}/${1}'"#,
            ),
            // "key":"/path" in inlined JSON
            (r#"":"/((?:[^/"][^"]*)?)""#, r#"":"/{id}/${1}""#),
        ]
        .iter()
        .map(|(pattern, replacement)| {
            (
                Regex::new(pattern).expect("valid rewrite pattern"),
                *replacement,
            )
        })
        .collect()
    })
}

/// Rewrite root-relative references in one response body.
///
/// Bodies that are not valid UTF-8 pass through untouched; the caller
/// recomputes `content-length` from whatever comes back.
pub fn rewrite_body(body: Bytes, client_id: &str) -> Bytes {
    let Ok(text) = std::str::from_utf8(&body) else {
        return body;
    };

    let mut rewritten = text.to_string();
    for (pattern, template) in rules() {
        let replacement = template.replace("{id}", client_id);
        rewritten = pattern
            .replace_all(&rewritten, replacement.as_str())
            .into_owned();
    }

    Bytes::from(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(body: &str) -> String {
        let out = rewrite_body(Bytes::copy_from_slice(body.as_bytes()), "abc123");
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_needs_rewrite_matching_types() {
        assert!(needs_rewrite("text/html; charset=utf-8"));
        assert!(needs_rewrite("text/javascript"));
        assert!(needs_rewrite("application/javascript"));
        assert!(needs_rewrite("text/css"));
        assert!(!needs_rewrite("application/json"));
        assert!(!needs_rewrite("image/png"));
    }

    #[test]
    fn test_attribute_references() {
        assert_eq!(
            rewrite(r#"<script src="/app.js"></script>"#),
            r#"<script src="/abc123/app.js"></script>"#
        );
        assert_eq!(
            rewrite(r#"<a href="/docs/page">x</a>"#),
            r#"<a href="/abc123/docs/page">x</a>"#
        );
        assert_eq!(
            rewrite(r#"<form action="/submit">"#),
            r#"<form action="/abc123/submit">"#
        );
        assert_eq!(rewrite(r#"<a href='/x'>"#), r#"<a href='/abc123/x'>"#);
    }

    #[test]
    fn test_root_reference() {
        assert_eq!(rewrite(r#"<a href="/">home</a>"#), r#"<a href="/abc123/">home</a>"#);
    }

    #[test]
    fn test_protocol_relative_untouched() {
        let body = r#"<script src="//cdn.example.com/lib.js"></script>"#;
        assert_eq!(rewrite(body), body);
    }

    #[test]
    fn test_stylesheet_urls() {
        assert_eq!(
            rewrite(r#"body { background: url("/img/a.png"); }"#),
            r#"body { background: url("/abc123/img/a.png"); }"#
        );
        assert_eq!(
            rewrite(r#"body { background: url('/img/a.png'); }"#),
            r#"body { background: url('/abc123/img/a.png'); }"#
        );
        let protocol_relative = r#"url("//cdn.example.com/a.png")"#;
        assert_eq!(rewrite(protocol_relative), protocol_relative);
    }

    #[test]
    fn test_module_specifiers() {
        assert_eq!(
            rewrite(r#"import "/mod.js";"#),
            r#"import "/abc123/mod.js";"#
        );
        assert_eq!(
            rewrite(r#"import { x } from "/lib/util.js";"#),
            r#"import { x } from "/abc123/lib/util.js";"#
        );
        assert_eq!(
            rewrite(r#"const m = await import("/dyn.js");"#),
            r#"const m = await import("/abc123/dyn.js");"#
        );
    }

    #[test]
    fn test_json_string_paths() {
        assert_eq!(
            rewrite(r#"{"endpoint":"/api/v1"}"#),
            r#"{"endpoint":"/abc123/api/v1"}"#
        );
    }

    #[test]
    fn test_absolute_urls_untouched() {
        let body = r#"<a href="https://example.com/x">x</a>"#;
        assert_eq!(rewrite(body), body);
    }

    #[test]
    fn test_non_utf8_body_passes_through() {
        let body = Bytes::from_static(&[0xff, 0xfe, 0x00, 0x80]);
        assert_eq!(rewrite_body(body.clone(), "abc123"), body);
    }
}
