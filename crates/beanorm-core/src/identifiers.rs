//! SQL identifier quoting.

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// ```
/// use beanorm_core::quote_ident;
///
/// assert_eq!(quote_ident("orders"), "\"orders\"");
/// assert_eq!(quote_ident("order\"s"), "\"order\"\"s\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Reverse [`quote_ident`]. Unquoted input is returned unchanged.
pub fn unquote_ident(quoted: &str) -> String {
    match quoted
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => quoted.to_string(),
    }
}
