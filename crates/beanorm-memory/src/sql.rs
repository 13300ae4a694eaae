//! Parsing of the SQL subset the statement generator emits.
//!
//! Supported forms:
//!
//! ```text
//! SELECT "a", "b" | COUNT(*) FROM "t" [WHERE cond] [ORDER BY "a" ASC|DESC, ...] [LIMIT n] [OFFSET n]
//! INSERT INTO "t" ("a", "b") VALUES ($1, $2) | INSERT INTO "t" DEFAULT VALUES
//! UPDATE "t" SET "a" = $1, "b" = $2 WHERE cond
//! DELETE FROM "t" [WHERE cond]
//! ```
//!
//! where `cond` is an AND of `"c" op $n`, `"c" IN ($n, ...)`, `"c" IS [NOT] NULL`
//! and parenthesised OR-groups of such conjunctions.

use beanorm_core::{Error, QueryErrorKind, Result, Value, unquote_ident};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Comparison operator of a WHERE term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CmpOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" => CmpOp::Eq,
            "<>" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            "LIKE" => CmpOp::Like,
            _ => return None,
        })
    }
}

/// One WHERE term. Binds are zero-based positions into the statement's binds.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Compare { column: String, op: CmpOp, bind: usize },
    In { column: String, binds: Vec<usize> },
    IsNull { column: String, negated: bool },
    AnyOf(Vec<Vec<Term>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Count,
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub column: String,
    pub descending: bool,
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Select {
        table: String,
        projection: Projection,
        filter: Vec<Term>,
        order: Vec<OrderTerm>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        binds: Vec<usize>,
    },
    Update {
        table: String,
        sets: Vec<(String, usize)>,
        filter: Vec<Term>,
    },
    Delete {
        table: String,
        filter: Vec<Term>,
    },
}

impl Command {
    pub fn table(&self) -> &str {
        match self {
            Command::Select { table, .. }
            | Command::Insert { table, .. }
            | Command::Update { table, .. }
            | Command::Delete { table, .. } => table,
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Command::Select { .. })
    }
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).unwrap_or_else(|e| panic!("bad pattern: {e}")))
        }
    };
}

static_regex!(
    select_re,
    r#"(?s)^SELECT (?P<cols>.+?) FROM (?P<table>"(?:[^"]|"")+")(?: WHERE (?P<where>.+?))?(?: ORDER BY (?P<order>.+?))?(?: LIMIT (?P<limit>\d+))?(?: OFFSET (?P<offset>\d+))?$"#
);
static_regex!(
    insert_re,
    r#"^INSERT INTO (?P<table>"(?:[^"]|"")+")(?: \((?P<cols>[^)]*)\) VALUES \((?P<vals>[^)]*)\)| DEFAULT VALUES)$"#
);
static_regex!(
    update_re,
    r#"(?s)^UPDATE (?P<table>"(?:[^"]|"")+") SET (?P<sets>.+?) WHERE (?P<where>.+)$"#
);
static_regex!(
    delete_re,
    r#"(?s)^DELETE FROM (?P<table>"(?:[^"]|"")+")(?: WHERE (?P<where>.+))?$"#
);
static_regex!(ident_re, r#""((?:[^"]|"")+)""#);
static_regex!(bind_re, r"\$(\d+)");
static_regex!(
    compare_re,
    r#"^(?P<col>"(?:[^"]|"")+") (?P<op>=|<>|<=|>=|<|>|LIKE) \$(?P<n>\d+)$"#
);
static_regex!(in_re, r#"^(?P<col>"(?:[^"]|"")+") IN \((?P<marks>[^)]*)\)$"#);
static_regex!(null_re, r#"^(?P<col>"(?:[^"]|"")+") IS (?P<not>NOT )?NULL$"#);
static_regex!(set_re, r#"^(?P<col>"(?:[^"]|"")+") = \$(?P<n>\d+)$"#);
static_regex!(order_re, r#"^(?P<col>"(?:[^"]|"")+")(?: (?P<dir>ASC|DESC))?$"#);

fn syntax(sql: &str, message: impl Into<String>) -> Error {
    Error::store(QueryErrorKind::Syntax, sql, message)
}

fn idents(list: &str) -> Vec<String> {
    ident_re()
        .captures_iter(list)
        .map(|c| unquote_ident(&c[0]))
        .collect()
}

fn bind_positions(sql: &str, list: &str) -> Result<Vec<usize>> {
    bind_re()
        .captures_iter(list)
        .map(|c| bind_index(sql, &c[1]))
        .collect()
}

fn bind_index(sql: &str, digits: &str) -> Result<usize> {
    match digits.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(syntax(sql, format!("bad placeholder ${digits}"))),
    }
}

/// Split on `sep` outside parentheses and quoted identifiers.
fn split_top<'s>(input: &'s str, sep: &str) -> Vec<&'s str> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => quoted = !quoted,
            b'(' if !quoted => depth += 1,
            b')' if !quoted => depth = depth.saturating_sub(1),
            _ if !quoted && depth == 0 && input[i..].starts_with(sep) => {
                parts.push(&input[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&input[start..]);
    parts
}

/// `(x)` to `x` when the outer parentheses enclose the whole input.
fn strip_parens(input: &str) -> Option<&str> {
    let inner = input.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i64;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

fn parse_conjunction(sql: &str, cond: &str) -> Result<Vec<Term>> {
    split_top(cond, " AND ")
        .into_iter()
        .map(|term| parse_term(sql, term.trim()))
        .collect()
}

fn parse_term(sql: &str, term: &str) -> Result<Term> {
    if let Some(inner) = strip_parens(term) {
        let groups = split_top(inner, " OR ")
            .into_iter()
            .map(|group| {
                let group = group.trim();
                parse_conjunction(sql, strip_parens(group).unwrap_or(group))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Term::AnyOf(groups));
    }
    if let Some(c) = compare_re().captures(term) {
        let op = CmpOp::parse(&c["op"]).ok_or_else(|| syntax(sql, format!("bad operator in {term}")))?;
        return Ok(Term::Compare {
            column: unquote_ident(&c["col"]),
            op,
            bind: bind_index(sql, &c["n"])?,
        });
    }
    if let Some(c) = in_re().captures(term) {
        return Ok(Term::In {
            column: unquote_ident(&c["col"]),
            binds: bind_positions(sql, &c["marks"])?,
        });
    }
    if let Some(c) = null_re().captures(term) {
        return Ok(Term::IsNull {
            column: unquote_ident(&c["col"]),
            negated: c.name("not").is_some(),
        });
    }
    Err(syntax(sql, format!("unsupported WHERE term: {term}")))
}

fn parse_filter(sql: &str, cond: Option<regex::Match<'_>>) -> Result<Vec<Term>> {
    cond.map_or_else(|| Ok(Vec::new()), |m| parse_conjunction(sql, m.as_str()))
}

fn parse_limit(sql: &str, m: Option<regex::Match<'_>>) -> Result<Option<usize>> {
    m.map(|m| {
        m.as_str()
            .parse::<usize>()
            .map_err(|e| syntax(sql, e.to_string()))
    })
    .transpose()
}

/// Parse one statement.
pub fn parse(sql: &str) -> Result<Command> {
    let sql = sql.trim();
    if let Some(c) = select_re().captures(sql) {
        let cols = c["cols"].trim();
        let projection = if cols == "COUNT(*)" {
            Projection::Count
        } else {
            Projection::Columns(idents(cols))
        };
        let order = match c.name("order") {
            None => Vec::new(),
            Some(m) => split_top(m.as_str(), ", ")
                .into_iter()
                .map(|term| {
                    let o = order_re()
                        .captures(term.trim())
                        .ok_or_else(|| syntax(sql, format!("bad ORDER BY term: {term}")))?;
                    Ok(OrderTerm {
                        column: unquote_ident(&o["col"]),
                        descending: o.name("dir").is_some_and(|d| d.as_str() == "DESC"),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        return Ok(Command::Select {
            table: unquote_ident(&c["table"]),
            projection,
            filter: parse_filter(sql, c.name("where"))?,
            order,
            limit: parse_limit(sql, c.name("limit"))?,
            offset: parse_limit(sql, c.name("offset"))?,
        });
    }
    if let Some(c) = insert_re().captures(sql) {
        let columns = c.name("cols").map(|m| idents(m.as_str())).unwrap_or_default();
        let binds = match c.name("vals") {
            Some(m) => bind_positions(sql, m.as_str())?,
            None => Vec::new(),
        };
        if columns.len() != binds.len() {
            return Err(syntax(sql, "column and value counts differ"));
        }
        return Ok(Command::Insert {
            table: unquote_ident(&c["table"]),
            columns,
            binds,
        });
    }
    if let Some(c) = update_re().captures(sql) {
        let sets = split_top(&c["sets"], ", ")
            .into_iter()
            .map(|set| {
                let s = set_re()
                    .captures(set.trim())
                    .ok_or_else(|| syntax(sql, format!("bad SET term: {set}")))?;
                Ok((unquote_ident(&s["col"]), bind_index(sql, &s["n"])?))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(Command::Update {
            table: unquote_ident(&c["table"]),
            sets,
            filter: parse_filter(sql, c.name("where"))?,
        });
    }
    if let Some(c) = delete_re().captures(sql) {
        return Ok(Command::Delete {
            table: unquote_ident(&c["table"]),
            filter: parse_filter(sql, c.name("where"))?,
        });
    }
    Err(syntax(sql, "unsupported statement"))
}

fn like_regex(pattern: &str) -> Result<Regex> {
    static CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(re) = cache
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(pattern)
    {
        return Ok(re.clone());
    }
    let mut source = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            c => source.push_str(&regex::escape(&c.to_string())),
        }
    }
    source.push('$');
    let re = Regex::new(&source).map_err(|e| Error::Custom(format!("bad LIKE pattern: {e}")))?;
    cache
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn bind<'b>(binds: &'b [Value], index: usize) -> Result<&'b Value> {
    binds
        .get(index)
        .ok_or_else(|| Error::Custom(format!("missing bind ${}", index + 1)))
}

/// Ordering used by ORDER BY: NULL first, incomparable values equal.
pub fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Evaluate a conjunction against one row. `column` reads a column by name.
pub fn eval(terms: &[Term], column: &dyn Fn(&str) -> Value, binds: &[Value]) -> Result<bool> {
    for term in terms {
        if !eval_term(term, column, binds)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_term(term: &Term, column: &dyn Fn(&str) -> Value, binds: &[Value]) -> Result<bool> {
    Ok(match term {
        Term::Compare { column: name, op, bind: index } => {
            let left = column(name);
            let right = bind(binds, *index)?;
            if left.is_null() || right.is_null() {
                return Ok(false);
            }
            match op {
                CmpOp::Eq => left.key_eq(right),
                CmpOp::Ne => !left.key_eq(right),
                CmpOp::Like => match (left.as_str(), right.as_str()) {
                    (Some(text), Some(pattern)) => like_regex(pattern)?.is_match(text),
                    _ => false,
                },
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match left.compare(right) {
                    Some(ordering) => match op {
                        CmpOp::Lt => ordering == Ordering::Less,
                        CmpOp::Le => ordering != Ordering::Greater,
                        CmpOp::Gt => ordering == Ordering::Greater,
                        _ => ordering != Ordering::Less,
                    },
                    None => false,
                },
            }
        }
        Term::In { column: name, binds: indexes } => {
            let left = column(name);
            if left.is_null() {
                return Ok(false);
            }
            for &i in indexes {
                if left.key_eq(bind(binds, i)?) {
                    return Ok(true);
                }
            }
            false
        }
        Term::IsNull { column: name, negated } => column(name).is_null() != *negated,
        Term::AnyOf(groups) => {
            for group in groups {
                if eval(group, column, binds)? {
                    return Ok(true);
                }
            }
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select() {
        let cmd = parse(
            "SELECT \"id\", \"status\" FROM \"orders\" WHERE \"status\" = $1 AND \"total\" > $2 \
             ORDER BY \"id\" DESC LIMIT 10 OFFSET 20",
        )
        .unwrap();
        match cmd {
            Command::Select {
                table,
                projection,
                filter,
                order,
                limit,
                offset,
            } => {
                assert_eq!(table, "orders");
                assert_eq!(
                    projection,
                    Projection::Columns(vec!["id".to_string(), "status".to_string()])
                );
                assert_eq!(filter.len(), 2);
                assert_eq!(
                    filter[1],
                    Term::Compare {
                        column: "total".to_string(),
                        op: CmpOp::Gt,
                        bind: 1
                    }
                );
                assert!(order[0].descending);
                assert_eq!((limit, offset), (Some(10), Some(20)));
            }
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_composite_id_batch() {
        let cmd = parse(
            "SELECT COUNT(*) FROM \"lines\" WHERE ((\"a\" = $1 AND \"b\" = $2) OR (\"a\" = $3 AND \"b\" = $4))",
        )
        .unwrap();
        let Command::Select { projection, filter, .. } = cmd else {
            panic!("expected select");
        };
        assert_eq!(projection, Projection::Count);
        match &filter[0] {
            Term::AnyOf(groups) => {
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[1].len(), 2);
            }
            other => panic!("expected OR groups, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_dml() {
        assert_eq!(
            parse("INSERT INTO \"orders\" (\"status\", \"version\") VALUES ($1, $2)").unwrap(),
            Command::Insert {
                table: "orders".to_string(),
                columns: vec!["status".to_string(), "version".to_string()],
                binds: vec![0, 1],
            }
        );
        let update = parse(
            "UPDATE \"orders\" SET \"status\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4",
        )
        .unwrap();
        let Command::Update { sets, filter, .. } = update else {
            panic!("expected update");
        };
        assert_eq!(sets, vec![("status".to_string(), 0), ("version".to_string(), 1)]);
        assert_eq!(filter.len(), 2);
        assert!(matches!(
            parse("DELETE FROM \"orders\" WHERE \"id\" = $1").unwrap(),
            Command::Delete { .. }
        ));
        assert!(parse("DROP TABLE \"orders\"").is_err());
    }

    #[test]
    fn test_eval_terms() {
        let row = |name: &str| match name {
            "status" => Value::from("OPEN"),
            "qty" => Value::Int(3),
            _ => Value::Null,
        };
        let binds = vec![Value::from("OP%"), Value::BigInt(2), Value::BigInt(3)];
        let like = parse_conjunction("", "\"status\" LIKE $1").unwrap();
        assert!(eval(&like, &row, &binds).unwrap());
        let range = parse_conjunction("", "\"qty\" > $2 AND \"qty\" IN ($2, $3)").unwrap();
        assert!(eval(&range, &row, &binds).unwrap());
        let null = parse_conjunction("", "\"note\" IS NULL AND \"status\" IS NOT NULL").unwrap();
        assert!(eval(&null, &row, &binds).unwrap());
        let never = parse_conjunction("", "\"note\" IS NULL AND \"note\" IS NOT NULL").unwrap();
        assert!(!eval(&never, &row, &binds).unwrap());
    }
}
