//! SQL text helpers: count rewriting, window detection, identifier quoting.

/// Tokens that make a query unsafe to rewrite as a plain `COUNT(*)`.
const COMPLEX_MARKERS: [&str; 8] = [
    "join", "group", "having", "distinct", "union", "intersect", "except", "with",
];

const AGGREGATES: [&str; 6] = ["count(", "sum(", "max(", "min(", "avg(", "array_agg("];

/// Query text without trailing semicolons and surrounding whitespace.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn tokens(sql: &str) -> Vec<String> {
    sql.split_whitespace().map(|t| t.to_ascii_lowercase()).collect()
}

/// True when the query already windows its own result.
pub fn has_window_clause(sql: &str) -> bool {
    tokens(sql)
        .iter()
        .any(|t| t == "limit" || t == "offset" || t == "fetch")
}

/// True when the query fixes its row order, which stable windows require.
pub fn has_order_clause(sql: &str) -> bool {
    let toks = tokens(sql);
    toks.windows(2).any(|w| w[0] == "order" && w[1] == "by")
}

/// Build a query counting the rows `sql` would return.
///
/// Simple `SELECT ... FROM table [WHERE ...] [ORDER BY ...]` queries are
/// rewritten to `SELECT COUNT(*) FROM table [WHERE ...]`; anything else is
/// wrapped in a count subquery.
pub fn count_query(sql: &str) -> String {
    let sql = strip_terminator(sql);
    match simple_count(sql) {
        Some(count) => count,
        None => format!("SELECT COUNT(*) FROM ({}) AS chunk_count", sql),
    }
}

fn simple_count(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let toks = tokens(sql);

    if toks.first().map(String::as_str) != Some("select") {
        return None;
    }
    if toks.iter().filter(|t| *t == "from").count() != 1 {
        return None;
    }
    if toks.iter().any(|t| COMPLEX_MARKERS.contains(&t.as_str())) {
        return None;
    }
    if lower.contains("(select") || lower.contains("( select") {
        return None;
    }
    if AGGREGATES.iter().any(|a| lower.replace(' ', "").contains(a)) {
        return None;
    }
    // A comma after FROM means an implicit join.
    let from_at = find_token(&lower, "from")?;
    let tail = &sql[from_at + "from".len()..];
    let tail_lower = tail.to_ascii_lowercase();
    let tail = match find_token(&tail_lower, "order") {
        Some(order_at) => &tail[..order_at],
        None => tail,
    };
    let table_part = match find_token(&tail.to_ascii_lowercase(), "where") {
        Some(where_at) => &tail[..where_at],
        None => tail,
    };
    if table_part.contains(',') {
        return None;
    }

    Some(format!("SELECT COUNT(*) FROM {}", tail.trim()))
}

/// Byte offset of `word` as a standalone token in lowercase `haystack`.
fn find_token(haystack: &str, word: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let at = start + pos;
        let before = at == 0 || bytes[at - 1].is_ascii_whitespace();
        let end = at + word.len();
        let after = end == bytes.len() || bytes[end].is_ascii_whitespace();
        if before && after {
            return Some(at);
        }
        start = at + word.len();
    }
    None
}

/// Append a LIMIT/OFFSET window to a query.
pub fn windowed(sql: &str, limit: u64, offset: u64) -> String {
    format!("{} LIMIT {} OFFSET {}", strip_terminator(sql), limit, offset)
}

/// True for plain lowercase SQL identifiers (letters, digits, underscore).
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select_is_rewritten() {
        assert_eq!(
            count_query("SELECT * FROM metadatavalue"),
            "SELECT COUNT(*) FROM metadatavalue"
        );
        assert_eq!(
            count_query("select item_id, withdrawn from item where in_archive = true order by item_id;"),
            "SELECT COUNT(*) FROM item where in_archive = true"
        );
    }

    #[test]
    fn test_complex_queries_are_wrapped() {
        for sql in [
            "SELECT a.x FROM a JOIN b ON a.id = b.id",
            "SELECT resource_id FROM metadatavalue GROUP BY resource_id",
            "SELECT COUNT(*) FROM item",
            "SELECT x FROM a UNION SELECT x FROM b",
            "SELECT DISTINCT item_id FROM collection2item",
            "SELECT * FROM a, b",
            "SELECT * FROM item WHERE owning_collection IN (SELECT collection_id FROM collection)",
        ] {
            let count = count_query(sql);
            assert!(
                count.starts_with("SELECT COUNT(*) FROM (") && count.ends_with(") AS chunk_count"),
                "{} -> {}",
                sql,
                count
            );
        }
    }

    #[test]
    fn test_window_detection() {
        assert!(has_window_clause("SELECT * FROM item LIMIT 10"));
        assert!(has_window_clause("select * from item offset 5"));
        assert!(has_window_clause("SELECT * FROM item FETCH FIRST 5 ROWS ONLY"));
        assert!(!has_window_clause("SELECT limited FROM item"));
    }

    #[test]
    fn test_order_detection() {
        assert!(has_order_clause("SELECT uuid FROM eperson ORDER BY uuid"));
        assert!(has_order_clause("select * from item order  by item_id;"));
        assert!(!has_order_clause("SELECT item_id FROM versionitem"));
        assert!(!has_order_clause("SELECT \"order\" FROM by_table"));
    }

    #[test]
    fn test_windowed_strips_terminator() {
        assert_eq!(
            windowed("SELECT * FROM item;", 50, 100),
            "SELECT * FROM item LIMIT 50 OFFSET 100"
        );
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("versionitem_seq"));
        assert!(!is_identifier("seq; drop table item"));
        assert!(!is_identifier("Item"));
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
