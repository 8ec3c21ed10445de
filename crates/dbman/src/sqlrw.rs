//! SQL whitelist classifier and table rewriter.
//!
//! Only a small statement subset is accepted: select, insert, replace,
//! update, delete, desc/describe, and explain select. Updates and deletes
//! must carry a WHERE clause. The table identifier is located by its
//! grammar position and, when it names the logical kind, rewritten to the
//! sharded physical table.

#[derive(Debug, thiserror::Error)]
#[error("not allowed SQL: {0}")]
pub struct NotAllowed(pub String);

/// A classified statement: the trimmed text and the located table
/// identifier span within it.
#[derive(Debug)]
pub struct SqlStatement<'a> {
    sql: &'a str,
    table: Option<(usize, usize)>,
}

impl<'a> SqlStatement<'a> {
    pub fn sql(&self) -> &'a str {
        self.sql
    }

    pub fn table_name(&self) -> Option<&'a str> {
        self.table.map(|(start, end)| &self.sql[start..end])
    }

    /// Whether this statement may mutate: anything but a leading select.
    pub fn may_write(&self) -> bool {
        !starts_with_word(self.sql, "select")
    }

    /// When the table identifier equals `kind`, rebuild the statement
    /// against `prefix_<table_no>` (or just `prefix` for unsharded
    /// kinds). An empty prefix falls back to the kind name itself.
    pub fn rewrite(&self, kind: &str, prefix: &str, table_num: i64, table_no: i64) -> Option<String> {
        let (start, end) = self.table?;
        if !self.sql[start..end].eq_ignore_ascii_case(kind) {
            return None;
        }

        let mut out = String::with_capacity(self.sql.len() + prefix.len() + 8);
        out.push_str(&self.sql[..start]);
        if prefix.is_empty() {
            out.push_str(kind);
        } else {
            out.push_str(prefix);
        }
        if table_num > 1 {
            out.push('_');
            out.push_str(&table_no.to_string());
        }
        out.push_str(&self.sql[end..]);
        Some(out)
    }
}

/// Euclidean remainder: always in `[0, n)` for any signed hint.
pub fn floored_mod(hint: i64, n: i64) -> i64 {
    hint.rem_euclid(n)
}

/// Classify one statement, locating its table identifier. Returns an
/// error for statements outside the accepted subset.
pub fn parse(sql: &str) -> Result<SqlStatement<'_>, NotAllowed> {
    let sql = sql.trim();
    let first = sql
        .as_bytes()
        .first()
        .map(u8::to_ascii_lowercase)
        .unwrap_or(0);

    let (allowed, table) = match first {
        b'd' => {
            if starts_with_word(sql, "delete") {
                let table = find_table_name(sql, "delete".len(), "from");
                let allowed = match table {
                    Some((_, end)) => seek_after(sql, end, "where").is_some(),
                    None => false,
                };
                (allowed, table)
            } else if starts_with_word(sql, "desc") {
                (true, find_table_name(sql, 0, "desc"))
            } else if starts_with_word(sql, "describe") {
                (true, find_table_name(sql, 0, "describe"))
            } else {
                (false, None)
            }
        }
        b'e' => {
            if starts_with_word(sql, "explain select") {
                (true, find_table_name(sql, "explain select".len(), "from"))
            } else {
                (false, None)
            }
        }
        b'i' => {
            if starts_with_word(sql, "insert") {
                (true, find_table_name(sql, "insert".len(), "into"))
            } else {
                (false, None)
            }
        }
        b'r' => {
            if starts_with_word(sql, "replace") {
                (true, find_table_name(sql, "replace".len(), "into"))
            } else {
                (false, None)
            }
        }
        b's' => {
            if starts_with_word(sql, "select") {
                (true, find_table_name(sql, "select".len(), "from"))
            } else {
                (false, None)
            }
        }
        b'u' => {
            if starts_with_word(sql, "update") {
                let table = find_table_name(sql, 0, "update");
                let allowed = match table {
                    Some((_, end)) => seek_after(sql, end, "where").is_some(),
                    None => false,
                };
                (allowed, table)
            } else {
                (false, None)
            }
        }
        _ => (false, None),
    };

    if !allowed {
        return Err(NotAllowed(sql.to_string()));
    }
    Ok(SqlStatement { sql, table })
}

// `desc` must not match `describe`: the word needs a following space.
fn starts_with_word(sql: &str, word: &str) -> bool {
    sql.len() > word.len()
        && sql[..word.len()].eq_ignore_ascii_case(word)
        && sql.as_bytes()[word.len()].is_ascii_whitespace()
}

fn case_find(haystack: &str, start: usize, needle: &str) -> Option<usize> {
    if start > haystack.len() {
        return None;
    }
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    (start..haystack.len().checked_sub(needle.len())? + 1)
        .find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Find the keyword `after` as a standalone word at or beyond `start`,
/// skipping matches embedded in identifiers, and return the position of
/// the first non-space byte after it.
fn seek_after(sql: &str, start: usize, after: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut t = case_find(sql, start, after)?;
    loop {
        let mut n = t + after.len();
        let at_word_start = t == 0 || bytes[t - 1].is_ascii_whitespace();
        let at_word_end = n < bytes.len() && bytes[n].is_ascii_whitespace();
        if at_word_start && at_word_end {
            n += 1;
            while n < bytes.len() && bytes[n].is_ascii_whitespace() {
                n += 1;
            }
            return Some(n);
        }
        // Inside an identifier: skip to the end of this word and retry.
        while n < bytes.len() && !bytes[n].is_ascii_whitespace() {
            n += 1;
        }
        t = case_find(sql, n, after)?;
    }
}

/// Locate the table identifier after the keyword `after`: either a bare
/// name starting with a letter (ending at whitespace or `(`), or a
/// backtick-quoted name. Returns the identifier's span, excluding quotes.
fn find_table_name(sql: &str, pos: usize, after: &str) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut t = seek_after(sql, pos, after)?;
    loop {
        if t < bytes.len() && bytes[t].is_ascii_alphabetic() {
            let mut end = t + 1;
            while end < bytes.len() && !bytes[end].is_ascii_whitespace() && bytes[end] != b'(' {
                end += 1;
            }
            return Some((t, end));
        }
        if t < bytes.len() && bytes[t] == b'`' {
            let start = t + 1;
            if let Some(close) = sql[start..].find('`') {
                return Some((start, start + close));
            }
        }
        t = seek_after(sql, t, after)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_whitelisted_verbs() {
        for sql in [
            "select id from user where id=?",
            "insert into user(a,b) values(1,2)",
            "replace into user(a,b) values(1,2)",
            "update user set a=1 where id=3",
            "delete from user where id=3",
            "desc user",
            "describe user",
            "explain select * from user",
        ] {
            let st = parse(sql).unwrap();
            assert_eq!(st.table_name(), Some("user"), "{sql}");
        }
    }

    #[test]
    fn rejects_everything_else() {
        for sql in [
            "drop table user",
            "truncate user",
            "update user set a=1",          // no WHERE
            "delete from user",             // no WHERE
            "grant all on *.* to 'x'",
            "",
        ] {
            assert!(parse(sql).is_err(), "{sql}");
        }
    }

    #[test]
    fn classification_is_stable_under_case_and_whitespace() {
        for sql in [
            "SELECT id FROM user WHERE id=?",
            "  select id from user where id=?  ",
            "\tSeLeCt id FrOm user where id=?",
        ] {
            let st = parse(sql).unwrap();
            assert_eq!(st.table_name(), Some("user"));
            assert!(!st.may_write());
        }
    }

    #[test]
    fn backticked_and_mixed_case_names() {
        let st = parse("select * FROM `user` where id=1").unwrap();
        assert_eq!(st.table_name(), Some("user"));

        // A column named "from_x" must not trip the FROM search.
        let st = parse("select afromb from user where id=1").unwrap();
        assert_eq!(st.table_name(), Some("user"));
    }

    #[test]
    fn select_without_from_is_allowed() {
        let st = parse("select 1").unwrap();
        assert_eq!(st.table_name(), None);
    }

    #[test]
    fn may_write_is_leading_keyword_only() {
        assert!(!parse("select id from user where 1").unwrap().may_write());
        assert!(parse("insert into user(a) values(1)").unwrap().may_write());
        assert!(parse("update user set a=1 where 1").unwrap().may_write());
        assert!(parse("desc user").unwrap().may_write());
    }

    #[test]
    fn rewrite_substitutes_the_shard_table() {
        let st = parse("select id from user where id=?").unwrap();
        let out = st.rewrite("user", "u", 16, floored_mod(97, 16)).unwrap();
        assert_eq!(out, "select id from u_1 where id=?");

        // Unsharded kind: no suffix.
        let out = st.rewrite("user", "u", 1, 0).unwrap();
        assert_eq!(out, "select id from u where id=?");

        // Empty prefix falls back to the kind name.
        let out = st.rewrite("user", "", 4, 3).unwrap();
        assert_eq!(out, "select id from user_3 where id=?");

        // A different table leaves the statement alone.
        assert!(st.rewrite("account", "a", 4, 0).is_none());
    }

    #[test]
    fn rewrite_handles_backticks_and_case() {
        let st = parse("select * FROM `user` where id=1").unwrap();
        let out = st.rewrite("USER", "u", 16, 1).unwrap();
        assert_eq!(out, "select * FROM `u_1` where id=1");

        let st = parse("UPDATE user SET a=1 WHERE id=2").unwrap();
        let out = st.rewrite("user", "", 8, 5).unwrap();
        assert_eq!(out, "UPDATE user_5 SET a=1 WHERE id=2");
    }

    #[test]
    fn floored_mod_stays_in_range() {
        for hint in [-97i64, -16, -1, 0, 1, 15, 16, 97, i64::MAX, i64::MIN] {
            for n in [1i64, 2, 16, 31] {
                let m = floored_mod(hint, n);
                assert!((0..n).contains(&m), "hint={hint} n={n} m={m}");
            }
        }
        assert_eq!(floored_mod(97, 16), 1);
        assert_eq!(floored_mod(-1, 16), 15);
    }
}
