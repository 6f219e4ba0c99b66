//! `.env` file parsing.
//!
//! One `KEY=VALUE` assignment per line. Blank lines and lines starting
//! with `#` are skipped, an optional `export ` prefix is accepted.
//! Values may be single-quoted (literal), double-quoted (with `\n`, `\t`,
//! `\\`, and `\"` escapes), or bare, in which case they are trimmed and
//! lose any ` #` trailing comment. Values are never interpolated.

use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_while},
    character::complete::{char, satisfy, space0, space1},
    combinator::{opt, recognize},
    sequence::{pair, terminated},
};
use stackseq_common::error::{Result, StackError};

const fn is_key_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_key_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Parses `[export ]KEY =` and returns the key.
fn assignment(input: &str) -> IResult<&str, &str> {
    let (input, _) = opt(terminated(tag("export"), space1)).parse(input)?;
    let (input, key) =
        recognize(pair(satisfy(is_key_start), take_while(is_key_continue))).parse(input)?;
    let (input, _) = (space0, char('='), space0).parse(input)?;
    Ok((input, key))
}

/// Reads a quoted value starting at `input[0]`, returning it and the
/// remainder after the closing quote.
fn quoted(input: &str, quote: char) -> Option<(String, &str)> {
    let body = input.strip_prefix(quote)?;
    let mut result = String::new();
    let mut chars = body.char_indices();
    loop {
        match chars.next()? {
            (idx, c) if c == quote => return Some((result, &body[idx + c.len_utf8()..])),
            (_, '\\') if quote == '"' => match chars.next()? {
                (_, 'n') => result.push('\n'),
                (_, 't') => result.push('\t'),
                (_, '\\') => result.push('\\'),
                (_, '"') => result.push('"'),
                (_, c) => {
                    result.push('\\');
                    result.push(c);
                }
            },
            (_, c) => result.push(c),
        }
    }
}

fn bare(input: &str) -> String {
    let mut end = input.len();
    let mut prev_ws = true;
    for (idx, c) in input.char_indices() {
        if c == '#' && prev_ws {
            end = idx;
            break;
        }
        prev_ws = c.is_whitespace();
    }
    input[..end].trim().to_owned()
}

/// Parses a single non-blank, non-comment line.
fn parse_line(line: &str) -> std::result::Result<(String, String), String> {
    let (rest, key) = assignment(line).map_err(|_| "expected KEY=VALUE".to_owned())?;

    let value = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let (value, tail) =
                quoted(rest, q).ok_or_else(|| format!("unterminated {q}-quoted value"))?;
            let tail = tail.trim_start();
            if !tail.is_empty() && !tail.starts_with('#') {
                return Err(format!("unexpected text after quoted value: \"{tail}\""));
            }
            value
        }
        _ => bare(rest),
    };
    Ok((key.to_owned(), value))
}

/// Parses env-file content into ordered assignments.
///
/// Later assignments of the same key are kept; callers fold them so the
/// last one wins.
///
/// # Errors
///
/// Returns [`StackError::Parse`] naming `origin` and the 1-based line
/// number of the first malformed line.
pub fn parse_env_file(content: &str, origin: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r').trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_line(line).map_err(|message| {
            StackError::parse(format!("{origin}:{}", idx + 1), message)
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Vec<(String, String)> {
        parse_env_file(content, ".env").expect("should parse")
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_owned(), v.to_owned())
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let entries = parse("# header\n\nPOSTGRES_USER=app\n   # indented comment\n");
        assert_eq!(entries, vec![pair("POSTGRES_USER", "app")]);
    }

    #[test]
    fn bare_values_are_trimmed_and_lose_trailing_comments() {
        let entries = parse("A = hello world  # note\nB=pass#word\nC=\n");
        assert_eq!(
            entries,
            vec![pair("A", "hello world"), pair("B", "pass#word"), pair("C", "")]
        );
    }

    #[test]
    fn quoted_values() {
        let entries = parse(
            "SINGLE='${NOT_EXPANDED} # kept'\nDOUBLE=\"line1\\nline2\" # comment\nESC=\"say \\\"hi\\\"\"\n",
        );
        assert_eq!(
            entries,
            vec![
                pair("SINGLE", "${NOT_EXPANDED} # kept"),
                pair("DOUBLE", "line1\nline2"),
                pair("ESC", "say \"hi\""),
            ]
        );
    }

    #[test]
    fn export_prefix_and_crlf() {
        let entries = parse("export API_KEY=abc\r\nexport_DIR=/tmp\r\n");
        assert_eq!(
            entries,
            vec![pair("API_KEY", "abc"), pair("export_DIR", "/tmp")]
        );
    }

    #[test]
    fn duplicate_keys_are_kept_in_order() {
        let entries = parse("A=1\nA=2\n");
        assert_eq!(entries, vec![pair("A", "1"), pair("A", "2")]);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = parse_env_file("A=1\nnot an assignment\n", "prod.env").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("prod.env:2"), "got: {msg}");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let err = parse_env_file("A=\"open\n", ".env").unwrap_err();
        assert!(err.to_string().contains("unterminated"), "got: {err}");
    }

    #[test]
    fn text_after_quoted_value_is_an_error() {
        assert!(parse_env_file("A='x' y\n", ".env").is_err());
    }
}
