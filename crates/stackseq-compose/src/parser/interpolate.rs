//! Variable interpolation templates built on `nom`.
//!
//! Recognised markers:
//! - `${NAME}` and `$NAME`: value of `NAME`, an error when unset;
//! - `${NAME:-default}`: `default` when `NAME` is unset or empty;
//! - `${NAME-default}`: `default` when `NAME` is unset;
//! - `${NAME:?message}` / `${NAME?message}`: error carrying `message`
//!   when `NAME` is unset (or empty, for the `:?` form);
//! - `$$`: a literal `$`.
//!
//! Markers do not nest; a `${` inside a modifier is malformed.
//!
//! Substitution is a single textual pass: substituted text is never
//! scanned for further markers.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_till1, take_while},
    character::complete::{char, satisfy},
    combinator::{cut, map, opt, recognize, value, verify},
    multi::many0,
    sequence::{pair, preceded, terminated},
};

/// How a marker behaves when its variable is unset or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    /// `:-default`
    DefaultIfUnsetOrEmpty(String),
    /// `-default`
    DefaultIfUnset(String),
    /// `:?message`
    RequiredNonEmpty(String),
    /// `?message`
    Required(String),
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Text copied verbatim.
    Literal(&'a str),
    /// A `$$` escape.
    Dollar,
    /// A variable marker.
    Variable {
        /// Variable name.
        name: &'a str,
        /// Optional default/required modifier.
        modifier: Option<Modifier>,
    },
}

/// Why a template could not be expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    /// The template is syntactically invalid.
    Malformed(String),
    /// A required variable is unset.
    Missing {
        /// Variable name.
        variable: String,
        /// Message from a `?` modifier, if any.
        message: Option<String>,
    },
}

const fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_name_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn name(input: &str) -> IResult<&str, &str> {
    recognize(pair(satisfy(is_name_start), take_while(is_name_continue))).parse(input)
}

fn modifier(input: &str) -> IResult<&str, Modifier> {
    // Markers do not nest: `${A:-${B}}` is malformed.
    let rest = || {
        map(
            verify(take_till(|c: char| c == '}'), |s: &str| !s.contains("${")),
            str::to_owned,
        )
    };
    alt((
        map(preceded(tag(":-"), rest()), Modifier::DefaultIfUnsetOrEmpty),
        map(preceded(tag(":?"), rest()), Modifier::RequiredNonEmpty),
        map(preceded(char('-'), rest()), Modifier::DefaultIfUnset),
        map(preceded(char('?'), rest()), Modifier::Required),
    ))
    .parse(input)
}

fn braced(input: &str) -> IResult<&str, Segment<'_>> {
    let body = map(terminated(pair(name, opt(modifier)), char('}')), |(name, modifier)| {
        Segment::Variable { name, modifier }
    });
    preceded(tag("${"), cut(body)).parse(input)
}

fn unbraced(input: &str) -> IResult<&str, Segment<'_>> {
    map(preceded(char('$'), name), |name| Segment::Variable {
        name,
        modifier: None,
    })
    .parse(input)
}

fn segment(input: &str) -> IResult<&str, Segment<'_>> {
    alt((
        value(Segment::Dollar, tag("$$")),
        braced,
        unbraced,
        map(tag("$"), Segment::Literal),
        map(take_till1(|c: char| c == '$'), Segment::Literal),
    ))
    .parse(input)
}

/// Splits a template into literal and marker segments.
///
/// # Errors
///
/// Returns [`InterpolationError::Malformed`] for an unterminated or
/// invalid `${...}` marker.
pub fn parse_template(input: &str) -> Result<Vec<Segment<'_>>, InterpolationError> {
    match many0(segment).parse(input) {
        Ok(("", segments)) => Ok(segments),
        Ok((rest, _)) => Err(malformed(input, rest)),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(malformed(input, e.input)),
        Err(nom::Err::Incomplete(_)) => Err(InterpolationError::Malformed(format!(
            "incomplete interpolation in \"{input}\""
        ))),
    }
}

fn malformed(input: &str, rest: &str) -> InterpolationError {
    let offset = input.len() - rest.len();
    InterpolationError::Malformed(format!(
        "invalid interpolation in \"{input}\" at offset {offset}"
    ))
}

/// Returns `true` if `input` contains anything other than plain text.
#[must_use]
pub fn has_markers(input: &str) -> bool {
    input.contains('$')
}

/// Expands every marker in `input` using `lookup`.
///
/// # Errors
///
/// Returns an error for malformed templates and for unset variables
/// without a default.
pub fn interpolate<'v>(
    input: &str,
    lookup: impl Fn(&str) -> Option<&'v str>,
) -> Result<String, InterpolationError> {
    if !has_markers(input) {
        return Ok(input.to_owned());
    }
    let mut out = String::with_capacity(input.len());
    for segment in parse_template(input)? {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Dollar => out.push('$'),
            Segment::Variable { name, modifier } => {
                out.push_str(&expand(name, modifier, lookup(name))?);
            }
        }
    }
    Ok(out)
}

fn expand(
    name: &str,
    modifier: Option<Modifier>,
    found: Option<&str>,
) -> Result<String, InterpolationError> {
    let missing = |message: Option<String>| InterpolationError::Missing {
        variable: name.to_owned(),
        message: message.filter(|m| !m.is_empty()),
    };
    match (modifier, found) {
        (None, Some(v)) => Ok(v.to_owned()),
        (None, None) => Err(missing(None)),
        (Some(Modifier::DefaultIfUnsetOrEmpty(default)), v) => Ok(match v {
            Some(v) if !v.is_empty() => v.to_owned(),
            _ => default,
        }),
        (Some(Modifier::DefaultIfUnset(default)), v) => Ok(v.map_or(default, str::to_owned)),
        (Some(Modifier::RequiredNonEmpty(message)), v) => match v {
            Some(v) if !v.is_empty() => Ok(v.to_owned()),
            _ => Err(missing(Some(message))),
        },
        (Some(Modifier::Required(message)), v) => v.map(str::to_owned).ok_or_else(|| missing(Some(message))),
    }
}
