//! Loader for the INI-style configuration files that describe a chip setup
//!
//! ```text
//! [id0]
//! ICR0 = 0x0015            ; instant command registers by name
//! LVDS_STRENGTH = 6        # any GCR field
//!
//! [controller_id0]
//! setTxDataEnable = 0xffff
//! ```
//!
//! Values follow C `strtol` notation, `0x` prefixed hex, leading `0` octal and decimal otherwise.
use crate::Error;
use nom::{
    branch::alt,
    bytes::complete::{
        tag_no_case,
        take_till,
        take_till1,
    },
    character::complete::{
        char,
        digit1,
        hex_digit1,
        oct_digit1,
        one_of,
        space0,
    },
    combinator::{
        all_consuming,
        eof,
        map,
        map_res,
        opt,
        rest,
        success,
    },
    sequence::{
        delimited,
        preceded,
        separated_pair,
        terminated,
    },
    IResult,
};

/// A single `key = value` line of a configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub section: String,
    pub key: String,
    pub value: u32,
    /// One-based line number, for error reporting
    pub line: usize,
}

#[derive(Clone)]
enum Line<'a> {
    Blank,
    Section(&'a str),
    Pair(&'a str, &'a str),
}

fn is_comment_start(c: char) -> bool {
    c == ';' || c == '#'
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(one_of(";#"), rest)(input)
}

fn section(input: &str) -> IResult<&str, &str> {
    map(delimited(char('['), take_till1(|c: char| c == ']'), char(']')), str::trim)(input)
}

fn pair(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        map(take_till1(|c: char| c == '=' || is_comment_start(c)), str::trim),
        char('='),
        map(take_till(is_comment_start), str::trim),
    )(input)
}

fn line(input: &str) -> IResult<&str, Line<'_>> {
    all_consuming(delimited(
        space0,
        alt((
            map(section, Line::Section),
            map(pair, |(k, v)| Line::Pair(k, v)),
            success(Line::Blank),
        )),
        preceded(space0, opt(comment)),
    ))(input)
}

fn number(input: &str) -> IResult<&str, u32> {
    terminated(
        alt((
            map_res(preceded(tag_no_case("0x"), hex_digit1), |s| {
                u32::from_str_radix(s, 16)
            }),
            map_res(preceded(char('0'), oct_digit1), |s| u32::from_str_radix(s, 8)),
            map_res(digit1, str::parse::<u32>),
        )),
        eof,
    )(input)
}

/// Parse an integer the way `strtol` with base 0 would
#[must_use]
pub fn parse_value(s: &str) -> Option<u32> {
    number(s.trim()).ok().map(|(_, v)| v)
}

/// Walk every entry of `text` in order, handing each one to `f`. Stops at the first error,
/// whether it comes from the text itself or from `f`.
/// # Errors
/// Returns an error on malformed text or whatever `f` returns
pub fn for_each_entry<F>(text: &str, mut f: F) -> crate::Result<()>
where
    F: FnMut(Entry) -> crate::Result<()>,
{
    let mut current: Option<&str> = None;
    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let bad = |reason: &str| Error::Config {
            line: line_no,
            reason: reason.to_owned(),
        };
        let (_, parsed) = line(raw).map_err(|_| bad("malformed line"))?;
        match parsed {
            Line::Blank => {}
            Line::Section(name) => current = Some(name),
            Line::Pair(key, value) => {
                let section = current.ok_or_else(|| bad("entry outside of any section"))?;
                let value = parse_value(value)
                    .ok_or_else(|| bad(&format!("`{value}` is not an integer")))?;
                f(Entry {
                    section: section.to_owned(),
                    key: key.to_owned(),
                    value,
                    line: line_no,
                })?;
            }
        }
    }
    Ok(())
}

/// Collect every entry of `text`
/// # Errors
/// Returns an error on malformed text
pub fn parse(text: &str) -> crate::Result<Vec<Entry>> {
    let mut entries = vec![];
    for_each_entry(text, |entry| {
        entries.push(entry);
        Ok(())
    })?;
    Ok(entries)
}
