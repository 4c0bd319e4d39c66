//! Parsers for colon separated directory database lines.

use super::ParseError;

/// Fields of a `passwd` line.
pub const PASSWD_FIELDS: usize = 7;

/// Fields of a `group` line.
pub const GROUP_FIELDS: usize = 4;

/// Splits `line` into exactly `N` colon separated fields.
///
/// # Errors
///
/// If the field count differs.
pub fn fields<const N: usize>(line: &str) -> Result<[&str; N], ParseError> {
    let line = line.trim_end_matches('\n');
    let split: Vec<&str> = line.split(':').collect();
    <[&str; N]>::try_from(split.as_slice()).map_err(|_| ParseError::FieldCount {
        expected: N,
        found: split.len(),
        line: line.to_owned(),
    })
}

/// Takes the single line a keyed `getent` lookup prints.
///
/// # Errors
///
/// If there is no line or more than one.
pub fn single_line(output: &str) -> Result<&str, ParseError> {
    let mut lines = output.lines().filter(|line| !line.is_empty());
    match (lines.next(), lines.next()) {
        (Some(line), None) => Ok(line),
        (None, _) => Err(ParseError::Empty),
        (Some(_), Some(extra)) => Err(ParseError::Malformed(extra.to_owned())),
    }
}

/// Member list of a group line.
#[must_use]
pub fn members(field: &str) -> Vec<String> {
    field
        .split(',')
        .filter(|member| !member.is_empty())
        .map(str::to_owned)
        .collect()
}
